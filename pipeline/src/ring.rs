use crate::error::Result;
use crate::frame::{Frame, Letterbox, PixelLayout};
use bbox::Detection;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

/// A captured camera frame and its network input.
#[derive(Debug)]
pub struct RawSlot {
    pub frame: Frame,
    pub letterboxed: Frame,
    pub geometry: Letterbox,
    pub sequence: u64,
}

/// A camera frame with the detections of one cycle drawn on it.
#[derive(Debug)]
pub struct AnnotatedSlot {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    /// Sequence of the raw frame the annotation was drawn on.
    pub sequence: u64,
}

/// Fixed ring of raw and annotated frames.
///
/// Each slot has its own lock. The chain handler only ever `try_lock`s, so
/// it skips a slot the worker is busy with instead of waiting. Indices are
/// published through atomics after the slot lock is released.
pub struct FrameRing {
    raw: Vec<Mutex<RawSlot>>,
    annotated: Vec<Mutex<AnnotatedSlot>>,
    /// Next raw slot the chain handler writes.
    buff_index: AtomicUsize,
    /// Raw slot written most recently.
    latest: AtomicUsize,
    /// Number of frames captured so far.
    captured: AtomicU64,
    /// Annotated slot completed most recently.
    last_annotated: AtomicUsize,
    /// Number of annotations published so far.
    published: AtomicU64,
    width: usize,
    height: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn try_lock<T>(m: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match m.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl FrameRing {
    pub fn new(frames: usize, width: usize, height: usize, net_w: usize, net_h: usize) -> Self {
        let frames = frames.max(1);
        let raw = (0..frames)
            .map(|_| {
                Mutex::new(RawSlot {
                    frame: Frame::new(width, height),
                    letterboxed: Frame::new(net_w, net_h),
                    geometry: Letterbox::new(width, height, net_w, net_h),
                    sequence: 0,
                })
            })
            .collect();
        let annotated = (0..frames)
            .map(|_| {
                Mutex::new(AnnotatedSlot {
                    frame: Frame::new(width, height),
                    detections: vec![],
                    sequence: 0,
                })
            })
            .collect();

        FrameRing {
            raw,
            annotated,
            buff_index: AtomicUsize::new(0),
            latest: AtomicUsize::new(0),
            captured: AtomicU64::new(0),
            last_annotated: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            width,
            height,
        }
    }

    pub fn capacity(&self) -> usize {
        self.raw.len()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn buff_index(&self) -> usize {
        self.buff_index.load(Ordering::Acquire)
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Acquire)
    }

    /// Most recently completed annotation, `None` before the first one.
    pub fn last_annotated(&self) -> Option<usize> {
        if self.published.load(Ordering::Acquire) == 0 {
            None
        } else {
            Some(self.last_annotated.load(Ordering::Acquire))
        }
    }

    /// Convert a packed buffer into raw slot `buff_index`, letterbox it and
    /// advance `buff_index`. Returns the slot written, or `None` if the
    /// worker was holding it.
    pub fn capture(&self, pixels: &[u8], layout: PixelLayout, stride: usize) -> Result<Option<usize>> {
        let index = self.buff_index.load(Ordering::Acquire);
        let mut slot = match try_lock(&self.raw[index]) {
            Some(slot) => slot,
            None => return Ok(None),
        };

        slot.frame.read_packed(pixels, layout, stride)?;
        let RawSlot {
            frame,
            letterboxed,
            geometry,
            sequence,
        } = &mut *slot;
        *geometry = frame.letterbox_into(letterboxed);
        *sequence = self.captured.load(Ordering::Acquire) + 1;
        let sequence = *sequence;
        drop(slot);

        self.latest.store(index, Ordering::Release);
        self.captured.store(sequence, Ordering::Release);
        self.buff_index
            .store((index + 1) % self.capacity(), Ordering::Release);
        Ok(Some(index))
    }

    /// Copy the newest raw frame and its network input if it was captured
    /// after `since`. Returns its sequence and letterbox geometry.
    pub fn take_latest(
        &self,
        since: u64,
        frame: &mut Frame,
        letterboxed: &mut Frame,
    ) -> Result<Option<(u64, Letterbox)>> {
        if self.captured.load(Ordering::Acquire) <= since {
            return Ok(None);
        }
        let slot = lock(&self.raw[self.latest.load(Ordering::Acquire)]);
        if slot.sequence <= since {
            return Ok(None);
        }
        frame.copy_from(&slot.frame)?;
        letterboxed.copy_from(&slot.letterboxed)?;
        Ok(Some((slot.sequence, slot.geometry)))
    }

    /// Lock annotated slot `index` for drawing. Publish it afterwards with
    /// [`FrameRing::publish`], once the guard is dropped.
    pub fn annotation_slot(&self, index: usize) -> MutexGuard<'_, AnnotatedSlot> {
        lock(&self.annotated[index % self.capacity()])
    }

    pub fn publish(&self, index: usize) {
        self.last_annotated
            .store(index % self.capacity(), Ordering::Release);
        self.published.fetch_add(1, Ordering::AcqRel);
    }

    /// Write the last completed annotation into a packed buffer. Returns the
    /// slot served, or `None` if nothing is published yet or the slot is
    /// being redrawn.
    pub fn serve(&self, pixels: &mut [u8], layout: PixelLayout, stride: usize) -> Result<Option<usize>> {
        let index = match self.last_annotated() {
            Some(index) => index,
            None => return Ok(None),
        };
        let slot = match try_lock(&self.annotated[index]) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        slot.frame.write_packed(pixels, layout, stride)?;
        Ok(Some(index))
    }

    /// Detections drawn on the last completed annotation.
    pub fn latest_detections(&self) -> Option<Vec<Detection>> {
        let index = self.last_annotated()?;
        Some(lock(&self.annotated[index]).detections.clone())
    }
}
