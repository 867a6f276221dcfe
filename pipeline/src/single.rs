use crate::error::Truncated;
use crate::frame::Frame;
use bbox::Detection;
use std::sync::{Mutex, MutexGuard};

/// One class of one detection as shown by the single-slot overlay, in frame
/// pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveStat {
    pub class: usize,
    /// Percent.
    pub probability: f32,
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

/// Expand detections into one stat per class above `threshold`, keeping at
/// most `max` of them.
pub fn live_stats(
    detections: &[Detection],
    threshold: f32,
    width: usize,
    height: usize,
    max: usize,
) -> (Vec<LiveStat>, Option<Truncated>) {
    let (w, h) = (width as f32, height as f32);
    let mut stats = vec![];
    let mut total = 0;

    for det in detections {
        let ((x1, y1), (x2, y2)) = det.bbox.coordinate();
        for class in det.classes_above(threshold) {
            total += 1;
            if stats.len() == max {
                continue;
            }
            stats.push(LiveStat {
                class,
                probability: det.prob[class] * 100.,
                left: (x1 * w) as i64,
                top: (y1 * h) as i64,
                right: (x2 * w) as i64,
                bottom: (y2 * h) as i64,
            });
        }
    }

    let truncated = if total > stats.len() {
        Some(Truncated {
            kept: stats.len(),
            dropped: total - stats.len(),
        })
    } else {
        None
    };
    (stats, truncated)
}

/// Everything the single-slot chain handler and worker exchange.
#[derive(Debug)]
pub struct SingleState {
    /// Last captured camera frame.
    pub image: Frame,
    pub sequence: u64,
    pub detections: Vec<Detection>,
    pub stats: Vec<LiveStat>,
    pub caption: String,
    pub layer_image: Option<Frame>,
    pub published: bool,
}

/// One shared image behind a single lock.
///
/// Both threads hold the lock only to copy in or out; the worker never holds
/// it while inferring.
pub struct SingleSlot {
    state: Mutex<SingleState>,
}

impl SingleSlot {
    pub fn new(width: usize, height: usize) -> Self {
        SingleSlot {
            state: Mutex::new(SingleState {
                image: Frame::new(width, height),
                sequence: 0,
                detections: vec![],
                stats: vec![],
                caption: String::new(),
                layer_image: None,
                published: false,
            }),
        }
    }

    /// A poisoned lock only means the other side panicked mid-copy; the
    /// frame data is still well formed.
    pub fn lock(&self) -> MutexGuard<'_, SingleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy the newest image into `dst` if it is newer than `since`.
    pub fn take_image(&self, since: u64, dst: &mut Frame) -> Option<u64> {
        let state = self.lock();
        if state.sequence <= since || state.image.dimensions() != dst.dimensions() {
            return None;
        }
        dst.data_mut().copy_from_slice(state.image.data());
        Some(state.sequence)
    }

    pub fn publish(
        &self,
        detections: Vec<Detection>,
        stats: Vec<LiveStat>,
        caption: String,
        layer_image: Option<Frame>,
    ) {
        let mut state = self.lock();
        state.detections = detections;
        state.stats = stats;
        state.caption = caption;
        state.layer_image = layer_image;
        state.published = true;
    }
}
