use crate::config::{PipelineConfig, TextStyle};
use crate::draw::Painter;
use crate::error::Result;
use crate::frame::{Frame, PixelLayout};
use crate::labels::Labels;
use crate::pipeline::{Exchange, Shared};
use crate::ring::FrameRing;
use crate::single::SingleSlot;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// What happened to one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Skipped by the throttle, left untouched.
    Throttled,
    /// Left untouched: nothing annotated yet, slot busy or detection stopped.
    Passthrough,
    /// Overwritten with the annotation from `slot`.
    Annotated { slot: usize },
}

/// Per-buffer entry point. Never waits for the detection worker.
pub struct ChainHandler {
    counter: u64,
    throttle: u64,
    caption: TextStyle,
    labels: Arc<Labels>,
    painter: Arc<Painter>,
    /// Single-slot work image, owned by the streaming thread.
    scratch: Frame,
}

impl ChainHandler {
    pub(crate) fn new(
        config: &PipelineConfig,
        labels: Arc<Labels>,
        painter: Arc<Painter>,
        width: usize,
        height: usize,
    ) -> Self {
        ChainHandler {
            counter: 0,
            throttle: config.throttle.max(1) as u64,
            caption: config.caption,
            labels,
            painter,
            scratch: Frame::new(width, height),
        }
    }

    pub(crate) fn handle(
        &mut self,
        shared: &Shared,
        pixels: &mut [u8],
        layout: PixelLayout,
        stride: usize,
    ) -> Result<ChainOutcome> {
        self.counter += 1;
        if (self.counter - 1) % self.throttle != 0 {
            return Ok(ChainOutcome::Throttled);
        }
        if shared.passthrough.load(Ordering::Acquire) {
            return Ok(ChainOutcome::Passthrough);
        }

        match &shared.exchange {
            Exchange::Ring(ring) => self.ring(ring, pixels, layout, stride),
            Exchange::Single(single) => self.single(single, pixels, layout, stride),
        }
    }

    fn ring(
        &mut self,
        ring: &FrameRing,
        pixels: &mut [u8],
        layout: PixelLayout,
        stride: usize,
    ) -> Result<ChainOutcome> {
        ring.capture(pixels, layout, stride)?;
        Ok(match ring.serve(pixels, layout, stride)? {
            Some(slot) => ChainOutcome::Annotated { slot },
            None => ChainOutcome::Passthrough,
        })
    }

    fn single(
        &mut self,
        single: &SingleSlot,
        pixels: &mut [u8],
        layout: PixelLayout,
        stride: usize,
    ) -> Result<ChainOutcome> {
        self.scratch.read_packed(pixels, layout, stride)?;

        let (stats, caption) = {
            let mut state = single.lock();
            state.image.copy_from(&self.scratch)?;
            state.sequence += 1;
            if !state.published {
                return Ok(ChainOutcome::Passthrough);
            }
            if let Some(layer) = &state.layer_image {
                self.scratch.copy_from(layer)?;
            }
            (state.stats.clone(), state.caption.clone())
        };

        self.painter
            .draw_caption(&mut self.scratch, &caption, &self.caption);
        self.painter
            .draw_stats(&mut self.scratch, &stats, &self.labels);
        self.scratch.write_packed(pixels, layout, stride)?;
        Ok(ChainOutcome::Annotated { slot: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineMode;
    use crate::pipeline::Shared;

    fn handler(throttle: u32) -> ChainHandler {
        let config = PipelineConfig {
            throttle,
            ..Default::default()
        };
        ChainHandler::new(
            &config,
            Arc::new(Labels::new(vec!["person".into()])),
            Arc::new(Painter::new()),
            4,
            2,
        )
    }

    #[test]
    fn test_throttle_processes_every_nth_buffer() {
        let shared = Shared::new(&PipelineConfig::default(), 4, 2, (4, 4));
        let mut chain = handler(2);
        let stride = PixelLayout::Bgr.default_stride(4);
        let mut pixels = vec![0u8; stride * 2];

        let outcomes: Vec<_> = (0..4)
            .map(|_| chain.handle(&shared, &mut pixels, PixelLayout::Bgr, stride).unwrap())
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ChainOutcome::Passthrough,
                ChainOutcome::Throttled,
                ChainOutcome::Passthrough,
                ChainOutcome::Throttled,
            ]
        );
        match &shared.exchange {
            Exchange::Ring(ring) => assert_eq!(ring.captured(), 2),
            Exchange::Single(_) => unreachable!(),
        }
    }

    #[test]
    fn test_single_slot_captures_before_first_publication() {
        let config = PipelineConfig {
            mode: PipelineMode::Single,
            ..Default::default()
        };
        let shared = Shared::new(&config, 4, 2, (4, 4));
        let mut chain = handler(1);
        let stride = PixelLayout::Bgr.default_stride(4);
        let mut pixels = vec![51u8; stride * 2];

        assert_eq!(
            chain.handle(&shared, &mut pixels, PixelLayout::Bgr, stride).unwrap(),
            ChainOutcome::Passthrough
        );
        match &shared.exchange {
            Exchange::Single(single) => {
                let state = single.lock();
                assert_eq!(state.sequence, 1);
                assert!((state.image.pixel(3, 1, 2) - 0.2).abs() < 1e-6);
            }
            Exchange::Ring(_) => unreachable!(),
        }
    }
}
