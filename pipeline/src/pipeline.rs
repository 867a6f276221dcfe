use crate::chain::ChainHandler;
pub use crate::chain::ChainOutcome;
use crate::config::{PipelineConfig, PipelineMode};
use crate::draw::Painter;
use crate::engine::DetectionEngine;
use crate::error::{PipelineError, Result};
use crate::frame::PixelLayout;
use crate::labels::Labels;
use crate::ring::FrameRing;
use crate::single::SingleSlot;
use crate::worker::{DetectionWorker, WorkerHandle};
use bbox::Detection;
use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How frames are handed between the two threads.
pub(crate) enum Exchange {
    Ring(FrameRing),
    Single(SingleSlot),
}

/// State both threads touch.
pub(crate) struct Shared {
    pub(crate) exchange: Exchange,
    /// Set by the worker when it gave up under the pass-through policy.
    pub(crate) passthrough: AtomicBool,
    cycles: AtomicU64,
    last_cycle_nanos: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        config: &PipelineConfig,
        width: usize,
        height: usize,
        (net_w, net_h): (usize, usize),
    ) -> Self {
        let exchange = match config.mode {
            PipelineMode::Ring => {
                Exchange::Ring(FrameRing::new(config.frames, width, height, net_w, net_h))
            }
            PipelineMode::Single => Exchange::Single(SingleSlot::new(width, height)),
        };
        Shared {
            exchange,
            passthrough: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            last_cycle_nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_cycle(&self, elapsed: Duration) {
        self.last_cycle_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// One element instance's detection pipeline, built once the frame size is
/// known and torn down at stream stop.
pub struct Pipeline {
    config: PipelineConfig,
    width: usize,
    height: usize,
    shared: Arc<Shared>,
    chain: ChainHandler,
    worker: Option<DetectionWorker>,
    handle: Option<WorkerHandle>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        mut labels: Labels,
        painter: Painter,
        width: usize,
        height: usize,
        engine: Box<dyn DetectionEngine>,
    ) -> Result<Self> {
        config.validate()?;
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "cannot process {}x{} frames",
                width, height
            )));
        }
        labels.fit_to(engine.class_count())?;

        let labels = Arc::new(labels);
        let painter = Arc::new(painter);
        let shared = Arc::new(Shared::new(&config, width, height, engine.input_size()));
        let chain = ChainHandler::new(&config, labels.clone(), painter.clone(), width, height);

        info!(
            "{:?} pipeline for {}x{} frames, network input {:?}, {} classes, {} slots",
            config.mode,
            width,
            height,
            engine.input_size(),
            engine.class_count(),
            config.slot_count()
        );

        let worker = DetectionWorker::new(
            engine,
            config.clone(),
            shared.clone(),
            labels,
            painter,
            width,
            height,
        );

        Ok(Pipeline {
            config,
            width,
            height,
            shared,
            chain,
            worker: Some(worker),
            handle: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Frame size is fixed for the lifetime of the pipeline.
    pub fn check_dimensions(&self, width: usize, height: usize) -> Result<()> {
        if (width, height) != (self.width, self.height) {
            return Err(PipelineError::ResolutionChange {
                from: (self.width, self.height),
                to: (width, height),
            });
        }
        Ok(())
    }

    /// Start the detection thread.
    pub fn start(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            self.handle = Some(worker.spawn()?);
        }
        Ok(())
    }

    /// Take the worker to drive it by hand instead of starting the thread.
    pub fn take_worker(&mut self) -> Option<DetectionWorker> {
        self.worker.take()
    }

    pub fn chain(&mut self, pixels: &mut [u8], layout: PixelLayout, stride: usize) -> Result<ChainOutcome> {
        self.chain.handle(&self.shared, pixels, layout, stride)
    }

    /// Stop and join the detection thread.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
            info!("detection stopped after {} cycles", self.cycles());
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| h.is_running())
    }

    pub fn is_passthrough(&self) -> bool {
        self.shared.passthrough.load(Ordering::Acquire)
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Rate implied by the duration of the last detection cycle.
    pub fn detection_fps(&self) -> f64 {
        match self.shared.last_cycle_nanos.load(Ordering::Relaxed) {
            0 => 0.,
            nanos => 1e9 / nanos as f64,
        }
    }

    /// Detections behind the overlay currently served.
    pub fn latest_detections(&self) -> Vec<Detection> {
        match &self.shared.exchange {
            Exchange::Ring(ring) => ring.latest_detections().unwrap_or_default(),
            Exchange::Single(single) => single.lock().detections.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{row, ScriptedEngine};
    use crate::worker::CycleOutcome;
    use std::time::Instant;

    const WIDTH: usize = 64;
    const HEIGHT: usize = 48;
    const GRAY: u8 = 100;

    fn config(mode: PipelineMode) -> PipelineConfig {
        PipelineConfig {
            mode,
            throttle: 1,
            ..Default::default()
        }
    }

    fn new_pipeline(config: PipelineConfig, engine: ScriptedEngine) -> Pipeline {
        Pipeline::new(
            config,
            Labels::new(vec!["person".into()]),
            Painter::new(),
            WIDTH,
            HEIGHT,
            Box::new(engine),
        )
        .unwrap()
    }

    fn buffer() -> (Vec<u8>, usize) {
        let stride = PixelLayout::Bgr.default_stride(WIDTH);
        (vec![GRAY; stride * HEIGHT], stride)
    }

    fn bgr_at(pixels: &[u8], stride: usize, x: usize, y: usize) -> [u8; 3] {
        let p = &pixels[y * stride + x * 3..];
        [p[0], p[1], p[2]]
    }

    const MAGENTA: [u8; 3] = [255, 0, 255];

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_ring_smooths_detections() {
        init_logging();
        let confidence = [0.9, 0.9, 0.9, 0.6, 0.6];
        let mut engine = ScriptedEngine::new((32, 32), 1, row(0.5, 0.5, 0.2, 0.2, 0.));
        for c in confidence.iter() {
            engine = engine.then(Ok(row(0.5, 0.5, 0.2, 0.2, *c)));
        }
        let inputs = engine.inputs_seen.clone();
        let mut pipeline = new_pipeline(config(PipelineMode::Ring), engine);
        let mut worker = pipeline.take_worker().unwrap();

        let expected_means = [0.3, 0.6, 0.9, 0.8, 0.7];
        let mut outputs = vec![];
        for mean in expected_means.iter() {
            let (mut pixels, stride) = buffer();
            let outcome = pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap();
            outputs.push((outcome, pixels));

            assert!(matches!(worker.step(), Some(CycleOutcome::Published { .. })));
            let detections = pipeline.latest_detections();
            if *mean > 0.5 {
                assert_eq!(detections.len(), 1);
                assert!((detections[0].prob[0] - mean).abs() < 1e-5);
                let b = detections[0].bbox;
                assert!((b.x - 0.5).abs() < 1e-5 && (b.y - 0.5).abs() < 1e-5);
                assert!((b.width - 0.2).abs() < 1e-5);
                assert!((b.height - 0.2 * 32. / 24.).abs() < 1e-5);
            } else {
                assert!(detections.is_empty());
            }
        }
        assert_eq!(worker.step(), Some(CycleOutcome::Idle));
        assert_eq!(inputs.lock().unwrap().len(), 5);
        assert_eq!(pipeline.cycles(), 5);

        // nothing published before the first buffer
        assert_eq!(outputs[0].0, ChainOutcome::Passthrough);
        assert!(outputs[0].1.iter().all(|p| *p == GRAY));
        // first cycle is below threshold: plain frame
        assert_eq!(outputs[1].0, ChainOutcome::Annotated { slot: 0 });
        assert!(outputs[1].1.iter().all(|p| *p == GRAY));

        // box (25, 17) - (38, 30) from the second cycle onward
        let stride = PixelLayout::Bgr.default_stride(WIDTH);
        for (i, (outcome, pixels)) in outputs.iter().enumerate().skip(2) {
            assert_eq!(*outcome, ChainOutcome::Annotated { slot: (i - 1) % 3 });
            assert_eq!(bgr_at(pixels, stride, 25, 24), MAGENTA);
            assert_eq!(bgr_at(pixels, stride, 38, 24), MAGENTA);
            assert_eq!(bgr_at(pixels, stride, 30, 17), MAGENTA);
            assert_eq!(bgr_at(pixels, stride, 30, 30), MAGENTA);
            assert_eq!(bgr_at(pixels, stride, 30, 24), [GRAY; 3]);
            assert_eq!(bgr_at(pixels, stride, 24, 24), [GRAY; 3]);
        }
    }

    #[test]
    fn test_fading_box_keeps_its_position() {
        let mut engine = ScriptedEngine::new((32, 32), 1, row(0., 0., 0., 0., 0.));
        for _ in 0..3 {
            engine = engine.then(Ok(row(0.6, 0.5, 0.2, 0.2, 0.9)));
        }
        let mut pipeline = new_pipeline(config(PipelineMode::Ring), engine);
        let mut worker = pipeline.take_worker().unwrap();

        // the object is gone from the fourth cycle on
        let expected_means = [0.3, 0.6, 0.9, 0.6, 0.3];
        for mean in expected_means.iter() {
            let (mut pixels, stride) = buffer();
            pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap();
            assert!(matches!(worker.step(), Some(CycleOutcome::Published { .. })));

            let detections = pipeline.latest_detections();
            if *mean > 0.5 {
                assert_eq!(detections.len(), 1);
                assert!((detections[0].prob[0] - mean).abs() < 1e-5);
                let b = detections[0].bbox;
                assert!((b.x - 0.6).abs() < 1e-5, "x = {}", b.x);
                assert!((b.y - 0.5).abs() < 1e-5, "y = {}", b.y);
                assert!((b.width - 0.2).abs() < 1e-5);
            } else {
                assert!(detections.is_empty());
            }
        }
    }

    #[test]
    fn test_network_input_is_letterboxed() {
        let engine = ScriptedEngine::new((32, 32), 1, row(0.5, 0.5, 0.2, 0.2, 0.));
        let inputs = engine.inputs_seen.clone();
        let mut pipeline = new_pipeline(config(PipelineMode::Ring), engine);
        let mut worker = pipeline.take_worker().unwrap();
        let (mut pixels, stride) = buffer();

        pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap();
        worker.step();

        let inputs = inputs.lock().unwrap();
        assert_eq!(inputs[0].dimensions(), (32, 32));
        assert_eq!(inputs[0].pixel(16, 0, 0), crate::frame::LETTERBOX_FILL);
        assert!((inputs[0].pixel(16, 16, 0) - GRAY as f32 / 255.).abs() < 1e-5);
    }

    #[test]
    fn test_threaded_worker_serves_complete_annotations() {
        init_logging();
        let engine = ScriptedEngine::new((32, 32), 1, row(0.5, 0.5, 0.2, 0.2, 0.9));
        let mut pipeline = new_pipeline(config(PipelineMode::Ring), engine);
        pipeline.start().unwrap();
        assert!(pipeline.is_running());

        let stride = PixelLayout::Bgr.default_stride(WIDTH);
        let edges = [(25, 24), (38, 24), (30, 17), (30, 30)];
        let deadline = Instant::now() + Duration::from_secs(10);
        while pipeline.cycles() < 3 && Instant::now() < deadline {
            let (mut pixels, _) = buffer();
            if let ChainOutcome::Annotated { slot } =
                pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap()
            {
                assert!(slot < 3);
                let drawn = edges
                    .iter()
                    .filter(|(x, y)| bgr_at(&pixels, stride, *x, *y) == MAGENTA)
                    .count();
                assert!(drawn == 0 || drawn == edges.len(), "partial overlay");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(pipeline.cycles() >= 3);

        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(pipeline.detection_fps() > 0.);

        let (mut pixels, _) = buffer();
        assert!(matches!(
            pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap(),
            ChainOutcome::Annotated { .. }
        ));
        assert_eq!(bgr_at(&pixels, stride, 25, 24), MAGENTA);
    }

    #[test]
    fn test_single_slot_draws_live_stats() {
        let engine = ScriptedEngine::new((32, 32), 1, row(0.5, 0.5, 0.2, 0.2, 0.9));
        let inputs = engine.inputs_seen.clone();
        let mut pipeline = new_pipeline(config(PipelineMode::Single), engine);
        let mut worker = pipeline.take_worker().unwrap();
        let stride = PixelLayout::Bgr.default_stride(WIDTH);

        let (mut pixels, _) = buffer();
        assert_eq!(
            pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap(),
            ChainOutcome::Passthrough
        );
        assert!(matches!(worker.step(), Some(CycleOutcome::Published { detections: 1, .. })));
        // stretched, no letterbox padding
        assert!(inputs.lock().unwrap()[0]
            .data()
            .iter()
            .all(|v| (*v - GRAY as f32 / 255.).abs() < 1e-5));

        let (mut pixels, _) = buffer();
        assert_eq!(
            pipeline.chain(&mut pixels, PixelLayout::Bgr, stride).unwrap(),
            ChainOutcome::Annotated { slot: 0 }
        );
        // (25, 19) - (38, 28), two pixels wide
        assert_eq!(bgr_at(&pixels, stride, 25, 24), MAGENTA);
        assert_eq!(bgr_at(&pixels, stride, 26, 24), MAGENTA);
        assert_eq!(bgr_at(&pixels, stride, 27, 24), [GRAY; 3]);
        assert_eq!(bgr_at(&pixels, stride, 30, 28), MAGENTA);

        let detections = pipeline.latest_detections();
        assert_eq!(detections.len(), 1);
        assert!((detections[0].prob[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_resolution_is_fixed() {
        let engine = ScriptedEngine::new((32, 32), 1, row(0.5, 0.5, 0.2, 0.2, 0.9));
        let pipeline = new_pipeline(config(PipelineMode::Ring), engine);

        assert!(pipeline.check_dimensions(WIDTH, HEIGHT).is_ok());
        assert!(matches!(
            pipeline.check_dimensions(32, 32),
            Err(PipelineError::ResolutionChange {
                from: (64, 48),
                to: (32, 32)
            })
        ));
    }

    #[test]
    fn test_labels_must_cover_classes() {
        let engine = ScriptedEngine::new((32, 32), 2, vec![0.; 7]);
        let result = Pipeline::new(
            config(PipelineMode::Ring),
            Labels::new(vec!["person".into()]),
            Painter::new(),
            WIDTH,
            HEIGHT,
            Box::new(engine),
        );
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
