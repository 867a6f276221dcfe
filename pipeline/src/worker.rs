use crate::average::RunningAverage;
use crate::config::{FailurePolicy, PipelineConfig, PipelineMode};
use crate::draw::Painter;
use crate::engine::{truncate_detections, DetectionEngine};
use crate::error::{PipelineError, Result, Truncated};
use crate::frame::Frame;
use crate::labels::Labels;
use crate::pipeline::{Exchange, Shared};
use crate::ring::FrameRing;
use crate::single::{live_stats, SingleSlot};
use bbox::{do_nms_sort, Detection};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pause after a cycle that found no new frame.
const IDLE_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No frame arrived since the last cycle.
    Idle,
    /// Inference failed and the previous annotation stays in place.
    Skipped,
    Published {
        slot: usize,
        detections: usize,
        elapsed: Duration,
        truncated: Option<Truncated>,
    },
}

/// The background half of the pipeline: takes the newest frame, runs the
/// engine, averages, decodes, draws and publishes.
pub struct DetectionWorker {
    engine: Box<dyn DetectionEngine>,
    config: PipelineConfig,
    shared: Arc<Shared>,
    labels: Arc<Labels>,
    painter: Arc<Painter>,
    average: Option<RunningAverage>,
    frame: Frame,
    input: Frame,
    /// Next annotated slot to draw.
    cursor: usize,
    cycle: usize,
    last_sequence: u64,
    layer: Option<usize>,
}

impl DetectionWorker {
    pub(crate) fn new(
        engine: Box<dyn DetectionEngine>,
        config: PipelineConfig,
        shared: Arc<Shared>,
        labels: Arc<Labels>,
        painter: Arc<Painter>,
        width: usize,
        height: usize,
    ) -> Self {
        let (net_w, net_h) = engine.input_size();
        let average = match config.mode {
            PipelineMode::Ring => Some(RunningAverage::new(config.frames, engine.outputs().len())),
            PipelineMode::Single => None,
        };

        let layer = match config.layer {
            Some(layer) if config.mode != PipelineMode::Single => {
                warn!("layer {} is only shown in single-slot mode, ignoring", layer);
                None
            }
            Some(layer) if layer >= engine.layer_count() => {
                warn!(
                    "layer {} out of range, network has {} layers",
                    layer,
                    engine.layer_count()
                );
                None
            }
            layer => layer,
        };

        DetectionWorker {
            engine,
            config,
            shared,
            labels,
            painter,
            average,
            frame: Frame::new(width, height),
            input: Frame::new(net_w, net_h),
            cursor: 0,
            cycle: 0,
            last_sequence: 0,
            layer,
        }
    }

    pub fn cycles(&self) -> usize {
        self.cycle
    }

    /// One pass of the detection loop.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let shared = Arc::clone(&self.shared);
        match &shared.exchange {
            Exchange::Ring(ring) => self.ring_cycle(ring),
            Exchange::Single(single) => self.single_cycle(single),
        }
    }

    /// Run one cycle and apply the failure policy. Returns `None` once the
    /// worker has to stop.
    pub fn step(&mut self) -> Option<CycleOutcome> {
        match self.run_cycle() {
            Ok(outcome) => {
                if let CycleOutcome::Published {
                    truncated: Some(truncated),
                    ..
                } = &outcome
                {
                    warn!("{}", truncated);
                }
                Some(outcome)
            }
            Err(err) => match self.config.failure_policy {
                FailurePolicy::SkipCycle => {
                    warn!("detection cycle skipped: {}", err);
                    Some(CycleOutcome::Skipped)
                }
                FailurePolicy::PassThrough => {
                    error!("detection stopped, forwarding raw frames: {}", err);
                    self.shared.passthrough.store(true, Ordering::Release);
                    None
                }
            },
        }
    }

    pub fn run(mut self, token: CancellationToken) {
        debug!("detection loop started");
        while !token.is_cancelled() {
            match self.step() {
                Some(CycleOutcome::Idle) => thread::sleep(IDLE_PAUSE),
                Some(_) => thread::sleep(self.config.cycle_pause),
                None => break,
            }
        }
        debug!("detection loop finished after {} cycles", self.cycle);
    }

    pub fn spawn(self) -> Result<WorkerHandle> {
        let token = CancellationToken::new();
        let child = token.clone();
        let thread = thread::Builder::new()
            .name("yolo-detect".into())
            .spawn(move || self.run(child))
            .map_err(PipelineError::Spawn)?;

        Ok(WorkerHandle {
            token,
            thread: Some(thread),
        })
    }

    fn ring_cycle(&mut self, ring: &FrameRing) -> Result<CycleOutcome> {
        let (sequence, geometry) =
            match ring.take_latest(self.last_sequence, &mut self.frame, &mut self.input)? {
                Some(taken) => taken,
                None => return Ok(CycleOutcome::Idle),
            };
        self.last_sequence = sequence;
        let start = Instant::now();

        self.engine.infer(&self.input)?;
        if let Some(average) = self.average.as_mut() {
            average.record(self.cycle, self.engine.outputs())?;
            let mean = average.compute_region_mean(self.engine.class_count())?;
            let outputs = self.engine.outputs_mut();
            if outputs.len() != mean.len() {
                return Err(PipelineError::MalformedOutput(format!(
                    "output buffer resized from {} to {}",
                    mean.len(),
                    outputs.len()
                )));
            }
            outputs.copy_from_slice(mean);
        }
        self.cycle += 1;

        let mut detections = self.engine.decode_boxes(Some(&geometry), self.config.threshold)?;
        if !detections.is_empty() {
            do_nms_sort(&mut detections, self.engine.class_count(), self.config.nms);
        }
        let truncated = truncate_detections(&mut detections, self.config.max_detections);

        let slot = self.cursor;
        let count = detections.len();
        let elapsed = {
            let mut annotated = ring.annotation_slot(slot);
            annotated.frame.copy_from(&self.frame)?;
            self.painter.draw_detections(
                &mut annotated.frame,
                &detections,
                self.config.threshold,
                &self.labels,
            );
            let elapsed = start.elapsed();
            self.report(&detections, elapsed);
            annotated.sequence = sequence;
            annotated.detections = detections;
            elapsed
        };
        ring.publish(slot);
        self.cursor = (slot + 1) % ring.capacity();
        self.shared.record_cycle(elapsed);

        Ok(CycleOutcome::Published {
            slot,
            detections: count,
            elapsed,
            truncated,
        })
    }

    fn single_cycle(&mut self, single: &SingleSlot) -> Result<CycleOutcome> {
        let sequence = match single.take_image(self.last_sequence, &mut self.frame) {
            Some(sequence) => sequence,
            None => return Ok(CycleOutcome::Idle),
        };
        self.last_sequence = sequence;
        let start = Instant::now();

        self.frame.resize_into(&mut self.input);
        self.engine.infer(&self.input)?;
        self.cycle += 1;

        let mut detections = self.engine.decode_boxes(None, self.config.threshold)?;
        if !detections.is_empty() {
            do_nms_sort(&mut detections, self.engine.class_count(), self.config.nms);
        }
        let (width, height) = self.frame.dimensions();
        let (stats, truncated) = live_stats(
            &detections,
            self.config.threshold,
            width,
            height,
            self.config.max_detections,
        );

        let layer_image = match self.layer {
            Some(layer) => self.engine.layer_image(layer)?.map(|image| {
                let mut resized = Frame::new(width, height);
                image.resize_into(&mut resized);
                resized
            }),
            None => None,
        };

        let elapsed = start.elapsed();
        let secs = elapsed.as_secs_f64();
        let caption = format!("{:.2} sec, {:.2} fps", secs, 1. / secs.max(f64::EPSILON));
        self.report(&detections, elapsed);
        self.shared.record_cycle(elapsed);

        let count = detections.len();
        single.publish(detections, stats, caption, layer_image);

        Ok(CycleOutcome::Published {
            slot: 0,
            detections: count,
            elapsed,
            truncated,
        })
    }

    /// `"dog: 87% car: 64% 2 objects detected in 0.12 seconds, fps= 8.33"`
    fn report(&self, detections: &[Detection], elapsed: Duration) {
        let threshold = self.config.threshold;
        let mut line = String::new();
        let mut count = 0;
        for det in detections {
            for class in det.classes_above(threshold) {
                line.push_str(&format!(
                    "{}: {:.0}% ",
                    self.labels.name(class),
                    det.prob[class] * 100.
                ));
                count += 1;
            }
        }
        let secs = elapsed.as_secs_f64();
        line.push_str(&format!(
            "{} objects detected in {:.2} seconds, fps= {:.2}",
            count,
            secs,
            1. / secs.max(f64::EPSILON)
        ));

        if self.config.verbose {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }
}

/// The running detection thread. Dropping the handle stops and joins it.
pub struct WorkerHandle {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.thread.is_some() && !self.token.is_cancelled()
    }

    /// Cancel the loop and wait for the current cycle to finish.
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("detection thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
