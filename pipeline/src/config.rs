use crate::error::{PipelineError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FRAMES: usize = 3;
/// Largest ring the averaging history is allowed to allocate.
pub const MAX_FRAMES: usize = 64;
pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS: f32 = 0.4;
pub const DEFAULT_THROTTLE: u32 = 2;
pub const DEFAULT_MAX_DETECTIONS: usize = 100;
pub const DEFAULT_CYCLE_PAUSE: Duration = Duration::from_micros(10);

/// How frames travel between the chain handler and the detection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// `frames` raw/annotated slots, temporal averaging, boxes drawn by the
    /// worker.
    Ring,
    /// One image guarded by a single lock, no averaging, boxes and a timing
    /// caption drawn by the chain handler.
    Single,
}

/// What the worker does when inference fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and keep serving the previous annotation.
    SkipCycle,
    /// Stop the worker and forward raw frames unannotated.
    PassThrough,
}

/// Placement and look of the single-slot caption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStyle {
    pub x: i32,
    pub y: i32,
    pub scale: f64,
    pub thickness: i32,
    pub color: [u8; 3],
}

impl Default for TextStyle {
    fn default() -> Self {
        TextStyle {
            x: 20,
            y: 20,
            scale: 0.75,
            thickness: 1,
            color: [240, 240, 0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    pub frames: usize,
    pub threshold: f32,
    pub nms: f32,
    /// Only every `throttle`-th buffer is converted.
    pub throttle: u32,
    pub max_detections: usize,
    pub failure_policy: FailurePolicy,
    /// Internal layer to show instead of the camera frame.
    pub layer: Option<usize>,
    pub verbose: bool,
    pub caption: TextStyle,
    pub cycle_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            mode: PipelineMode::Ring,
            frames: DEFAULT_FRAMES,
            threshold: DEFAULT_THRESHOLD,
            nms: DEFAULT_NMS,
            throttle: DEFAULT_THROTTLE,
            max_detections: DEFAULT_MAX_DETECTIONS,
            failure_policy: FailurePolicy::SkipCycle,
            layer: None,
            verbose: false,
            caption: TextStyle::default(),
            cycle_pause: DEFAULT_CYCLE_PAUSE,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frames == 0 {
            return Err(PipelineError::InvalidConfig(
                "ring needs at least one frame".into(),
            ));
        }
        if self.frames > MAX_FRAMES {
            return Err(PipelineError::InvalidConfig(format!(
                "ring of {} frames exceeds the limit of {}",
                self.frames, MAX_FRAMES
            )));
        }
        if !(0. ..=1.).contains(&self.threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if !(0. ..=1.).contains(&self.nms) {
            return Err(PipelineError::InvalidConfig(format!(
                "nms {} is outside [0, 1]",
                self.nms
            )));
        }
        if self.throttle == 0 {
            return Err(PipelineError::InvalidConfig(
                "throttle must be at least 1".into(),
            ));
        }
        if self.max_detections == 0 {
            return Err(PipelineError::InvalidConfig(
                "max-detections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Slots the ring is built with; the single-slot mode always uses one.
    pub fn slot_count(&self) -> usize {
        match self.mode {
            PipelineMode::Ring => self.frames,
            PipelineMode::Single => 1,
        }
    }
}

/// Files the detection engine is initialised from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelPaths {
    pub cfg: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub names: Option<PathBuf>,
    pub font: Option<PathBuf>,
}

/// `ModelPaths` after every required file was found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPaths {
    pub cfg: PathBuf,
    pub weights: PathBuf,
    pub names: PathBuf,
    pub font: Option<PathBuf>,
}

impl ModelPaths {
    pub fn is_complete(&self) -> bool {
        self.cfg.is_some() && self.weights.is_some() && self.names.is_some()
    }

    pub fn validate(&self) -> Result<ResolvedPaths> {
        fn existing(path: &Option<PathBuf>, what: &str) -> Result<PathBuf> {
            match path {
                Some(path) if path.exists() => Ok(path.clone()),
                Some(path) => Err(PipelineError::MissingPath(path.clone())),
                None => Err(PipelineError::InvalidConfig(format!("{} is not set", what))),
            }
        }

        let font = match &self.font {
            Some(font) if !font.exists() => return Err(PipelineError::MissingPath(font.clone())),
            font => font.clone(),
        };

        Ok(ResolvedPaths {
            cfg: existing(&self.cfg, "cfg")?,
            weights: existing(&self.weights, "model")?,
            names: existing(&self.names, "names")?,
            font,
        })
    }
}
