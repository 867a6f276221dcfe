//! Frame buffering, temporal averaging and overlay pipeline of the `yolo`
//! video filter.
//!
//! The streaming thread hands every buffer to [`Pipeline::chain`], which
//! stores the frame and writes back the most recent finished annotation. A
//! [`DetectionWorker`] runs the network on its own thread and publishes new
//! annotations as they complete.

mod average;
mod chain;
pub mod config;
mod draw;
pub mod engine;
mod error;
pub mod frame;
mod labels;
mod pipeline;
mod ring;
mod single;
mod worker;

pub use crate::average::RunningAverage;
pub use crate::config::{
    FailurePolicy, ModelPaths, PipelineConfig, PipelineMode, ResolvedPaths, TextStyle,
};
pub use crate::draw::Painter;
pub use crate::engine::{decode_region_rows, truncate_detections, DetectionEngine};
pub use crate::error::{PipelineError, Result, Truncated};
pub use crate::frame::{Frame, Letterbox, PixelLayout};
pub use crate::labels::Labels;
pub use crate::pipeline::{ChainOutcome, Pipeline};
pub use crate::ring::{AnnotatedSlot, FrameRing, RawSlot};
pub use crate::single::{live_stats, LiveStat, SingleSlot, SingleState};
pub use crate::worker::{CycleOutcome, DetectionWorker, WorkerHandle};
