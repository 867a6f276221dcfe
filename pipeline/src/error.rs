use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("file {0} does not exist")]
    MissingPath(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("label file {path} is malformed: {reason}")]
    MalformedLabels { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("frame size changed from {from:?} to {to:?} mid-stream")]
    ResolutionChange {
        from: (usize, usize),
        to: (usize, usize),
    },

    #[error("buffer of {actual} bytes cannot hold {height} rows of stride {stride}")]
    BufferTooSmall {
        actual: usize,
        height: usize,
        stride: usize,
    },

    #[error("unsupported pixel layout: {0}")]
    UnsupportedLayout(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("malformed network output: {0}")]
    MalformedOutput(String),

    #[error("font {0} could not be parsed")]
    Font(PathBuf),

    #[error("failed to spawn detection thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// More detections survived than the configured capacity allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    pub kept: usize,
    pub dropped: usize,
}

impl std::fmt::Display for Truncated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "result set truncated to {} detections, {} dropped",
            self.kept, self.dropped
        )
    }
}
