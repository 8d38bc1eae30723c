// src/error.rs

use crate::metrics::MetricSeries;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VqaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg/FFprobe command failed: {0}")]
    Command(String),

    #[error("Failed to parse command output: {0}")]
    Parse(String),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plotting error: {0}")]
    Plot(String),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// No qualifying marker run inside the search window. Callers fall back
    /// to the manual offset.
    #[error("No trigger found within the first {window} frames of {path}")]
    NoTriggerFound { path: String, window: u64 },

    /// No marker run in the tail of a stream. The aligned length is then
    /// bounded by overlap alone.
    #[error("No closing trigger found within the last {window} frames of {path}")]
    NoClosingTriggerFound { path: String, window: u64 },

    #[error(
        "Insufficient overlap: offset {offset} leaves no usable frames (reference {reference_frames} frames, captured {captured_frames} frames)"
    )]
    InsufficientOverlap {
        offset: i64,
        reference_frames: u64,
        captured_frames: u64,
    },

    #[error("Resolution mismatch: reference is {expected}, captured is {actual}")]
    ResolutionMismatch { expected: String, actual: String },

    #[error("Frame rate mismatch: reference is {expected:.3} fps, captured is {actual:.3} fps")]
    FrameRateMismatch { expected: f64, actual: f64 },

    #[error("Unknown VMAF model '{0}'")]
    UnknownModel(String),

    #[error("Failed to materialize aligned stream: {0}")]
    Materialization(String),

    /// The external metric tool failed outright. `diagnostic` is the tool's
    /// own output, unmodified.
    #[error("Metric tool failed (exit code {exit_code:?}): {diagnostic}")]
    MetricToolFailure {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    /// The metric tool stopped early. Carries every frame parsed so far.
    #[error("Metric tool produced {} of {expected} expected frames", .series.len())]
    IncompleteMetricSeries { expected: u64, series: MetricSeries },

    #[error("Operation cancelled")]
    Cancelled,
}

impl VqaError {
    /// Whether the run can continue (or be retried) after this error without
    /// operator intervention on the inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VqaError::NoTriggerFound { .. }
                | VqaError::NoClosingTriggerFound { .. }
                | VqaError::IncompleteMetricSeries { .. }
                | VqaError::Cancelled
        )
    }
}

// Define a standard Result type for the crate
pub type Result<T> = std::result::Result<T, VqaError>;
