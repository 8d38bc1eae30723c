//! Frame alignment and metric aggregation for video-quality testing.
//!
//! A run probes a reference and a captured video, locates a trigger frame
//! in each to compute the alignment offset, writes trimmed copies that
//! correspond frame for frame, scores them with VMAF, PSNR and SSIM, and
//! folds the per-frame scores into a [`report::ReportData`].
//!
//! [`pipeline::run`] is the headless entry point. External programs sit
//! behind [`ffmpeg::MediaToolkit`] and [`metrics::MetricTool`].

pub mod aggregate;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod materialize;
pub mod metrics;
pub mod offset;
pub mod pipeline;
pub mod plot;
pub mod report;
pub mod tool;
pub mod trigger;

pub use cancel::CancellationToken;
pub use config::RunConfig;
pub use error::{Result, VqaError};
pub use report::ReportData;
