// src/metrics.rs

use crate::cancel::CancellationToken;
use crate::error::{Result, VqaError};
use crate::materialize::AlignedPair;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// --- Data Structures ---

/// One aligned frame pair's scores. Any metric may be missing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FrameMetric {
    /// 1-based index into the aligned range.
    pub frame: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmaf: Option<f64>,
    /// 6:1:1 weighted mean of the Y/U/V components.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psnr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psnr_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psnr_u: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psnr_v: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssim: Option<f64>,
}

impl FrameMetric {
    /// Builds a row from PSNR components, deriving the weighted average when
    /// all three are present.
    pub fn with_psnr_components(
        frame: u64,
        psnr_y: Option<f64>,
        psnr_u: Option<f64>,
        psnr_v: Option<f64>,
    ) -> Self {
        let psnr = match (psnr_y, psnr_u, psnr_v) {
            (Some(y), Some(u), Some(v)) => Some((6.0 * y + u + v) / 8.0),
            _ => None,
        };
        Self {
            frame,
            psnr,
            psnr_y,
            psnr_u,
            psnr_v,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Vmaf,
    Psnr,
    PsnrY,
    PsnrU,
    PsnrV,
    Ssim,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Vmaf,
        MetricKind::Psnr,
        MetricKind::PsnrY,
        MetricKind::PsnrU,
        MetricKind::PsnrV,
        MetricKind::Ssim,
    ];

    pub fn value(self, frame: &FrameMetric) -> Option<f64> {
        match self {
            MetricKind::Vmaf => frame.vmaf,
            MetricKind::Psnr => frame.psnr,
            MetricKind::PsnrY => frame.psnr_y,
            MetricKind::PsnrU => frame.psnr_u,
            MetricKind::PsnrV => frame.psnr_v,
            MetricKind::Ssim => frame.ssim,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Vmaf => "vmaf",
            MetricKind::Psnr => "psnr",
            MetricKind::PsnrY => "psnr_y",
            MetricKind::PsnrU => "psnr_u",
            MetricKind::PsnrV => "psnr_v",
            MetricKind::Ssim => "ssim",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            MetricKind::Psnr | MetricKind::PsnrY | MetricKind::PsnrU | MetricKind::PsnrV => " dB",
            _ => "",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "unknown metric '{}', expected one of: vmaf, psnr, psnr_y, psnr_u, psnr_v, ssim",
                    s
                )
            })
    }
}

/// Per-frame scores for frames `1..=len()`, in order, without gaps.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct MetricSeries {
    frames: Vec<FrameMetric>,
}

impl MetricSeries {
    /// Accepts `frames` only if their indices are exactly `1, 2, ..., n`.
    pub fn from_frames(frames: Vec<FrameMetric>) -> Result<Self> {
        for (position, frame) in frames.iter().enumerate() {
            let expected = position as u64 + 1;
            if frame.frame != expected {
                return Err(VqaError::MetricToolFailure {
                    exit_code: None,
                    diagnostic: format!(
                        "frame index {} at position {}, expected {} (rows must be consecutive from 1)",
                        frame.frame, position, expected
                    ),
                });
            }
        }
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[FrameMetric] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<FrameMetric> {
        self.frames
    }
}

/// A libvmaf model, resolved either to a file or to a built-in version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmafModel {
    Version(String),
    Path(PathBuf),
}

const BUILTIN_MODELS: [&str; 4] = [
    "vmaf_v0.6.1",
    "vmaf_v0.6.1neg",
    "vmaf_4k_v0.6.1",
    "vmaf_b_v0.6.3",
];

impl VmafModel {
    /// Resolves a model identifier.
    ///
    /// `auto` selects by reference height. A `model_dir/<id>.json` file wins
    /// over the built-in model of the same name.
    pub fn resolve(id: &str, model_dir: Option<&Path>, reference_height: u32) -> Result<Self> {
        let id = id.trim();
        let id = if id.eq_ignore_ascii_case("auto") {
            select_vmaf_model(reference_height)
        } else {
            id.strip_prefix("version=").unwrap_or(id)
        };

        if id.ends_with(".json") || id.contains('/') || id.contains('\\') {
            let path = PathBuf::from(id);
            return if path.is_file() {
                Ok(VmafModel::Path(path))
            } else {
                Err(VqaError::UnknownModel(id.to_string()))
            };
        }

        if let Some(dir) = model_dir {
            let candidate = dir.join(format!("{}.json", id));
            if candidate.is_file() {
                debug!("Using model file {}", candidate.display());
                return Ok(VmafModel::Path(candidate));
            }
        }

        if BUILTIN_MODELS.contains(&id) {
            Ok(VmafModel::Version(id.to_string()))
        } else {
            Err(VqaError::UnknownModel(id.to_string()))
        }
    }

    /// The `model=` option value for the libvmaf filter.
    pub fn filter_option(&self) -> String {
        match self {
            VmafModel::Version(version) => format!("version={}", version),
            VmafModel::Path(path) => format!("path={}", path.to_string_lossy()),
        }
    }
}

impl fmt::Display for VmafModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmafModel::Version(version) => f.write_str(version),
            VmafModel::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

fn select_vmaf_model(height: u32) -> &'static str {
    if height > 1080 {
        "vmaf_4k_v0.6.1"
    } else {
        "vmaf_v0.6.1"
    }
}

// --- External tool seam ---

#[derive(Debug, Clone, PartialEq)]
pub enum ToolStatus {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },
}

/// What the external tool produced: its exit status and every row it emitted,
/// in emission order, indexed from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRun {
    pub status: ToolStatus,
    pub frames: Vec<FrameMetric>,
}

/// The metric computation capability. Implementations must return promptly
/// with `Cancelled` once `cancel` fires.
pub trait MetricTool: Send + Sync {
    fn measure(
        &self,
        pair: &AlignedPair,
        model: &VmafModel,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolRun>;
}

// --- Core Functions ---

/// Invokes `tool` on the aligned pair and validates what comes back.
pub fn run_metrics(
    tool: &dyn MetricTool,
    pair: &AlignedPair,
    model: &VmafModel,
    workdir: &Path,
    cancel: &CancellationToken,
) -> Result<MetricSeries> {
    cancel.check()?;
    info!(
        "Starting metric computation on {} aligned frames with model {}",
        pair.frame_count, model
    );
    let run = tool.measure(pair, model, workdir, cancel)?;
    validate_tool_run(run, pair.frame_count)
}

/// Classifies a tool run as a full series, a partial one or a failure.
pub fn validate_tool_run(run: ToolRun, expected: u64) -> Result<MetricSeries> {
    let emitted = run.frames.len() as u64;
    if emitted > expected {
        return Err(VqaError::MetricToolFailure {
            exit_code: None,
            diagnostic: format!("tool emitted {} frames for {} aligned frames", emitted, expected),
        });
    }
    let series = MetricSeries::from_frames(run.frames)?;

    match run.status {
        ToolStatus::Failed {
            exit_code,
            diagnostic,
        } if series.is_empty() => {
            error!("Metric tool failed before emitting any frame: {}", diagnostic);
            Err(VqaError::MetricToolFailure {
                exit_code,
                diagnostic,
            })
        }
        _ if series.is_empty() => Err(VqaError::MetricToolFailure {
            exit_code: Some(0),
            diagnostic: "tool exited successfully but emitted no frames".to_string(),
        }),
        status if emitted < expected => {
            if let ToolStatus::Failed { exit_code, .. } = status {
                warn!("Metric tool exited abnormally (exit code {:?})", exit_code);
            }
            warn!("Metric tool emitted {} of {} frames", emitted, expected);
            Err(VqaError::IncompleteMetricSeries { expected, series })
        }
        ToolStatus::Failed {
            exit_code,
            diagnostic,
        } => {
            // Every frame arrived, but a failed exit means the rows can't be trusted.
            Err(VqaError::MetricToolFailure {
                exit_code,
                diagnostic,
            })
        }
        ToolStatus::Succeeded => {
            info!("Metric computation complete. Parsed {} frames.", series.len());
            Ok(series)
        }
    }
}
