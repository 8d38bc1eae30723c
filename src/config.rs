// src/config.rs

//! Run configuration. Everything a run needs is carried in one [`RunConfig`]
//! value and handed to each stage explicitly.

use crate::error::{Result, VqaError};
use crate::metrics::MetricKind;
use crate::trigger::TriggerPolicy;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_VMAF_MODEL: &str = "vmaf_v0.6.1";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub reference: PathBuf,
    pub captured: PathBuf,
    /// VMAF model identifier, `auto`, or a path to a model JSON file.
    pub model: String,
    /// Directory searched for `<model>.json` before falling back to the
    /// models built into libvmaf.
    pub model_dir: Option<PathBuf>,
    pub alignment: AlignmentConfig,
    pub aggregation: AggregationConfig,
    pub tool: ToolConfig,
    /// Parent directory for per-run workspaces (system temp dir if unset).
    pub temp_dir: Option<PathBuf>,
    /// Aggregate a truncated metric series instead of failing the run.
    pub accept_partial: bool,
    pub metadata: RunMetadata,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            reference: PathBuf::new(),
            captured: PathBuf::new(),
            model: DEFAULT_VMAF_MODEL.to_string(),
            model_dir: None,
            alignment: AlignmentConfig::default(),
            aggregation: AggregationConfig::default(),
            tool: ToolConfig::default(),
            temp_dir: None,
            accept_partial: false,
            metadata: RunMetadata::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Frames the captured stream lags the reference by when triggers are
    /// unavailable. Negative when the capture starts early.
    pub manual_offset: i64,
    pub trigger: TriggerConfig,
    /// Upper bound on the number of aligned frames analysed.
    pub max_frames: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TriggerConfig {
    pub enabled: bool,
    /// 8-bit luma that at least 90% of a marker frame's pixels reach.
    pub min_luma: f64,
    /// Consecutive marker frames required.
    pub min_run: u64,
    /// Only the first `search_window` frames are scanned.
    pub search_window: u64,
    pub policy: TriggerPolicy,
    /// Triggers below this confidence are treated as not found.
    pub min_confidence: f64,
    /// Also look for a closing marker and end the aligned range there.
    pub closing: bool,
    /// Only the last `closing_window` frames are scanned for it.
    pub closing_window: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_luma: 200.0,
            min_run: 3,
            search_window: 300,
            policy: TriggerPolicy::First,
            min_confidence: 0.0,
            closing: false,
            closing_window: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AggregationConfig {
    /// Metric whose values drive segmentation.
    pub segment_metric: MetricKind,
    /// Widest spread of `segment_metric` values allowed inside one segment.
    pub tolerance: f64,
    /// Frames with VMAF below this are reported as low-quality spans.
    pub low_vmaf_threshold: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            segment_metric: MetricKind::Psnr,
            tolerance: 1.0,
            low_vmaf_threshold: 70.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ToolConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// libvmaf worker threads; all logical CPUs when unset.
    pub threads: Option<usize>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            threads: None,
        }
    }
}

impl ToolConfig {
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Free-text fields copied into the report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RunMetadata {
    pub test_name: String,
    pub tester: Option<String>,
    pub location: Option<String>,
    pub equipment: Option<String>,
    pub notes: Option<String>,
    /// Report date; the time the report is built when unset.
    pub date: Option<String>,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading run configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&content)
            .map_err(|e| VqaError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reference.as_os_str().is_empty() {
            return Err(VqaError::Config("reference path is required".to_string()));
        }
        if self.captured.as_os_str().is_empty() {
            return Err(VqaError::Config("captured path is required".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(VqaError::Config("VMAF model must not be empty".to_string()));
        }

        let trigger = &self.alignment.trigger;
        if trigger.min_run == 0 {
            return Err(VqaError::Config("trigger min_run must be at least 1".to_string()));
        }
        if trigger.search_window < trigger.min_run {
            return Err(VqaError::Config(format!(
                "trigger search_window ({}) is shorter than min_run ({})",
                trigger.search_window, trigger.min_run
            )));
        }
        if trigger.closing && trigger.closing_window < trigger.min_run {
            return Err(VqaError::Config(format!(
                "trigger closing_window ({}) is shorter than min_run ({})",
                trigger.closing_window, trigger.min_run
            )));
        }
        if !(0.0..=1.0).contains(&trigger.min_confidence) {
            return Err(VqaError::Config(format!(
                "trigger min_confidence must be within 0..=1, got {}",
                trigger.min_confidence
            )));
        }
        if self.alignment.max_frames == Some(0) {
            return Err(VqaError::Config("max_frames must be at least 1".to_string()));
        }

        let tolerance = self.aggregation.tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(VqaError::Config(format!(
                "segment tolerance must be a non-negative number, got {}",
                tolerance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RunConfig {
        RunConfig {
            reference: PathBuf::from("ref.mp4"),
            captured: PathBuf::from("cap.mp4"),
            ..RunConfig::default()
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{
                "reference": "ref.mp4",
                "captured": "cap.mp4",
                "alignment": { "manual_offset": -4, "trigger": { "min_run": 5 } },
                "aggregation": { "segment_metric": "vmaf" },
                "metadata": { "test_name": "Lab A" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.model, DEFAULT_VMAF_MODEL);
        assert_eq!(config.alignment.manual_offset, -4);
        assert_eq!(config.alignment.trigger.min_run, 5);
        assert_eq!(config.alignment.trigger.search_window, 300);
        assert!(config.alignment.trigger.enabled);
        assert!(!config.alignment.trigger.closing);
        assert_eq!(config.alignment.trigger.closing_window, 300);
        assert_eq!(config.aggregation.segment_metric, MetricKind::Vmaf);
        assert_eq!(config.aggregation.tolerance, 1.0);
        assert_eq!(config.metadata.test_name, "Lab A");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(RunConfig::default().validate().is_err());

        let mut config = minimal();
        config.aggregation.tolerance = -0.5;
        assert!(matches!(config.validate(), Err(VqaError::Config(_))));

        let mut config = minimal();
        config.alignment.trigger.min_run = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.alignment.trigger.search_window = 2;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.alignment.trigger.closing = true;
        config.alignment.trigger.closing_window = 1;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.alignment.max_frames = Some(0);
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.alignment.trigger.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_threads_are_kept() {
        let tool = ToolConfig {
            threads: Some(3),
            ..ToolConfig::default()
        };
        assert_eq!(tool.threads(), 3);
        assert!(ToolConfig::default().threads() >= 1);
    }
}
