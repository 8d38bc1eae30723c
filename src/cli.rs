// src/cli.rs

use crate::config::RunConfig;
use crate::error::Result;
use crate::metrics::MetricKind;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Align a captured video with its reference and report VMAF, PSNR and SSIM", long_about = None)]
pub struct CliArgs {
    /// Reference (source) video file
    #[arg(required_unless_present = "config")]
    pub reference: Option<PathBuf>,

    /// Captured video file to compare against the reference
    #[arg(required_unless_present = "config")]
    pub captured: Option<PathBuf>,

    /// JSON run configuration; positional paths and flags override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// VMAF model (e.g. vmaf_v0.6.1, auto, or a model JSON path)
    #[arg(long)]
    pub model: Option<String>,

    /// Directory holding custom VMAF model files
    #[arg(long, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// Frames the capture lags the reference by, used without triggers
    #[arg(long, allow_hyphen_values = true)]
    pub manual_offset: Option<i64>,

    /// Skip trigger detection and use the manual offset
    #[arg(long)]
    pub no_trigger: bool,

    /// End the analysed range at a closing marker near the end of each file
    #[arg(long)]
    pub closing_trigger: bool,

    /// Analyse at most this many aligned frames
    #[arg(long)]
    pub max_frames: Option<u64>,

    /// Metric that drives segmentation (vmaf, psnr, psnr_y, psnr_u, psnr_v, ssim)
    #[arg(long)]
    pub segment_metric: Option<MetricKind>,

    /// Widest spread of the segment metric inside one segment
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Report a truncated metric series instead of failing
    #[arg(long)]
    pub accept_partial: bool,

    /// Test name recorded in the report
    #[arg(long)]
    pub test_name: Option<String>,

    /// Report file (default: <output-dir>/<captured stem>.report.json)
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Specify output directory for results (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Also write one PNG chart per metric
    #[arg(long)]
    pub plots: bool,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Enable logging to file (e.g., vqa_YYYYMMDD_HHMMSS.log)
    #[arg(long)]
    pub log: bool,
}

impl CliArgs {
    /// Loads `--config` if given, then applies every explicit argument on top.
    pub fn to_run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(reference) = &self.reference {
            config.reference = reference.clone();
        }
        if let Some(captured) = &self.captured {
            config.captured = captured.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(model_dir) = &self.model_dir {
            config.model_dir = Some(model_dir.clone());
        }
        if let Some(offset) = self.manual_offset {
            config.alignment.manual_offset = offset;
        }
        if self.no_trigger {
            config.alignment.trigger.enabled = false;
        }
        if self.closing_trigger {
            config.alignment.trigger.closing = true;
        }
        if let Some(max_frames) = self.max_frames {
            config.alignment.max_frames = Some(max_frames);
        }
        if let Some(metric) = self.segment_metric {
            config.aggregation.segment_metric = metric;
        }
        if let Some(tolerance) = self.tolerance {
            config.aggregation.tolerance = tolerance;
        }
        if self.accept_partial {
            config.accept_partial = true;
        }
        if let Some(name) = &self.test_name {
            config.metadata.test_name = name.clone();
        }
        if config.metadata.test_name.is_empty() {
            config.metadata.test_name = config
                .captured
                .file_stem()
                .map_or_else(|| "vqa_analysis".to_string(), |s| s.to_string_lossy().to_string());
        }

        config.validate()?;
        Ok(config)
    }
}

pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let args = CliArgs::parse_from([
            "vqa",
            "ref.mp4",
            "cap.mp4",
            "--manual-offset",
            "-12",
            "--no-trigger",
            "--segment-metric",
            "vmaf",
            "--tolerance",
            "2.5",
        ]);
        let config = args.to_run_config().unwrap();
        assert_eq!(config.reference, PathBuf::from("ref.mp4"));
        assert_eq!(config.alignment.manual_offset, -12);
        assert!(!config.alignment.trigger.enabled);
        assert_eq!(config.aggregation.segment_metric, MetricKind::Vmaf);
        assert_eq!(config.aggregation.tolerance, 2.5);
        assert_eq!(config.metadata.test_name, "cap");
        assert!(!config.alignment.trigger.closing);

        let args = CliArgs::parse_from(["vqa", "ref.mp4", "cap.mp4", "--closing-trigger"]);
        assert!(args.to_run_config().unwrap().alignment.trigger.closing);
    }

    #[test]
    fn config_file_supplies_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"reference": "a.mkv", "captured": "b.mkv", "accept_partial": true,
                "metadata": {"test_name": "Rig 2"}}"#,
        )
        .unwrap();
        let args = CliArgs::parse_from(["vqa", "--config", path.to_str().unwrap(), "--model", "auto"]);
        let config = args.to_run_config().unwrap();
        assert_eq!(config.captured, PathBuf::from("b.mkv"));
        assert_eq!(config.model, "auto");
        assert!(config.accept_partial);
        assert_eq!(config.metadata.test_name, "Rig 2");
    }

    #[test]
    fn paths_are_required_without_config() {
        assert!(CliArgs::try_parse_from(["vqa", "ref.mp4"]).is_err());
    }
}
