// src/tool.rs

//! [`MetricTool`] implementation driving ffmpeg's libvmaf filter.

use crate::cancel::CancellationToken;
use crate::config::ToolConfig;
use crate::error::{Result, VqaError};
use crate::ffmpeg::run_command;
use crate::materialize::AlignedPair;
use crate::metrics::{FrameMetric, MetricTool, ToolRun, ToolStatus, VmafModel};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

// --- libvmaf JSON log ---

#[derive(Deserialize, Debug)]
struct LibvmafLog {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    frames: Vec<LibvmafFrame>,
}

#[derive(Deserialize, Debug)]
struct LibvmafFrame {
    #[serde(rename = "frameNum")]
    frame_num: u64,
    #[serde(default)]
    metrics: LibvmafMetrics,
}

#[derive(Deserialize, Debug, Default)]
struct LibvmafMetrics {
    vmaf: Option<f64>,
    psnr_y: Option<f64>,
    psnr_cb: Option<f64>,
    psnr_cr: Option<f64>,
    #[serde(alias = "ssim")]
    float_ssim: Option<f64>,
}

/// Runs VMAF, PSNR and SSIM in one ffmpeg pass over the aligned pair.
#[derive(Debug, Clone)]
pub struct FfmpegMetricTool {
    ffmpeg: PathBuf,
    threads: usize,
}

impl FfmpegMetricTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            threads: config.threads(),
        }
    }

    fn build_args(&self, pair: &AlignedPair, model: &VmafModel, log_path: &Path) -> Vec<String> {
        let filter_graph = build_vmaf_filter(model, log_path, self.threads);
        vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(), "warning".to_string(),
            // libvmaf takes the distorted stream first.
            "-i".to_string(), pair.captured.to_string_lossy().to_string(),
            "-i".to_string(), pair.reference.to_string_lossy().to_string(),
            "-lavfi".to_string(), filter_graph,
            "-f".to_string(), "null".to_string(),
            "-".to_string(),
        ]
    }
}

impl MetricTool for FfmpegMetricTool {
    fn measure(
        &self,
        pair: &AlignedPair,
        model: &VmafModel,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolRun> {
        let log_path = workdir.join("vmaf.json");
        let args = self.build_args(pair, model, &log_path);
        info!("Running FFmpeg for VMAF Calculation: ffmpeg {}", args.join(" "));

        let mut command = Command::new(&self.ffmpeg);
        command.args(&args);
        let outcome = run_command(&mut command, "VMAF Calculation", cancel)?;

        let status = if outcome.status.success() {
            info!(
                "FFmpeg command successful for VMAF Calculation ({}ms)",
                outcome.elapsed.as_millis()
            );
            ToolStatus::Succeeded
        } else {
            error!(
                "FFmpeg command failed for VMAF Calculation ({}ms): {}",
                outcome.elapsed.as_millis(),
                outcome.stderr
            );
            ToolStatus::Failed {
                exit_code: outcome.status.code(),
                diagnostic: outcome.stderr.clone(),
            }
        };

        let frames = if log_path.exists() {
            let content = fs::read_to_string(&log_path)?;
            match parse_vmaf_log(&content) {
                Ok(frames) => frames,
                // A crashed run leaves a truncated log behind. Keep every
                // frame that was written out completely.
                Err(e) if status != ToolStatus::Succeeded => {
                    let frames = recover_vmaf_frames(&content);
                    warn!(
                        "VMAF log is incomplete after failed run ({}); recovered {} frames",
                        e,
                        frames.len()
                    );
                    frames
                }
                Err(e) => return Err(e),
            }
        } else {
            if status == ToolStatus::Succeeded {
                error!("VMAF JSON output file was not created: {}", log_path.display());
            }
            Vec::new()
        };

        Ok(ToolRun { status, frames })
    }
}

/// Builds the two-input libvmaf filter graph.
pub fn build_vmaf_filter(model: &VmafModel, log_path: &Path, threads: usize) -> String {
    let filter_graph = format!(
        "[0:v][1:v]libvmaf=model='{model}':feature='name=psnr|name=float_ssim':log_fmt=json:log_path='{log_path}':n_threads={threads}:n_subsample=1",
        model = escape_filter_value(&model.filter_option()),
        log_path = escape_filter_value(&log_path.to_string_lossy()),
        threads = threads
    );
    debug!("Constructed VMAF filter graph: {}", filter_graph);
    filter_graph
}

/// Escapes a value placed between single quotes in a filter option.
fn escape_filter_value(value: &str) -> String {
    value.replace('\\', "/").replace('\'', "'\\''")
}

/// Converts a libvmaf JSON log into 1-based rows, preserving log order.
pub fn parse_vmaf_log(content: &str) -> Result<Vec<FrameMetric>> {
    let log: LibvmafLog = serde_json::from_str(content).map_err(VqaError::Json)?;
    if let Some(version) = &log.version {
        debug!("libvmaf version {}", version);
    }

    let frames: Vec<FrameMetric> = log.frames.into_iter().map(to_frame_metric).collect();

    info!("Parsed {} frames from VMAF log", frames.len());
    Ok(frames)
}

/// Reads the complete entries of the `frames` array from a log that may be
/// cut off anywhere. Stops at the first entry that does not parse.
pub fn recover_vmaf_frames(content: &str) -> Vec<FrameMetric> {
    let Some(array_start) = content
        .find("\"frames\"")
        .and_then(|key| content[key..].find('[').map(|bracket| key + bracket + 1))
    else {
        return Vec::new();
    };

    let mut frames = Vec::new();
    let mut rest = &content[array_start..];
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if !rest.starts_with('{') {
            break;
        }
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<LibvmafFrame>();
        match stream.next() {
            Some(Ok(entry)) => {
                let consumed = stream.byte_offset();
                frames.push(to_frame_metric(entry));
                rest = &rest[consumed..];
            }
            _ => break,
        }
    }
    debug!("Recovered {} complete frames from VMAF log", frames.len());
    frames
}

fn to_frame_metric(entry: LibvmafFrame) -> FrameMetric {
    let metrics = entry.metrics;
    FrameMetric {
        vmaf: metrics.vmaf,
        ssim: metrics.float_ssim,
        ..FrameMetric::with_psnr_components(
            entry.frame_num + 1,
            metrics.psnr_y,
            metrics.psnr_cb,
            metrics.psnr_cr,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::validate_tool_run;

    #[test]
    fn parses_libvmaf_frames_to_one_based_rows() {
        let log = r#"{
          "version": "3.0.0",
          "frames": [
            {"frameNum": 0, "metrics": {"integer_adm2": 0.98, "psnr_y": 40.0, "psnr_cb": 48.0,
              "psnr_cr": 32.0, "float_ssim": 0.97, "vmaf": 91.5}},
            {"frameNum": 1, "metrics": {"psnr_y": 38.0, "psnr_cb": 44.0, "psnr_cr": 44.0,
              "float_ssim": 0.95}}
          ],
          "pooled_metrics": {"vmaf": {"min": 91.5, "max": 91.5, "mean": 91.5}}
        }"#;
        let frames = parse_vmaf_log(log).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame, 1);
        assert_eq!(frames[0].vmaf, Some(91.5));
        assert_eq!(frames[0].psnr, Some(40.0));
        assert_eq!(frames[0].ssim, Some(0.97));
        assert_eq!(frames[1].frame, 2);
        assert_eq!(frames[1].vmaf, None);
        assert_eq!(frames[1].psnr, Some(39.5));
    }

    fn libvmaf_log(frames: u64) -> String {
        let entries: Vec<String> = (0..frames)
            .map(|n| {
                format!(
                    r#"    {{"frameNum": {n}, "metrics": {{"psnr_y": 41.5, "psnr_cb": 45.0, "psnr_cr": 44.0, "float_ssim": 0.97, "vmaf": 88.25}}}}"#
                )
            })
            .collect();
        format!(
            "{{\n  \"version\": \"3.0.0\",\n  \"fps\": 24.1,\n  \"frames\": [\n{}\n  ],\n  \"pooled_metrics\": {{}}\n}}\n",
            entries.join(",\n")
        )
    }

    #[test]
    fn crash_mid_log_keeps_complete_frames() {
        let full = libvmaf_log(51);
        let cut = full.find(r#"{"frameNum": 50"#).unwrap() + 30;
        let truncated = &full[..cut];

        assert!(parse_vmaf_log(truncated).is_err());
        let frames = recover_vmaf_frames(truncated);
        assert_eq!(frames.len(), 50);
        assert_eq!(frames[0].frame, 1);
        assert_eq!(frames[49].frame, 50);
        assert_eq!(frames[49].vmaf, Some(88.25));

        let run = ToolRun {
            status: ToolStatus::Failed {
                exit_code: Some(139),
                diagnostic: "Segmentation fault".to_string(),
            },
            frames,
        };
        match validate_tool_run(run, 185).unwrap_err() {
            VqaError::IncompleteMetricSeries { expected, series } => {
                assert_eq!(expected, 185);
                assert_eq!(series.len(), 50);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn recovery_matches_full_parse_on_complete_log() {
        let full = libvmaf_log(7);
        assert_eq!(recover_vmaf_frames(&full), parse_vmaf_log(&full).unwrap());
    }

    #[test]
    fn recovery_without_frames_array_is_empty() {
        assert!(recover_vmaf_frames("").is_empty());
        assert!(recover_vmaf_frames(r#"{"version": "3.0.0", "fra"#).is_empty());
    }

    #[test]
    fn filter_graph_quotes_paths() {
        let graph = build_vmaf_filter(
            &VmafModel::Version("vmaf_v0.6.1".to_string()),
            Path::new("/tmp/vqa-run/vmaf.json"),
            4,
        );
        assert!(graph.starts_with("[0:v][1:v]libvmaf="));
        assert!(graph.contains("model='version=vmaf_v0.6.1'"));
        assert!(graph.contains("log_path='/tmp/vqa-run/vmaf.json'"));
        assert!(graph.contains("n_threads=4"));
        assert!(graph.contains("n_subsample=1"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_status_and_no_frames() {
        let workdir = tempfile::tempdir().unwrap();
        let tool = FfmpegMetricTool {
            ffmpeg: PathBuf::from("false"),
            threads: 1,
        };
        let pair = AlignedPair {
            reference: workdir.path().join("r.mkv"),
            captured: workdir.path().join("c.mkv"),
            frame_count: 10,
            frame_rate: 30.0,
            width: 64,
            height: 64,
        };
        let run = tool
            .measure(
                &pair,
                &VmafModel::Version("vmaf_v0.6.1".to_string()),
                workdir.path(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(run.frames.is_empty());
        assert!(matches!(run.status, ToolStatus::Failed { exit_code: Some(1), .. }));
    }
}
