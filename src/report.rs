// src/report.rs

//! Final report structure and its JSON file.

use crate::aggregate::{MetricSummary, QualityGrade, SummaryReport};
use crate::config::RunMetadata;
use crate::error::{Result, VqaError};
use crate::ffmpeg::VideoStream;
use crate::metrics::{MetricKind, VmafModel};
use crate::offset::{AlignmentPlan, DetectedTriggers};
use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const INSUFFICIENT_DATA: &str = "insufficient data";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub reference: VideoStream,
    pub captured: VideoStream,
}

/// Plain-language readings of the global averages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub vmaf: String,
    pub psnr: String,
    pub ssim: String,
}

/// Everything about the run that is not computed from the metric series.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub run_id: String,
    pub metadata: RunMetadata,
    pub reference: VideoStream,
    pub captured: VideoStream,
    pub plan: AlignmentPlan,
    pub triggers: DetectedTriggers,
    pub model: VmafModel,
    /// The series stopped short of the aligned length.
    pub partial: bool,
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReportData {
    pub run_id: String,
    pub test_name: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tester: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub video: VideoInfo,
    pub alignment: AlignmentPlan,
    pub triggers: DetectedTriggers,
    pub model: VmafModel,
    pub interpretation: Interpretation,
    pub partial: bool,
    pub warnings: Vec<String>,
    pub summary: SummaryReport,
}

/// Describes a summary of `kind` in words.
pub fn interpret(kind: MetricKind, summary: &MetricSummary) -> String {
    let Some(average) = summary.average() else {
        return INSUFFICIENT_DATA.to_string();
    };
    let grade = QualityGrade::for_value(kind, average);
    let detail = match (kind, grade) {
        (MetricKind::Vmaf, QualityGrade::Excellent) => " (transparent)",
        (MetricKind::Ssim, QualityGrade::Excellent) => " (imperceptible difference)",
        (MetricKind::Vmaf | MetricKind::Ssim, QualityGrade::Good) => " (perceptible but not annoying)",
        (MetricKind::Vmaf | MetricKind::Ssim, QualityGrade::Fair) => " (slightly annoying)",
        (MetricKind::Vmaf | MetricKind::Ssim, QualityGrade::Poor) => " (annoying)",
        (MetricKind::Vmaf | MetricKind::Ssim, QualityGrade::Bad) => " (very annoying)",
        _ => "",
    };
    let label = grade.to_string();
    let (first, rest) = label.split_at(1);
    format!("{}{} quality{}", first.to_uppercase(), rest, detail)
}

/// Combines the summary with the run context. Only the interpretation is
/// derived here.
pub fn build_report(summary: SummaryReport, context: ReportContext) -> ReportData {
    let interpretation = Interpretation {
        vmaf: interpret(MetricKind::Vmaf, &summary.metrics.vmaf),
        psnr: interpret(MetricKind::Psnr, &summary.metrics.psnr),
        ssim: interpret(MetricKind::Ssim, &summary.metrics.ssim),
    };

    let date = context
        .metadata
        .date
        .clone()
        .unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M:%S").to_string());

    let mut warnings = context.warnings;
    warnings.extend(summary.warnings.iter().cloned());

    let RunMetadata {
        test_name,
        tester,
        location,
        equipment,
        notes,
        ..
    } = context.metadata;

    ReportData {
        run_id: context.run_id,
        test_name,
        date,
        tester,
        location,
        equipment,
        notes,
        video: VideoInfo {
            reference: context.reference,
            captured: context.captured,
        },
        alignment: context.plan,
        triggers: context.triggers,
        model: context.model,
        interpretation,
        partial: context.partial,
        warnings,
        summary,
    }
}

/// Writes the report as pretty JSON. The file appears complete or not at all.
pub fn write_report(report: &ReportData, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, report)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| VqaError::Io(e.error))?;

    info!("Report written to {}", path.display());
    Ok(())
}
