// src/pipeline.rs

//! End-to-end run: probe, align, measure, aggregate, report.

use crate::aggregate::aggregate;
use crate::cancel::CancellationToken;
use crate::config::RunConfig;
use crate::error::{Result, VqaError};
use crate::ffmpeg::{MediaToolkit, VideoStream};
use crate::materialize::{RunWorkspace, check_compatibility, materialize};
use crate::metrics::{MetricTool, VmafModel, run_metrics};
use crate::offset::{DetectedTriggers, resolve_plan};
use crate::report::{ReportContext, ReportData, build_report};
use crate::trigger::{TriggerEvent, find_closing_trigger, find_trigger};
use chrono::Local;
use log::{error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Runs the whole pipeline on the calling thread.
///
/// Temporary media lives in a [`RunWorkspace`] that is removed before this
/// returns, whether the run succeeds, fails or is cancelled.
pub fn run(
    config: &RunConfig,
    toolkit: &dyn MediaToolkit,
    tool: &dyn MetricTool,
    cancel: &CancellationToken,
) -> Result<ReportData> {
    let start = Instant::now();
    config.validate()?;
    let run_id = new_run_id();
    info!("Starting run {}", run_id);
    info!("Reference file: {}", config.reference.display());
    info!("Captured file: {}", config.captured.display());

    let mut warnings = Vec::new();

    let reference = toolkit.probe(&config.reference, cancel)?;
    let captured = toolkit.probe(&config.captured, cancel)?;
    info!(
        "Reference: {} frames, {} @ {:.3} fps; captured: {} frames, {} @ {:.3} fps",
        reference.frame_count,
        reference.resolution(),
        reference.frame_rate,
        captured.frame_count,
        captured.resolution(),
        captured.frame_rate
    );
    if let Some(note) = check_compatibility(&reference, &captured)? {
        warn!("{}", note);
        warnings.push(note);
    }
    info!("Input validation passed.");

    let triggers = if config.alignment.trigger.enabled {
        let mut triggers = DetectedTriggers {
            reference: detect_or_warn(toolkit, &reference, config, cancel, &mut warnings)?,
            captured: detect_or_warn(toolkit, &captured, config, cancel, &mut warnings)?,
            ..DetectedTriggers::default()
        };
        if config.alignment.trigger.closing {
            triggers.reference_closing = detect_closing_or_warn(
                toolkit,
                &reference,
                triggers.reference,
                config,
                cancel,
                &mut warnings,
            )?;
            triggers.captured_closing = detect_closing_or_warn(
                toolkit,
                &captured,
                triggers.captured,
                config,
                cancel,
                &mut warnings,
            )?;
        }
        triggers
    } else {
        info!("Trigger detection disabled, using manual offset {}", config.alignment.manual_offset);
        DetectedTriggers::default()
    };

    let plan = resolve_plan(
        &triggers,
        reference.frame_count,
        captured.frame_count,
        &config.alignment,
    )?;
    let model = VmafModel::resolve(&config.model, config.model_dir.as_deref(), reference.height)?;
    info!("Using VMAF model {}", model);

    let workspace = RunWorkspace::create(config.temp_dir.as_deref(), &run_id)?;
    let pair = materialize(&plan, &reference, &captured, &workspace, toolkit, cancel)?;

    let (series, partial) = match run_metrics(tool, &pair, &model, workspace.path(), cancel) {
        Ok(series) => (series, false),
        Err(VqaError::IncompleteMetricSeries { expected, series }) if config.accept_partial => {
            let note = format!(
                "Metric tool produced {} of {} aligned frames; summary covers the partial series.",
                series.len(),
                expected
            );
            warn!("{}", note);
            warnings.push(note);
            (series, true)
        }
        Err(e) => return Err(e),
    };
    drop(workspace);

    let summary = aggregate(series, &config.aggregation);
    let report = build_report(
        summary,
        ReportContext {
            run_id,
            metadata: config.metadata.clone(),
            reference,
            captured,
            plan,
            triggers,
            model,
            partial,
            warnings,
        },
    );
    info!("Run completed in {:.2?}", start.elapsed());
    Ok(report)
}

/// Trigger search failures only cost the triggers; cancellation still stops
/// the run.
fn detect_or_warn(
    toolkit: &dyn MediaToolkit,
    stream: &VideoStream,
    config: &RunConfig,
    cancel: &CancellationToken,
    warnings: &mut Vec<String>,
) -> Result<Option<TriggerEvent>> {
    match find_trigger(toolkit, stream, &config.alignment.trigger, cancel) {
        Ok(trigger) => Ok(Some(trigger)),
        Err(VqaError::Cancelled) => Err(VqaError::Cancelled),
        Err(e) => {
            let note = format!("Trigger detection failed for {}: {}", stream.path.display(), e);
            warn!("{}", note);
            warnings.push(note);
            Ok(None)
        }
    }
}

/// Searches the tail of `stream` past its opening trigger. A missing
/// closing marker leaves the range bounded by overlap alone.
fn detect_closing_or_warn(
    toolkit: &dyn MediaToolkit,
    stream: &VideoStream,
    opening: Option<TriggerEvent>,
    config: &RunConfig,
    cancel: &CancellationToken,
    warnings: &mut Vec<String>,
) -> Result<Option<TriggerEvent>> {
    let after = opening.map_or(0, |t| t.frame_index + t.run_length);
    match find_closing_trigger(toolkit, stream, &config.alignment.trigger, after, cancel) {
        Ok(trigger) => Ok(Some(trigger)),
        Err(VqaError::Cancelled) => Err(VqaError::Cancelled),
        Err(e) => {
            let note = format!(
                "Closing trigger detection failed for {}: {}",
                stream.path.display(),
                e
            );
            warn!("{}", note);
            warnings.push(note);
            Ok(None)
        }
    }
}

fn new_run_id() -> String {
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), std::process::id())
}

/// A pipeline running on its own thread.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    worker: JoinHandle<Result<ReportData>>,
}

impl RunHandle {
    /// Requests cancellation; [`RunHandle::join`] then returns `Cancelled`
    /// once the current step has stopped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn join(self) -> Result<ReportData> {
        self.worker.join().unwrap_or_else(|_| {
            error!("Pipeline worker panicked");
            Err(VqaError::Command("pipeline worker panicked".to_string()))
        })
    }
}

/// Starts [`run`] on a worker thread.
pub fn spawn(
    config: RunConfig,
    toolkit: Arc<dyn MediaToolkit>,
    tool: Arc<dyn MetricTool>,
) -> Result<RunHandle> {
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = thread::Builder::new()
        .name("vqa-pipeline".to_string())
        .spawn(move || run(&config, toolkit.as_ref(), tool.as_ref(), &worker_cancel))?;
    Ok(RunHandle { cancel, worker })
}
