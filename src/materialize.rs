// src/materialize.rs

//! Compatibility checks and the trimmed, frame-synchronized copies the
//! metric tool compares.

use crate::cancel::CancellationToken;
use crate::error::{Result, VqaError};
use crate::ffmpeg::{MediaToolkit, VideoStream};
use crate::offset::AlignmentPlan;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Frame rates closer than this are treated as equal.
pub const FRAME_RATE_TOLERANCE: f64 = 0.01;

/// Fails unless both streams can be compared frame by frame as they are.
///
/// A pixel format difference does not fail; it comes back as a note for
/// the caller to report.
pub fn check_compatibility(reference: &VideoStream, captured: &VideoStream) -> Result<Option<String>> {
    if reference.width != captured.width || reference.height != captured.height {
        return Err(VqaError::ResolutionMismatch {
            expected: reference.resolution(),
            actual: captured.resolution(),
        });
    }
    if (reference.frame_rate - captured.frame_rate).abs() > FRAME_RATE_TOLERANCE {
        return Err(VqaError::FrameRateMismatch {
            expected: reference.frame_rate,
            actual: captured.frame_rate,
        });
    }
    if reference.pixel_format != captured.pixel_format {
        return Ok(Some(format!(
            "Pixel formats differ: reference {}, captured {}; the metric tool converts internally",
            reference.pixel_format, captured.pixel_format
        )));
    }
    Ok(None)
}

/// Per-run scratch directory. Removed with everything in it when dropped,
/// whichever way the run ends.
#[derive(Debug)]
pub struct RunWorkspace {
    run_id: String,
    dir: TempDir,
}

impl RunWorkspace {
    /// Creates `vqa-<run_id>-<random>` under `root`, or under the system temp
    /// directory when `root` is `None`.
    pub fn create(root: Option<&Path>, run_id: &str) -> Result<Self> {
        let prefix = format!("vqa-{}-", run_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!("Created run workspace {}", dir.path().display());
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// The trimmed pair. Frame `i` of `reference` and frame `i` of `captured`
/// show the same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPair {
    pub reference: PathBuf,
    pub captured: PathBuf,
    pub frame_count: u64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

/// Writes both trimmed streams into `workspace` and checks their lengths.
pub fn materialize(
    plan: &AlignmentPlan,
    reference: &VideoStream,
    captured: &VideoStream,
    workspace: &RunWorkspace,
    toolkit: &dyn MediaToolkit,
    cancel: &CancellationToken,
) -> Result<AlignedPair> {
    check_compatibility(reference, captured)?;

    let outputs = [
        (reference, plan.reference_start, workspace.path().join("reference_aligned.mkv")),
        (captured, plan.captured_start, workspace.path().join("captured_aligned.mkv")),
    ];
    for (stream, start, output) in &outputs {
        cancel.check()?;
        info!(
            "Trimming {} from frame {} ({} frames) -> {}",
            stream.path.display(),
            start,
            plan.usable_frame_count,
            output.display()
        );
        toolkit.trim(stream, *start, plan.usable_frame_count, output, cancel)?;

        let trimmed = toolkit.probe(output, cancel)?;
        if trimmed.frame_count != plan.usable_frame_count {
            return Err(VqaError::Materialization(format!(
                "{} has {} frames, expected {}",
                output.display(),
                trimmed.frame_count,
                plan.usable_frame_count
            )));
        }
    }

    let [(_, _, reference_out), (_, _, captured_out)] = outputs;
    Ok(AlignedPair {
        reference: reference_out,
        captured: captured_out,
        frame_count: plan.usable_frame_count,
        frame_rate: reference.frame_rate,
        width: reference.width,
        height: reference.height,
    })
}
