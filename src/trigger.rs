// src/trigger.rs

//! Detection of the bright marker ("trigger") frames that mark the start of
//! test content in a stream.

use crate::cancel::CancellationToken;
use crate::config::TriggerConfig;
use crate::error::{Result, VqaError};
use crate::ffmpeg::{MediaToolkit, VideoStream};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Luminance statistics of one decoded frame, on the 8-bit scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaSample {
    /// 0-based index within the source file.
    pub frame_index: u64,
    /// Average luma (`YAVG`).
    pub mean: f64,
    /// 10th-percentile luma (`YLOW`).
    pub low: f64,
}

/// A detected marker run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TriggerEvent {
    /// 0-based index of the first frame of the run.
    pub frame_index: u64,
    pub run_length: u64,
    /// Mean brightness of the run, 0.0 to 1.0.
    pub confidence: f64,
}

/// Which candidate to report when the window holds more than one run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Earliest qualifying run.
    #[default]
    First,
    /// Highest confidence; earliest among equals.
    HighestConfidence,
}

/// Marker condition evaluated per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerSpec {
    pub min_luma: f64,
    pub min_run: u64,
    pub search_window: u64,
}

impl From<&TriggerConfig> for MarkerSpec {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            min_luma: config.min_luma,
            min_run: config.min_run,
            search_window: config.search_window,
        }
    }
}

impl MarkerSpec {
    fn is_marker(&self, sample: &LumaSample) -> bool {
        sample.low >= self.min_luma
    }
}

/// Every run of at least `min_run` consecutive marker frames that starts
/// inside the search window, in frame order.
///
/// Samples past the window are ignored, so a run touching the window's end is
/// judged by the frames inside it. A gap in frame indices breaks a run.
pub fn scan_candidates(samples: &[LumaSample], spec: &MarkerSpec) -> Vec<TriggerEvent> {
    collect_runs(
        samples
            .iter()
            .take_while(|s| s.frame_index < spec.search_window),
        spec,
    )
}

fn collect_runs<'a>(
    samples: impl Iterator<Item = &'a LumaSample>,
    spec: &MarkerSpec,
) -> Vec<TriggerEvent> {
    let mut candidates = Vec::new();
    let mut run: Option<(u64, u64, f64)> = None; // start, length, luma sum
    let mut last_index: Option<u64> = None;

    let mut close = |run: Option<(u64, u64, f64)>| {
        if let Some((start, length, luma_sum)) = run {
            if length >= spec.min_run {
                candidates.push(TriggerEvent {
                    frame_index: start,
                    run_length: length,
                    confidence: (luma_sum / length as f64 / 255.0).clamp(0.0, 1.0),
                });
            }
        }
    };

    for sample in samples {
        let contiguous = last_index.is_some_and(|last| sample.frame_index == last + 1);
        last_index = Some(sample.frame_index);

        if !spec.is_marker(sample) {
            close(run.take());
            continue;
        }
        match run.as_mut() {
            Some((_, length, luma_sum)) if contiguous => {
                *length += 1;
                *luma_sum += sample.mean;
            }
            _ => {
                close(run.take());
                run = Some((sample.frame_index, 1, sample.mean));
            }
        }
    }
    close(run.take());
    candidates
}

/// Picks the trigger for one stream according to `policy`.
pub fn detect_trigger(
    samples: &[LumaSample],
    spec: &MarkerSpec,
    policy: TriggerPolicy,
    source: &str,
) -> Result<TriggerEvent> {
    let candidates = scan_candidates(samples, spec);
    debug!("{} trigger candidates in {}", candidates.len(), source);

    let chosen = match policy {
        TriggerPolicy::First => candidates.first().copied(),
        TriggerPolicy::HighestConfidence => candidates.iter().copied().reduce(|best, next| {
            if next.confidence > best.confidence {
                next
            } else {
                best
            }
        }),
    };

    chosen.ok_or_else(|| VqaError::NoTriggerFound {
        path: source.to_string(),
        window: spec.search_window,
    })
}

/// Scans the start of `stream` for its trigger.
pub fn find_trigger(
    toolkit: &dyn MediaToolkit,
    stream: &VideoStream,
    config: &TriggerConfig,
    cancel: &CancellationToken,
) -> Result<TriggerEvent> {
    let spec = MarkerSpec::from(config);
    let window = spec.search_window.min(stream.frame_count);
    let samples = toolkit.luma_samples(stream, 0..window, cancel)?;
    let source = stream.path.display().to_string();
    let trigger = detect_trigger(&samples, &spec, config.policy, &source)?;
    info!(
        "Trigger in {} at frame {} ({} frames, confidence {:.3})",
        source, trigger.frame_index, trigger.run_length, trigger.confidence
    );
    Ok(trigger)
}

/// Picks the closing marker from samples of a stream's tail: the last
/// qualifying run. A run that reaches the end of the file counts.
pub fn detect_closing_trigger(
    samples: &[LumaSample],
    spec: &MarkerSpec,
    window: u64,
    source: &str,
) -> Result<TriggerEvent> {
    let candidates = collect_runs(samples.iter(), spec);
    debug!("{} closing trigger candidates in {}", candidates.len(), source);
    candidates
        .last()
        .copied()
        .ok_or_else(|| VqaError::NoClosingTriggerFound {
            path: source.to_string(),
            window,
        })
}

/// Scans the last `closing_window` frames of `stream` for the marker that
/// ends the test content. Frames before `after` (the end of the opening
/// trigger) are never scanned, so a short stream cannot report its opening
/// marker twice.
pub fn find_closing_trigger(
    toolkit: &dyn MediaToolkit,
    stream: &VideoStream,
    config: &TriggerConfig,
    after: u64,
    cancel: &CancellationToken,
) -> Result<TriggerEvent> {
    let spec = MarkerSpec::from(config);
    let source = stream.path.display().to_string();
    let tail_start = stream
        .frame_count
        .saturating_sub(config.closing_window)
        .max(after);
    if tail_start >= stream.frame_count {
        return Err(VqaError::NoClosingTriggerFound {
            path: source,
            window: config.closing_window,
        });
    }

    let samples = toolkit.luma_samples(stream, tail_start..stream.frame_count, cancel)?;
    let trigger = detect_closing_trigger(&samples, &spec, config.closing_window, &source)?;
    info!(
        "Closing trigger in {} at frame {} ({} frames, confidence {:.3})",
        source, trigger.frame_index, trigger.run_length, trigger.confidence
    );
    Ok(trigger)
}
