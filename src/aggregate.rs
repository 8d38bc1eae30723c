// src/aggregate.rs

//! Global statistics, stable-quality segments and low-VMAF spans computed
//! from a validated [`MetricSeries`].

use crate::config::AggregationConfig;
use crate::metrics::{FrameMetric, MetricKind, MetricSeries};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `{min, max, average}` over the frames that carry a metric.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricSummary {
    Stats {
        min: f64,
        max: f64,
        average: f64,
        /// Frames that contributed.
        frames: u64,
    },
    NoData,
}

impl MetricSummary {
    /// Summarizes `values` in iteration order.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut count = 0u64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }
        if count == 0 {
            return MetricSummary::NoData;
        }
        MetricSummary::Stats {
            min,
            max,
            average: sum / count as f64,
            frames: count,
        }
    }

    pub fn average(&self) -> Option<f64> {
        match self {
            MetricSummary::Stats { average, .. } => Some(*average),
            MetricSummary::NoData => None,
        }
    }

    pub fn min(&self) -> Option<f64> {
        match self {
            MetricSummary::Stats { min, .. } => Some(*min),
            MetricSummary::NoData => None,
        }
    }

    pub fn max(&self) -> Option<f64> {
        match self {
            MetricSummary::Stats { max, .. } => Some(*max),
            MetricSummary::NoData => None,
        }
    }
}

/// One summary per [`MetricKind`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MetricSummaries {
    pub vmaf: MetricSummary,
    pub psnr: MetricSummary,
    pub psnr_y: MetricSummary,
    pub psnr_u: MetricSummary,
    pub psnr_v: MetricSummary,
    pub ssim: MetricSummary,
}

impl MetricSummaries {
    pub fn from_frames(frames: &[FrameMetric]) -> Self {
        let summarize =
            |kind: MetricKind| MetricSummary::from_values(frames.iter().filter_map(|f| kind.value(f)));
        Self {
            vmaf: summarize(MetricKind::Vmaf),
            psnr: summarize(MetricKind::Psnr),
            psnr_y: summarize(MetricKind::PsnrY),
            psnr_u: summarize(MetricKind::PsnrU),
            psnr_v: summarize(MetricKind::PsnrV),
            ssim: summarize(MetricKind::Ssim),
        }
    }

    pub fn get(&self, kind: MetricKind) -> &MetricSummary {
        match kind {
            MetricKind::Vmaf => &self.vmaf,
            MetricKind::Psnr => &self.psnr,
            MetricKind::PsnrY => &self.psnr_y,
            MetricKind::PsnrU => &self.psnr_u,
            MetricKind::PsnrV => &self.psnr_v,
            MetricKind::Ssim => &self.ssim,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Excellent,
    Good,
    Fair,
    Acceptable,
    Poor,
    Bad,
}

impl QualityGrade {
    /// Grades a value of `kind`. The PSNR components share the PSNR bands.
    pub fn for_value(kind: MetricKind, value: f64) -> Self {
        match kind {
            MetricKind::Vmaf => match value {
                v if v >= 90.0 => QualityGrade::Excellent,
                v if v >= 80.0 => QualityGrade::Good,
                v if v >= 70.0 => QualityGrade::Fair,
                v if v >= 60.0 => QualityGrade::Poor,
                _ => QualityGrade::Bad,
            },
            MetricKind::Psnr | MetricKind::PsnrY | MetricKind::PsnrU | MetricKind::PsnrV => {
                match value {
                    v if v >= 40.0 => QualityGrade::Excellent,
                    v if v >= 30.0 => QualityGrade::Good,
                    v if v >= 20.0 => QualityGrade::Acceptable,
                    _ => QualityGrade::Poor,
                }
            }
            MetricKind::Ssim => match value {
                v if v >= 0.95 => QualityGrade::Excellent,
                v if v >= 0.90 => QualityGrade::Good,
                v if v >= 0.80 => QualityGrade::Fair,
                v if v >= 0.70 => QualityGrade::Poor,
                _ => QualityGrade::Bad,
            },
        }
    }
}

impl fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityGrade::Excellent => "excellent",
            QualityGrade::Good => "good",
            QualityGrade::Fair => "fair",
            QualityGrade::Acceptable => "acceptable",
            QualityGrade::Poor => "poor",
            QualityGrade::Bad => "bad",
        };
        f.write_str(label)
    }
}

/// Frames `start_frame..=end_frame` (1-based, inclusive).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Segment {
    pub start_frame: u64,
    pub end_frame: u64,
    pub frame_count: u64,
    pub metrics: MetricSummaries,
    /// Grade of the segment's average of the driving metric, if it has one.
    pub grade: Option<QualityGrade>,
}

/// A maximal run of frames below the low-VMAF threshold.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LowQualitySpan {
    pub start_frame: u64,
    pub end_frame: u64,
    pub length: u64,
    pub average_vmaf: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub frame_count: u64,
    pub metrics: MetricSummaries,
    pub segment_metric: MetricKind,
    pub tolerance: f64,
    pub segments: Vec<Segment>,
    pub low_vmaf_threshold: f64,
    pub low_quality_spans: Vec<LowQualitySpan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub frames: Vec<FrameMetric>,
}

/// Consumes the series and computes the whole summary in one pass per
/// statistic. Pure: identical inputs give bit-identical output.
pub fn aggregate(series: MetricSeries, config: &AggregationConfig) -> SummaryReport {
    let frames = series.into_frames();
    info!(
        "Aggregating {} frames (segmenting on {}, tolerance {})",
        frames.len(),
        config.segment_metric,
        config.tolerance
    );

    let metrics = MetricSummaries::from_frames(&frames);
    let segments = segment(&frames, config.segment_metric, config.tolerance);
    let low_quality_spans = low_vmaf_spans(&frames, config.low_vmaf_threshold);
    let warnings = sanity_warnings(&frames, &metrics);
    for warning in &warnings {
        warn!("{}", warning);
    }
    debug!(
        "{} segments, {} low-quality spans",
        segments.len(),
        low_quality_spans.len()
    );

    SummaryReport {
        frame_count: frames.len() as u64,
        metrics,
        segment_metric: config.segment_metric,
        tolerance: config.tolerance,
        segments,
        low_vmaf_threshold: config.low_vmaf_threshold,
        low_quality_spans,
        warnings,
        frames,
    }
}

/// Greedy left-to-right segmentation. A frame stays in the current segment
/// while the spread of the segment's `kind` values, including its own, is at
/// most `tolerance`. Frames without a value never start a segment.
pub fn segment(frames: &[FrameMetric], kind: MetricKind, tolerance: f64) -> Vec<Segment> {
    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut start = 0usize;
    let mut band: Option<(f64, f64)> = None;

    for (position, frame) in frames.iter().enumerate() {
        let Some(value) = kind.value(frame) else {
            continue;
        };
        band = match band {
            None => Some((value, value)),
            Some((low, high)) => {
                let (new_low, new_high) = (low.min(value), high.max(value));
                if new_high - new_low <= tolerance {
                    Some((new_low, new_high))
                } else {
                    bounds.push((start, position));
                    start = position;
                    Some((value, value))
                }
            }
        };
    }
    if !frames.is_empty() {
        bounds.push((start, frames.len()));
    }

    bounds
        .into_iter()
        .map(|(from, to)| {
            let slice = &frames[from..to];
            let metrics = MetricSummaries::from_frames(slice);
            let grade = metrics
                .get(kind)
                .average()
                .map(|average| QualityGrade::for_value(kind, average));
            Segment {
                start_frame: slice[0].frame,
                end_frame: slice[slice.len() - 1].frame,
                frame_count: slice.len() as u64,
                metrics,
                grade,
            }
        })
        .collect()
}

/// Maximal runs of consecutive frames with VMAF strictly below `threshold`.
/// A frame without VMAF ends a run.
pub fn low_vmaf_spans(frames: &[FrameMetric], threshold: f64) -> Vec<LowQualitySpan> {
    let mut spans = Vec::new();
    let mut current: Vec<&FrameMetric> = Vec::new();

    let mut close = |run: &mut Vec<&FrameMetric>| {
        if let (Some(first), Some(last)) = (run.first(), run.last()) {
            let sum: f64 = run.iter().filter_map(|f| f.vmaf).sum();
            spans.push(LowQualitySpan {
                start_frame: first.frame,
                end_frame: last.frame,
                length: run.len() as u64,
                average_vmaf: sum / run.len() as f64,
            });
        }
        run.clear();
    };

    for frame in frames {
        match frame.vmaf {
            Some(vmaf) if vmaf < threshold => current.push(frame),
            _ => close(&mut current),
        }
    }
    close(&mut current);
    spans
}

fn sanity_warnings(frames: &[FrameMetric], metrics: &MetricSummaries) -> Vec<String> {
    let mut warnings = Vec::new();

    if let MetricSummary::Stats { average, max, .. } = metrics.vmaf {
        if average < 10.0 {
            warnings.push(format!(
                "Mean VMAF is extremely low ({:.2}). The streams may not be frame-synchronized.",
                average
            ));
        }
        if max < 20.0 {
            warnings.push(format!(
                "Maximum VMAF is very low ({:.2}). Check the alignment offset.",
                max
            ));
        }
    }

    let missing = frames.iter().filter(|f| f.vmaf.is_none()).count();
    if missing == frames.len() && !frames.is_empty() {
        warnings.push("No frame carries a VMAF score.".to_string());
    } else if missing > 0 {
        warnings.push(format!(
            "VMAF is missing on {} of {} frames.",
            missing,
            frames.len()
        ));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psnr_frames(values: &[f64]) -> Vec<FrameMetric> {
        values
            .iter()
            .enumerate()
            .map(|(i, &psnr)| FrameMetric {
                frame: i as u64 + 1,
                psnr: Some(psnr),
                vmaf: Some(85.0),
                ..Default::default()
            })
            .collect()
    }

    fn series(frames: Vec<FrameMetric>) -> MetricSeries {
        MetricSeries::from_frames(frames).unwrap()
    }

    fn assert_partition(segments: &[Segment], n: u64) {
        assert_eq!(segments.first().unwrap().start_frame, 1);
        assert_eq!(segments.last().unwrap().end_frame, n);
        for pair in segments.windows(2) {
            assert_eq!(pair[1].start_frame, pair[0].end_frame + 1);
        }
        let total: u64 = segments.iter().map(|s| s.frame_count).sum();
        assert_eq!(total, n);
        for s in segments {
            assert_eq!(s.frame_count, s.end_frame - s.start_frame + 1);
        }
    }

    #[test]
    fn psnr_drop_splits_into_two_segments() {
        let mut values = vec![12.0; 59];
        values.extend(vec![8.0; 6]);
        let report = aggregate(series(psnr_frames(&values)), &AggregationConfig::default());

        assert_eq!(report.segments.len(), 2);
        let (first, second) = (&report.segments[0], &report.segments[1]);
        assert_eq!((first.start_frame, first.end_frame), (1, 59));
        assert_eq!(first.metrics.psnr.average(), Some(12.0));
        assert_eq!((second.start_frame, second.end_frame), (60, 65));
        assert_eq!(second.metrics.psnr.average(), Some(8.0));
        assert_eq!(second.grade, Some(QualityGrade::Poor));
        assert_partition(&report.segments, 65);
    }

    #[test]
    fn band_uses_segment_spread_not_neighbour_step() {
        // Each step is 0.4 but the drift accumulates past the tolerance.
        let values = [30.0, 30.4, 30.8, 31.2, 31.6];
        let segments = segment(&psnr_frames(&values), MetricKind::Psnr, 1.0);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].end_frame, 3);
        assert_eq!(segments[1].start_frame, 4);
    }

    #[test]
    fn frames_without_the_metric_join_the_current_segment() {
        let mut frames = psnr_frames(&[20.0, 20.0, 20.0, 35.0]);
        frames[1].psnr = None;
        frames.push(FrameMetric {
            frame: 5,
            ..Default::default()
        });
        let segments = segment(&frames, MetricKind::Psnr, 0.5);
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start_frame, segments[0].end_frame), (1, 3));
        assert_eq!((segments[1].start_frame, segments[1].end_frame), (4, 5));
        assert_partition(&segments, 5);
    }

    #[test]
    fn segments_partition_noisy_series() {
        let values: Vec<f64> = (0..400)
            .map(|i| 30.0 + ((i * 37) % 11) as f64 * 0.35 - (i / 100) as f64 * 2.0)
            .collect();
        for tolerance in [0.0, 0.5, 1.0, 3.0, 100.0] {
            let segments = segment(&psnr_frames(&values), MetricKind::Psnr, tolerance);
            assert_partition(&segments, 400);
            for s in &segments {
                let (min, max) = (s.metrics.psnr.min().unwrap(), s.metrics.psnr.max().unwrap());
                assert!(max - min <= tolerance);
            }
        }
    }

    #[test]
    fn aggregation_is_bit_reproducible() {
        let frames: Vec<FrameMetric> = (1..=240u64)
            .map(|frame| FrameMetric {
                vmaf: Some(60.0 + (frame as f64 * 0.731).sin() * 25.0),
                ssim: Some(0.9 + (frame as f64 * 0.17).cos() * 0.05),
                ..FrameMetric::with_psnr_components(
                    frame,
                    Some(35.0 + (frame as f64 * 0.1).sin()),
                    Some(41.3),
                    Some(40.9),
                )
            })
            .collect();
        let config = AggregationConfig::default();
        let first = aggregate(series(frames.clone()), &config);
        let second = aggregate(series(frames), &config);

        assert_eq!(first, second);
        let bits = |r: &SummaryReport| r.metrics.vmaf.average().unwrap().to_bits();
        assert_eq!(bits(&first), bits(&second));
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn absent_vmaf_is_no_data() {
        let frames: Vec<FrameMetric> = (1..=10u64)
            .map(|frame| FrameMetric {
                frame,
                ssim: Some(0.98),
                ..Default::default()
            })
            .collect();
        let report = aggregate(series(frames), &AggregationConfig::default());
        assert_eq!(report.metrics.vmaf, MetricSummary::NoData);
        let ssim = report.metrics.ssim.average().unwrap();
        assert!((ssim - 0.98).abs() < 1e-12);
        assert!(report.low_quality_spans.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("No frame carries a VMAF")));

        let json = serde_json::to_value(report.metrics.vmaf).unwrap();
        assert_eq!(json["status"], "no_data");
    }

    #[test]
    fn low_vmaf_spans_are_maximal_runs() {
        let vmaf = [95.0, 50.0, 60.0, 95.0, 40.0, 30.0, 20.0, 96.0, 10.0];
        let frames: Vec<FrameMetric> = vmaf
            .iter()
            .enumerate()
            .map(|(i, &v)| FrameMetric {
                frame: i as u64 + 1,
                vmaf: Some(v),
                ..Default::default()
            })
            .collect();
        let spans = low_vmaf_spans(&frames, 70.0);
        assert_eq!(spans.len(), 3);
        assert_eq!((spans[0].start_frame, spans[0].end_frame, spans[0].length), (2, 3, 2));
        assert_eq!(spans[0].average_vmaf, 55.0);
        assert_eq!((spans[1].start_frame, spans[1].end_frame), (5, 7));
        assert_eq!(spans[1].average_vmaf, 30.0);
        assert_eq!((spans[2].start_frame, spans[2].end_frame), (9, 9));
    }

    #[test]
    fn very_low_vmaf_warns_about_sync() {
        let frames: Vec<FrameMetric> = (1..=5u64)
            .map(|frame| FrameMetric {
                frame,
                vmaf: Some(5.0),
                ..Default::default()
            })
            .collect();
        let report = aggregate(series(frames), &AggregationConfig::default());
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].contains("frame-synchronized"));
    }

    #[test]
    fn grade_bands() {
        assert_eq!(QualityGrade::for_value(MetricKind::Vmaf, 90.0), QualityGrade::Excellent);
        assert_eq!(QualityGrade::for_value(MetricKind::Vmaf, 69.9), QualityGrade::Poor);
        assert_eq!(QualityGrade::for_value(MetricKind::Vmaf, 12.0), QualityGrade::Bad);
        assert_eq!(QualityGrade::for_value(MetricKind::Psnr, 25.0), QualityGrade::Acceptable);
        assert_eq!(QualityGrade::for_value(MetricKind::PsnrY, 19.0), QualityGrade::Poor);
        assert_eq!(QualityGrade::for_value(MetricKind::Ssim, 0.93), QualityGrade::Good);
        assert_eq!(QualityGrade::Acceptable.to_string(), "acceptable");
    }
}
