// src/offset.rs

//! Turns trigger positions (or the manual fallback) into an [`AlignmentPlan`].

use crate::config::AlignmentConfig;
use crate::error::{Result, VqaError};
use crate::trigger::TriggerEvent;
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OffsetSource {
    Triggers,
    Manual,
}

/// Frame correspondence between the two streams: reference frame
/// `reference_start + i` pairs with captured frame `captured_start + i` for
/// every `i < usable_frame_count`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPlan {
    /// `captured - reference`, in frames.
    pub offset: i64,
    pub reference_start: u64,
    pub captured_start: u64,
    pub usable_frame_count: u64,
    pub source: OffsetSource,
    /// Aligned frames before the earliest closing marker, when closing
    /// markers bounded the range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_limit: Option<u64>,
}

/// Triggers detected for the run, kept for the report.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectedTriggers {
    pub reference: Option<TriggerEvent>,
    pub captured: Option<TriggerEvent>,
    #[serde(default)]
    pub reference_closing: Option<TriggerEvent>,
    #[serde(default)]
    pub captured_closing: Option<TriggerEvent>,
}

/// Computes the alignment for streams of `reference_frames` and
/// `captured_frames` frames. Closing triggers, when detected, end the range
/// at the earlier of the two.
pub fn resolve_plan(
    triggers: &DetectedTriggers,
    reference_frames: u64,
    captured_frames: u64,
    config: &AlignmentConfig,
) -> Result<AlignmentPlan> {
    let min_confidence = config.trigger.min_confidence;
    let usable_trigger = |trigger: Option<TriggerEvent>, which: &str| {
        trigger.filter(|t| {
            let confident = t.confidence >= min_confidence;
            if !confident {
                warn!(
                    "Ignoring {} trigger at frame {}: confidence {:.3} below {:.3}",
                    which, t.frame_index, t.confidence, min_confidence
                );
            }
            confident
        })
    };

    let (offset, source) = match (
        usable_trigger(triggers.reference, "reference"),
        usable_trigger(triggers.captured, "captured"),
    ) {
        (Some(reference), Some(captured)) => (
            captured.frame_index as i64 - reference.frame_index as i64,
            OffsetSource::Triggers,
        ),
        (reference, captured) => {
            if config.trigger.enabled {
                warn!(
                    "Trigger missing (reference: {}, captured: {}), using manual offset {}",
                    reference.is_some(),
                    captured.is_some(),
                    config.manual_offset
                );
            }
            (config.manual_offset, OffsetSource::Manual)
        }
    };

    // Closing markers are stream positions; measured from each stream's
    // aligned start they bound the pairs that precede both of them.
    let reference_start = offset.min(0).unsigned_abs();
    let captured_start = offset.max(0).unsigned_abs();
    let closing_bound = |closing: Option<TriggerEvent>, start: u64, which: &str| {
        let closing = usable_trigger(closing, which)?;
        if closing.frame_index <= start {
            warn!(
                "Ignoring {} trigger at frame {}: not after the aligned start {}",
                which, closing.frame_index, start
            );
            return None;
        }
        Some(closing.frame_index - start)
    };
    let closing_limit = match (
        closing_bound(triggers.reference_closing, reference_start, "reference closing"),
        closing_bound(triggers.captured_closing, captured_start, "captured closing"),
    ) {
        (Some(reference), Some(captured)) => Some(reference.min(captured)),
        (one, other) => one.or(other),
    };

    let limit = match (config.max_frames, closing_limit) {
        (Some(max_frames), Some(closing)) => Some(max_frames.min(closing)),
        (max_frames, closing) => max_frames.or(closing),
    };
    let mut plan = plan_for_offset(offset, source, reference_frames, captured_frames, limit)?;
    plan.closing_limit = closing_limit.filter(|&closing| closing == plan.usable_frame_count);
    if let Some(closing) = plan.closing_limit {
        info!("Closing trigger ends the aligned range after {} frames", closing);
    }
    info!(
        "Alignment: offset {} ({:?}), reference from frame {}, captured from frame {}, {} usable frames",
        plan.offset, plan.source, plan.reference_start, plan.captured_start, plan.usable_frame_count
    );
    Ok(plan)
}

/// `usable = min(reference - max(0, -offset), captured - max(0, offset))`,
/// optionally capped at `max_frames`.
pub fn plan_for_offset(
    offset: i64,
    source: OffsetSource,
    reference_frames: u64,
    captured_frames: u64,
    max_frames: Option<u64>,
) -> Result<AlignmentPlan> {
    let reference_start = offset.min(0).unsigned_abs();
    let captured_start = offset.max(0).unsigned_abs();

    let usable = reference_frames
        .saturating_sub(reference_start)
        .min(captured_frames.saturating_sub(captured_start));
    let usable = max_frames.map_or(usable, |limit| usable.min(limit));

    if usable == 0 {
        return Err(VqaError::InsufficientOverlap {
            offset,
            reference_frames,
            captured_frames,
        });
    }

    Ok(AlignmentPlan {
        offset,
        reference_start,
        captured_start,
        usable_frame_count: usable,
        source,
        closing_limit: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(frame_index: u64, confidence: f64) -> Option<TriggerEvent> {
        Some(TriggerEvent {
            frame_index,
            run_length: 3,
            confidence,
        })
    }

    #[test]
    fn both_triggers_set_the_offset() {
        let triggers = DetectedTriggers {
            reference: trigger(10, 0.9),
            captured: trigger(15, 0.9),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 200, 190, &AlignmentConfig::default()).unwrap();
        assert_eq!(plan.offset, 5);
        assert_eq!(plan.reference_start, 0);
        assert_eq!(plan.captured_start, 5);
        assert_eq!(plan.usable_frame_count, 185);
        assert_eq!(plan.source, OffsetSource::Triggers);
    }

    #[test]
    fn capture_starting_early_gives_negative_offset() {
        let triggers = DetectedTriggers {
            reference: trigger(30, 0.9),
            captured: trigger(12, 0.9),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 100, 100, &AlignmentConfig::default()).unwrap();
        assert_eq!(plan.offset, -18);
        assert_eq!(plan.reference_start, 18);
        assert_eq!(plan.captured_start, 0);
        assert_eq!(plan.usable_frame_count, 82);
    }

    #[test]
    fn single_trigger_falls_back_to_manual_offset() {
        let config = AlignmentConfig {
            manual_offset: 7,
            ..AlignmentConfig::default()
        };
        let triggers = DetectedTriggers {
            reference: trigger(10, 0.9),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 50, 60, &config).unwrap();
        assert_eq!(plan.offset, 7);
        assert_eq!(plan.source, OffsetSource::Manual);
        assert_eq!(plan.usable_frame_count, 50);
    }

    #[test]
    fn no_triggers_and_no_manual_offset_means_zero() {
        let plan = resolve_plan(&DetectedTriggers::default(), 40, 30, &AlignmentConfig::default())
            .unwrap();
        assert_eq!(plan.offset, 0);
        assert_eq!(plan.usable_frame_count, 30);
    }

    #[test]
    fn low_confidence_trigger_counts_as_missing() {
        let mut config = AlignmentConfig::default();
        config.trigger.min_confidence = 0.8;
        let triggers = DetectedTriggers {
            reference: trigger(10, 0.95),
            captured: trigger(40, 0.5),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 100, 100, &config).unwrap();
        assert_eq!(plan.source, OffsetSource::Manual);
        assert_eq!(plan.offset, 0);
    }

    #[test]
    fn closing_triggers_end_the_aligned_range() {
        let triggers = DetectedTriggers {
            reference: trigger(10, 0.9),
            captured: trigger(15, 0.9),
            reference_closing: trigger(160, 0.9),
            captured_closing: trigger(170, 0.9),
        };
        let plan = resolve_plan(&triggers, 200, 190, &AlignmentConfig::default()).unwrap();
        assert_eq!(plan.offset, 5);
        // Reference bound 160 - 0, captured bound 170 - 5; the earlier wins.
        assert_eq!(plan.usable_frame_count, 160);
        assert_eq!(plan.closing_limit, Some(160));
    }

    #[test]
    fn one_closing_trigger_is_enough() {
        let triggers = DetectedTriggers {
            reference: trigger(30, 0.9),
            captured: trigger(12, 0.9),
            captured_closing: trigger(70, 0.9),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 100, 100, &AlignmentConfig::default()).unwrap();
        assert_eq!(plan.offset, -18);
        assert_eq!(plan.usable_frame_count, 70);
        assert_eq!(plan.closing_limit, Some(70));
    }

    #[test]
    fn closing_trigger_past_the_overlap_changes_nothing() {
        let triggers = DetectedTriggers {
            reference: trigger(10, 0.9),
            captured: trigger(15, 0.9),
            reference_closing: trigger(199, 0.9),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 200, 190, &AlignmentConfig::default()).unwrap();
        assert_eq!(plan.usable_frame_count, 185);
        assert_eq!(plan.closing_limit, None);
    }

    #[test]
    fn max_frames_below_closing_trigger_wins() {
        let config = AlignmentConfig {
            max_frames: Some(50),
            ..AlignmentConfig::default()
        };
        let triggers = DetectedTriggers {
            reference_closing: trigger(120, 0.9),
            ..DetectedTriggers::default()
        };
        let plan = resolve_plan(&triggers, 200, 200, &config).unwrap();
        assert_eq!(plan.usable_frame_count, 50);
        assert_eq!(plan.closing_limit, None);
    }

    #[test]
    fn unusable_closing_triggers_are_ignored() {
        let mut config = AlignmentConfig::default();
        config.trigger.min_confidence = 0.8;
        let triggers = DetectedTriggers {
            reference: trigger(10, 0.9),
            captured: trigger(40, 0.9),
            // Below the confidence floor.
            reference_closing: trigger(100, 0.5),
            // At the captured stream's aligned start.
            captured_closing: trigger(30, 0.9),
        };
        let plan = resolve_plan(&triggers, 200, 200, &config).unwrap();
        assert_eq!(plan.offset, 30);
        assert_eq!(plan.usable_frame_count, 170);
        assert_eq!(plan.closing_limit, None);
    }

    #[test]
    fn max_frames_truncates() {
        let plan = plan_for_offset(0, OffsetSource::Manual, 500, 500, Some(120)).unwrap();
        assert_eq!(plan.usable_frame_count, 120);
    }

    #[test]
    fn offset_past_the_end_is_insufficient_overlap() {
        let err = plan_for_offset(190, OffsetSource::Manual, 200, 190, None).unwrap_err();
        assert!(matches!(
            err,
            VqaError::InsufficientOverlap {
                offset: 190,
                reference_frames: 200,
                captured_frames: 190
            }
        ));
        assert!(plan_for_offset(-200, OffsetSource::Manual, 200, 190, None).is_err());
    }

    #[test]
    fn usable_count_matches_formula_over_a_grid() {
        for reference_len in [1u64, 7, 50] {
            for captured_len in [1u64, 9, 48] {
                for offset in -60i64..=60 {
                    let expected = reference_len as i64 - (-offset).max(0);
                    let expected = expected.min(captured_len as i64 - offset.max(0));
                    match plan_for_offset(offset, OffsetSource::Manual, reference_len, captured_len, None) {
                        Ok(plan) => {
                            assert!(plan.usable_frame_count >= 1);
                            assert_eq!(plan.usable_frame_count as i64, expected);
                            assert_eq!(plan.captured_start as i64 - plan.reference_start as i64, offset);
                        }
                        Err(_) => assert!(expected <= 0),
                    }
                }
            }
        }
    }
}
