//! Export gate and representative-frame selection for a closed event window.

use serde::Serialize;
use std::fmt;

use crate::config::DetectionSettings;

/// Where a selected frame sits relative to the event's peak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Stage {
    #[serde(rename = "Before peak")]
    BeforePeak,
    #[serde(rename = "Peak")]
    Peak,
    #[serde(rename = "After peak")]
    AfterPeak,
    #[serde(rename = "Best capture")]
    BestCapture,
    #[serde(rename = "Extra capture")]
    ExtraCapture,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::BeforePeak => "Before peak",
            Stage::Peak => "Peak",
            Stage::AfterPeak => "After peak",
            Stage::BestCapture => "Best capture",
            Stage::ExtraCapture => "Extra capture",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chosen frame, by index into the window's collected frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Pick {
    pub index: usize,
    pub stage: Stage,
    /// 1-based position in the final selection.
    pub rank: usize,
}

/// Aggregates the gate is decided on.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GateSummary {
    pub max_confidence: f32,
    /// First index holding `max_confidence`.
    pub max_index: usize,
    pub high_confidence_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The best frame never reached the notify threshold.
    ConfidenceTooLow,
    /// Enough confidence, but not enough corroborating frames.
    TooFewHighConfidence,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::ConfidenceTooLow => "confidence too low",
            RejectReason::TooFewHighConfidence => "too few high confidence detections",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// Nothing was collected; a non-event.
    Empty,
    Rejected {
        reason: RejectReason,
        summary: GateSummary,
    },
    Accepted {
        picks: Vec<Pick>,
        summary: GateSummary,
    },
}

/// Run the gate and pick frames from `confidences`, given in arrival order.
///
/// Pure and deterministic: the same input always yields the same picks.
pub fn select(confidences: &[f32], settings: &DetectionSettings) -> Selection {
    let Some(summary) = summarize(confidences, settings.notify_threshold) else {
        return Selection::Empty;
    };

    if summary.max_confidence < settings.notify_threshold {
        return Selection::Rejected {
            reason: RejectReason::ConfidenceTooLow,
            summary,
        };
    }
    if summary.high_confidence_count < settings.min_high_confidence_detections {
        return Selection::Rejected {
            reason: RejectReason::TooFewHighConfidence,
            summary,
        };
    }

    let picks = pick_indices(confidences.len(), summary.max_index, settings.max_screenshots);
    Selection::Accepted { picks, summary }
}

fn summarize(confidences: &[f32], notify_threshold: f32) -> Option<GateSummary> {
    let (&first, rest) = confidences.split_first()?;
    let mut max_confidence = first;
    let mut max_index = 0;
    for (i, &c) in rest.iter().enumerate() {
        if c > max_confidence {
            max_confidence = c;
            max_index = i + 1;
        }
    }
    let high_confidence_count = confidences
        .iter()
        .filter(|&&c| c >= notify_threshold)
        .count();
    Some(GateSummary {
        max_confidence,
        max_index,
        high_confidence_count,
    })
}

fn pick_indices(len: usize, max_index: usize, max_screenshots: usize) -> Vec<Pick> {
    if len <= 2 {
        return (0..len)
            .take(max_screenshots)
            .enumerate()
            .map(|(pos, index)| Pick {
                index,
                stage: if index == max_index {
                    Stage::BestCapture
                } else {
                    Stage::ExtraCapture
                },
                rank: pos + 1,
            })
            .collect();
    }

    let mut indices = vec![max_index];
    if max_index > 0 {
        indices.push(max_index - 1);
    }
    if max_index + 1 < len {
        indices.push(max_index + 1);
    }
    indices.sort_unstable();
    indices.dedup();
    // Truncation after sorting keeps the earliest frames, so with two slots the
    // after-peak frame is the one dropped.
    indices.truncate(max_screenshots);

    indices
        .into_iter()
        .enumerate()
        .map(|(pos, index)| Pick {
            index,
            stage: match index.cmp(&max_index) {
                std::cmp::Ordering::Less => Stage::BeforePeak,
                std::cmp::Ordering::Equal => Stage::Peak,
                std::cmp::Ordering::Greater => Stage::AfterPeak,
            },
            rank: pos + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(min_high: usize, max_screenshots: usize) -> DetectionSettings {
        DetectionSettings {
            min_high_confidence_detections: min_high,
            max_screenshots,
            ..DetectionSettings::default()
        }
    }

    fn stages(selection: &Selection) -> Vec<(usize, Stage, usize)> {
        match selection {
            Selection::Accepted { picks, .. } => {
                picks.iter().map(|p| (p.index, p.stage, p.rank)).collect()
            }
            other => panic!("expected accepted selection, got {:?}", other),
        }
    }

    #[test]
    fn empty_window_is_a_non_event() {
        assert_eq!(select(&[], &settings(1, 2)), Selection::Empty);
    }

    #[test]
    fn truncation_keeps_earliest_indices() {
        let sel = select(&[0.86, 0.91, 0.88], &settings(3, 2));
        assert_eq!(
            stages(&sel),
            vec![(0, Stage::BeforePeak, 1), (1, Stage::Peak, 2)]
        );
    }

    #[test]
    fn three_slots_cover_the_peak_neighbourhood() {
        let sel = select(&[0.75, 0.86, 0.91, 0.88, 0.72], &settings(3, 3));
        assert_eq!(
            stages(&sel),
            vec![
                (1, Stage::BeforePeak, 1),
                (2, Stage::Peak, 2),
                (3, Stage::AfterPeak, 3)
            ]
        );
    }

    #[test]
    fn peak_at_the_start_has_no_before_frame() {
        let sel = select(&[0.95, 0.86, 0.85, 0.80], &settings(3, 3));
        assert_eq!(
            stages(&sel),
            vec![(0, Stage::Peak, 1), (1, Stage::AfterPeak, 2)]
        );
    }

    #[test]
    fn ties_resolve_to_the_first_occurrence() {
        let sel = select(&[0.85, 0.92, 0.92, 0.86], &settings(1, 3));
        match &sel {
            Selection::Accepted { summary, .. } => assert_eq!(summary.max_index, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn short_windows_select_everything() {
        let sel = select(&[0.86, 0.9], &settings(2, 2));
        assert_eq!(
            stages(&sel),
            vec![(0, Stage::ExtraCapture, 1), (1, Stage::BestCapture, 2)]
        );

        let sel = select(&[0.9], &settings(1, 2));
        assert_eq!(stages(&sel), vec![(0, Stage::BestCapture, 1)]);
    }

    #[test]
    fn gate_distinguishes_low_confidence_from_too_few_frames() {
        match select(&[0.75, 0.80], &settings(1, 2)) {
            Selection::Rejected { reason, summary } => {
                assert_eq!(reason, RejectReason::ConfidenceTooLow);
                assert_eq!(summary.high_confidence_count, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match select(&[0.75, 0.80, 0.90, 0.86], &settings(3, 2)) {
            Selection::Rejected { reason, summary } => {
                assert_eq!(reason, RejectReason::TooFewHighConfidence);
                assert_eq!(summary.high_confidence_count, 2);
                assert_eq!(reason.to_string(), "too few high confidence detections");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn selection_is_repeatable() {
        let input = [0.7, 0.85, 0.93, 0.9, 0.88, 0.71];
        let s = settings(3, 2);
        assert_eq!(select(&input, &s), select(&input, &s));
    }
}
