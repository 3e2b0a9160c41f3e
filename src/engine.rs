//! Per-source pipeline: history, event window, selection and throttle.
//!
//! `EventEngine` does no I/O. It consumes one `FrameResult` per processed frame
//! and tells the caller what happened; closed windows that pass the gate come
//! back as an `ExportBatch` for the exporters.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectionSettings;
use crate::frame::{ConfidenceHistory, FrameResult, Image};
use crate::selection::{self, GateSummary, RejectReason, Selection, Stage};
use crate::throttle::{Notification, NotificationThrottle};
use crate::window::{ClosedWindow, CollectedFrame, EventWindow, Origin, StopReason, Transition};

/// A frame chosen for export.
#[derive(Clone, Debug)]
pub struct SelectedFrame {
    pub frame: CollectedFrame,
    pub stage: Stage,
    /// 1-based position within the batch.
    pub rank: usize,
    /// Index within the window's collected frames.
    pub index: usize,
}

impl SelectedFrame {
    pub fn confidence(&self) -> f32 {
        self.frame.confidence()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.frame.frame.timestamp
    }

    pub fn render(&self, annotated: bool) -> Cow<'_, Image> {
        self.frame.render(annotated)
    }
}

/// The outcome of one window that passed the gate.
#[derive(Clone, Debug)]
pub struct ExportBatch {
    pub source: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub max_confidence: f32,
    pub high_confidence_count: usize,
    pub collected_count: usize,
    pub notification: Notification,
    /// Exporters should send annotated renders.
    pub annotated: bool,
    pub frames: Vec<SelectedFrame>,
}

impl ExportBatch {
    pub fn event_duration(&self) -> Duration {
        crate::window::elapsed(self.opened_at, self.closed_at)
    }

    pub fn play_sound(&self) -> bool {
        self.notification.play_sound
    }

    /// The peak or best frame, falling back to the first selected one.
    pub fn lead_frame(&self) -> Option<&SelectedFrame> {
        self.frames
            .iter()
            .find(|f| matches!(f.stage, Stage::Peak | Stage::BestCapture))
            .or_else(|| self.frames.first())
    }

    /// Human-readable text sent alongside a frame.
    pub fn caption(&self, frame: &SelectedFrame) -> String {
        let sound = if self.play_sound() { "🔊" } else { "🔇" };
        format!(
            "{} Detection on {} ({}) - Confidence: {:.2}\nStage: {} - Rank {}/{}\nEvent duration: {:.1}s",
            sound,
            self.source,
            frame.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true),
            frame.confidence(),
            frame.stage,
            frame.rank,
            self.frames.len(),
            self.event_duration().as_secs_f32(),
        )
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            source: self.source.clone(),
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            event_duration_secs: self.event_duration().as_secs_f64(),
            stop_reason: self.stop_reason,
            max_confidence: self.max_confidence,
            high_confidence_count: self.high_confidence_count,
            collected_count: self.collected_count,
            notification_sequence: self.notification.sequence,
            play_sound: self.notification.play_sound,
            frames: self
                .frames
                .iter()
                .map(|f| FrameSummary {
                    frame_number: f.frame.frame.frame_number,
                    timestamp: f.timestamp(),
                    confidence: f.confidence(),
                    stage: f.stage,
                    rank: f.rank,
                    origin: f.frame.origin,
                })
                .collect(),
        }
    }
}

/// Serialisable view of an `ExportBatch`, without pixels.
#[derive(Clone, Debug, Serialize)]
pub struct EventSummary {
    pub source: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub event_duration_secs: f64,
    pub stop_reason: StopReason,
    pub max_confidence: f32,
    pub high_confidence_count: usize,
    pub collected_count: usize,
    pub notification_sequence: u64,
    pub play_sound: bool,
    pub frames: Vec<FrameSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FrameSummary {
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub stage: Stage,
    pub rank: usize,
    pub origin: Origin,
}

/// What a closed window amounted to.
#[derive(Debug)]
pub enum WindowOutcome {
    /// Closed with nothing collected.
    NonEvent { window: ClosedWindow },
    Rejected {
        window: ClosedWindow,
        reason: RejectReason,
        summary: GateSummary,
    },
    Exported(ExportBatch),
}

/// Result of feeding one frame.
#[derive(Debug)]
pub enum Step {
    Idle,
    Throttled,
    Opened { seeded: usize },
    Collecting,
    Closed(WindowOutcome),
}

/// Counters kept by the engine itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub frames: u64,
    pub windows_opened: u64,
    pub non_events: u64,
    pub rejected_low_confidence: u64,
    pub rejected_too_few: u64,
    pub exports: u64,
}

/// What was left behind when the engine shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames held by a window that was still open, now discarded.
    pub discarded_frames: Option<usize>,
    pub counters: EngineCounters,
}

pub struct EventEngine {
    source: String,
    settings: DetectionSettings,
    history: ConfidenceHistory,
    window: EventWindow,
    throttle: NotificationThrottle,
    counters: EngineCounters,
}

impl EventEngine {
    pub fn new(source: impl Into<String>, settings: DetectionSettings) -> Self {
        Self {
            source: source.into(),
            history: ConfidenceHistory::new(settings.history_capacity),
            window: EventWindow::new(settings.clone()),
            throttle: NotificationThrottle::new(
                settings.cooldown_period,
                settings.sound_every_n_notifications,
            ),
            settings,
            counters: EngineCounters::default(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            windows_opened: self.window.opened_count(),
            ..self.counters
        }
    }

    pub fn history(&self) -> &ConfidenceHistory {
        &self.history
    }

    pub fn throttle(&self) -> &NotificationThrottle {
        &self.throttle
    }

    pub fn window_open(&self) -> bool {
        self.window.is_open()
    }

    /// Feed one frame, in arrival order.
    pub fn process(&mut self, frame: FrameResult) -> Step {
        let frame = Arc::new(frame);
        self.counters.frames += 1;

        let transition = self.window.observe(&frame, &self.history, &self.throttle);
        // The window looks at the history as it was before this frame.
        self.history.push(Arc::clone(&frame));

        match transition {
            Transition::Idle => Step::Idle,
            Transition::Throttled => {
                log::debug!(
                    "{} - qualifying frame ({:.2}) ignored, cooldown active for another {:.1}s",
                    self.source,
                    frame.confidence,
                    self.throttle.remaining(frame.timestamp).as_secs_f32()
                );
                Step::Throttled
            }
            Transition::Opened { seeded } => {
                log::debug!(
                    "{} - event window opened at {:.2} with {} history frame(s), collecting for up to {:.0}s",
                    self.source,
                    frame.confidence,
                    seeded,
                    self.settings.max_collection_time.as_secs_f32()
                );
                Step::Opened { seeded }
            }
            Transition::Collecting => Step::Collecting,
            Transition::Closed(window) => Step::Closed(self.finish(window)),
        }
    }

    /// Discard any open window. Its frames are counted, never exported.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let discarded_frames = self.window.discard();
        if let Some(n) = discarded_frames {
            log::info!(
                "{} - discarding open event window with {} frame(s) on shutdown",
                self.source,
                n
            );
        }
        ShutdownReport {
            discarded_frames,
            counters: self.counters(),
        }
    }

    fn finish(&mut self, window: ClosedWindow) -> WindowOutcome {
        log::debug!(
            "{} - event window closed after {:.1}s with {} frame(s): {}",
            self.source,
            window.duration().as_secs_f32(),
            window.collected.len(),
            window.stop_reason
        );

        match selection::select(&window.confidences(), &self.settings) {
            Selection::Empty => {
                self.counters.non_events += 1;
                log::debug!("{} - window closed without frames, not an event", self.source);
                WindowOutcome::NonEvent { window }
            }
            Selection::Rejected { reason, summary } => {
                match reason {
                    RejectReason::ConfidenceTooLow => self.counters.rejected_low_confidence += 1,
                    RejectReason::TooFewHighConfidence => self.counters.rejected_too_few += 1,
                }
                log::info!(
                    "{} - no notification: {} (max {:.2}, {}/{} frames at or above {:.2})",
                    self.source,
                    reason,
                    summary.max_confidence,
                    summary.high_confidence_count,
                    self.settings.min_high_confidence_detections,
                    self.settings.notify_threshold
                );
                WindowOutcome::Rejected {
                    window,
                    reason,
                    summary,
                }
            }
            Selection::Accepted { picks, summary } => {
                let notification = self.throttle.record_success(window.closed_at);
                self.counters.exports += 1;
                log::info!(
                    "{} - event #{} accepted: max {:.2}, {} high confidence frame(s), {} selected, {}",
                    self.source,
                    notification.sequence,
                    summary.max_confidence,
                    summary.high_confidence_count,
                    picks.len(),
                    if notification.play_sound { "with sound" } else { "silent" }
                );
                let frames = picks
                    .iter()
                    .map(|pick| SelectedFrame {
                        frame: window.collected[pick.index].clone(),
                        stage: pick.stage,
                        rank: pick.rank,
                        index: pick.index,
                    })
                    .collect();
                WindowOutcome::Exported(ExportBatch {
                    source: self.source.clone(),
                    opened_at: window.opened_at,
                    closed_at: window.closed_at,
                    stop_reason: window.stop_reason,
                    max_confidence: summary.max_confidence,
                    high_confidence_count: summary.high_confidence_count,
                    collected_count: window.collected.len(),
                    notification,
                    annotated: self.settings.send_annotated_images,
                    frames,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + (secs * 1000.0) as i64)
            .unwrap()
    }

    fn frame(n: u64, secs: f64, confidence: f32) -> FrameResult {
        let mut f = FrameResult::empty(n, at(secs), Image::blank(8, 8));
        f.confidence = confidence;
        f
    }

    fn run(engine: &mut EventEngine, samples: &[(f64, f32)]) -> Vec<WindowOutcome> {
        samples
            .iter()
            .enumerate()
            .filter_map(|(i, &(t, c))| match engine.process(frame(i as u64, t, c)) {
                Step::Closed(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn accepted_window_produces_batch_and_starts_cooldown() {
        let settings = DetectionSettings {
            min_high_confidence_detections: 2,
            ..DetectionSettings::default()
        };
        let mut engine = EventEngine::new("barn", settings);
        let outcomes = run(
            &mut engine,
            &[(0.0, 0.75), (0.5, 0.86), (1.0, 0.88), (1.5, 0.2)],
        );
        assert_eq!(outcomes.len(), 1);
        let batch = match &outcomes[0] {
            WindowOutcome::Exported(batch) => batch,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(batch.source, "barn");
        assert_eq!(batch.stop_reason, StopReason::ImmediateConfidence);
        assert_eq!(batch.high_confidence_count, 2);
        assert_eq!(batch.notification.sequence, 1);
        let stages: Vec<Stage> = batch.frames.iter().map(|f| f.stage).collect();
        assert_eq!(stages, vec![Stage::BeforePeak, Stage::Peak]);
        assert_eq!(batch.lead_frame().map(|f| f.index), Some(2));
        assert!(batch.caption(&batch.frames[1]).contains("Rank 2/2"));

        assert_eq!(engine.throttle().counter(), 1);
        assert!(!engine.throttle().permits(at(30.0)));
    }

    #[test]
    fn rejected_window_leaves_throttle_untouched() {
        let mut engine = EventEngine::new("barn", DetectionSettings::default());
        let outcomes = run(&mut engine, &[(0.0, 0.75), (1.0, 0.8), (2.0, 0.9)]);
        match &outcomes[..] {
            [WindowOutcome::Rejected { reason, .. }] => {
                assert_eq!(*reason, RejectReason::TooFewHighConfidence)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.throttle().counter(), 0);
        assert!(engine.throttle().last_notified_at().is_none());
        assert_eq!(engine.counters().rejected_too_few, 1);
    }

    #[test]
    fn shutdown_discards_open_window() {
        let mut engine = EventEngine::new("barn", DetectionSettings::default());
        run(&mut engine, &[(0.0, 0.75), (0.5, 0.78)]);
        assert!(engine.window_open());
        let report = engine.shutdown();
        assert_eq!(report.discarded_frames, Some(2));
        assert!(!engine.window_open());
        assert_eq!(report.counters.exports, 0);
    }

    #[test]
    fn summary_serialises_without_pixels() {
        let settings = DetectionSettings {
            min_high_confidence_detections: 1,
            ..DetectionSettings::default()
        };
        let mut engine = EventEngine::new("yard", settings);
        let outcomes = run(&mut engine, &[(0.0, 0.9), (1.0, 0.9)]);
        let WindowOutcome::Exported(batch) = &outcomes[0] else {
            panic!("expected export");
        };
        let json = serde_json::to_value(batch.summary()).unwrap();
        assert_eq!(json["source"], "yard");
        assert_eq!(json["stop_reason"], "immediate_confidence");
        assert_eq!(json["frames"][0]["stage"], "Best capture");
        assert_eq!(json["frames"][1]["stage"], "Extra capture");
        assert_eq!(engine.counters().windows_opened, 1);
    }
}
