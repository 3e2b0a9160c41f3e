//! Event window state machine.
//!
//! One window per source. It opens on the first frame at or above the save
//! threshold (when the throttle allows), accumulates qualifying frames, and
//! closes when any stop condition holds:
//!
//! - peak latched and `min_collection_time` elapsed since open
//! - `max_collection_time` elapsed since open
//! - the frame reaches `immediate_threshold` and at least one second elapsed
//! - no qualifying frame for `inactivity_stop_time`
//!
//! With `peak_detection_enabled = false` the window keeps only its best frame
//! and closes on `max_collection_time` alone.
//!
//! Time comes from frame timestamps only, never the wall clock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectionSettings;
use crate::frame::{ConfidenceHistory, FrameResult, Image};
use crate::throttle::NotificationThrottle;

/// Minimum window age before the immediate-confidence stop may fire.
pub const IMMEDIATE_MIN_DURATION: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Arrived while the window was open.
    Live,
    /// Copied from the confidence history when the window opened.
    History,
}

/// A frame held by a window, shared with the history.
#[derive(Clone, Debug)]
pub struct CollectedFrame {
    pub frame: Arc<FrameResult>,
    pub origin: Origin,
}

impl CollectedFrame {
    pub fn confidence(&self) -> f32 {
        self.frame.confidence
    }

    /// Image for export. Seeded frames get the confidence marker instead of
    /// their detector boxes when annotated output is requested.
    pub fn render(&self, annotated: bool) -> Cow<'_, Image> {
        match self.origin {
            Origin::History if annotated => {
                Cow::Owned(self.frame.image.with_confidence_marker(self.frame.confidence))
            }
            _ => self.frame.render(annotated),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    PeakSettled,
    MaxDuration,
    ImmediateConfidence,
    Inactivity,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::PeakSettled => "peak reached and minimum collection time elapsed",
            StopReason::MaxDuration => "maximum collection time reached",
            StopReason::ImmediateConfidence => "immediate confidence threshold reached",
            StopReason::Inactivity => "inactivity timeout",
        })
    }
}

/// Everything a closed window hands to selection.
#[derive(Clone, Debug)]
pub struct ClosedWindow {
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub collected: Vec<CollectedFrame>,
    pub max_confidence_seen: f32,
    pub peak_flagged: bool,
    pub stop_reason: StopReason,
}

impl ClosedWindow {
    pub fn duration(&self) -> Duration {
        elapsed(self.opened_at, self.closed_at)
    }

    pub fn confidences(&self) -> Vec<f32> {
        self.collected.iter().map(|c| c.confidence()).collect()
    }
}

/// What one frame did to the window.
#[derive(Debug)]
pub enum Transition {
    /// No window open and none opened.
    Idle,
    /// The frame qualified but the throttle kept the window shut.
    Throttled,
    /// A window opened on this frame and is still open.
    Opened { seeded: usize },
    /// The window was already open and stays open.
    Collecting,
    Closed(ClosedWindow),
}

struct OpenWindow {
    opened_at: DateTime<Utc>,
    collected: Vec<CollectedFrame>,
    max_confidence_seen: f32,
    peak_flagged: bool,
    last_qualifying_at: DateTime<Utc>,
}

enum State {
    Idle,
    Collecting(OpenWindow),
}

pub struct EventWindow {
    settings: DetectionSettings,
    state: State,
    last_closed_at: Option<DateTime<Utc>>,
    opened_count: u64,
}

impl EventWindow {
    pub fn new(settings: DetectionSettings) -> Self {
        Self {
            settings,
            state: State::Idle,
            last_closed_at: None,
            opened_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Collecting(_))
    }

    /// Frames held by the open window, zero when idle.
    pub fn collected_len(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Collecting(open) => open.collected.len(),
        }
    }

    /// Windows opened over the lifetime of this state machine.
    pub fn opened_count(&self) -> u64 {
        self.opened_count
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            State::Idle => None,
            State::Collecting(open) => Some(open.opened_at),
        }
    }

    /// Feed one frame. `history` must not yet contain `frame`.
    pub fn observe(
        &mut self,
        frame: &Arc<FrameResult>,
        history: &ConfidenceHistory,
        throttle: &NotificationThrottle,
    ) -> Transition {
        let now = frame.timestamp;
        let qualifies = frame.qualifies(self.settings.save_threshold);

        let mut seeded = None;
        if let State::Idle = self.state {
            if !qualifies {
                return Transition::Idle;
            }
            if !throttle.permits(now) {
                return Transition::Throttled;
            }
            let open = self.open(now, history);
            seeded = Some(open.collected.len());
            self.opened_count += 1;
            self.state = State::Collecting(open);
        }

        let State::Collecting(open) = &mut self.state else {
            return Transition::Idle;
        };

        if self.settings.peak_detection_enabled {
            if qualifies {
                open.collected.push(CollectedFrame {
                    frame: Arc::clone(frame),
                    origin: Origin::Live,
                });
                open.max_confidence_seen = open.max_confidence_seen.max(frame.confidence);
                open.last_qualifying_at = now;
                if !open.peak_flagged && frame.confidence >= self.settings.peak_detection_threshold
                {
                    open.peak_flagged = true;
                    log::debug!(
                        "peak latched at {:.2} after {:.1}s",
                        frame.confidence,
                        elapsed(open.opened_at, now).as_secs_f32()
                    );
                }
            }
        } else if qualifies && frame.confidence > open.max_confidence_seen {
            open.collected.clear();
            open.collected.push(CollectedFrame {
                frame: Arc::clone(frame),
                origin: Origin::Live,
            });
            open.max_confidence_seen = frame.confidence;
            open.last_qualifying_at = now;
        }

        match stop_reason(&self.settings, open, frame.confidence, now) {
            Some(reason) => Transition::Closed(self.close(now, reason)),
            None => match seeded {
                Some(seeded) => Transition::Opened { seeded },
                None => Transition::Collecting,
            },
        }
    }

    /// Drop the open window without selection. Returns how many frames it held.
    pub fn discard(&mut self) -> Option<usize> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => None,
            State::Collecting(open) => Some(open.collected.len()),
        }
    }

    fn open(&self, now: DateTime<Utc>, history: &ConfidenceHistory) -> OpenWindow {
        let mut collected = Vec::new();
        let mut max_confidence_seen = 0.0f32;
        if self.settings.peak_detection_enabled {
            // Frames that already belonged to an earlier window stay out.
            for past in history.qualifying(self.settings.save_threshold) {
                if matches!(self.last_closed_at, Some(closed) if past.timestamp <= closed) {
                    continue;
                }
                max_confidence_seen = max_confidence_seen.max(past.confidence);
                collected.push(CollectedFrame {
                    frame: Arc::clone(past),
                    origin: Origin::History,
                });
            }
        }
        OpenWindow {
            opened_at: now,
            collected,
            max_confidence_seen,
            peak_flagged: false,
            last_qualifying_at: now,
        }
    }

    fn close(&mut self, now: DateTime<Utc>, stop_reason: StopReason) -> ClosedWindow {
        self.last_closed_at = Some(now);
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Collecting(open) => ClosedWindow {
                opened_at: open.opened_at,
                closed_at: now,
                collected: open.collected,
                max_confidence_seen: open.max_confidence_seen,
                peak_flagged: open.peak_flagged,
                stop_reason,
            },
            State::Idle => ClosedWindow {
                opened_at: now,
                closed_at: now,
                collected: Vec::new(),
                max_confidence_seen: 0.0,
                peak_flagged: false,
                stop_reason,
            },
        }
    }
}

fn stop_reason(
    settings: &DetectionSettings,
    open: &OpenWindow,
    confidence: f32,
    now: DateTime<Utc>,
) -> Option<StopReason> {
    let age = elapsed(open.opened_at, now);
    if !settings.peak_detection_enabled {
        return (age >= settings.max_collection_time).then_some(StopReason::MaxDuration);
    }
    if open.peak_flagged && age >= settings.min_collection_time {
        return Some(StopReason::PeakSettled);
    }
    if age >= settings.max_collection_time {
        return Some(StopReason::MaxDuration);
    }
    if confidence >= settings.immediate_threshold && age >= IMMEDIATE_MIN_DURATION {
        return Some(StopReason::ImmediateConfidence);
    }
    if elapsed(open.last_qualifying_at, now) >= settings.inactivity_stop_time {
        return Some(StopReason::Inactivity);
    }
    None
}

/// `to - from`, clamped at zero if frames arrive out of clock order.
pub(crate) fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
