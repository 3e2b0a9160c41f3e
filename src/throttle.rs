use chrono::{DateTime, Utc};
use std::time::Duration;

/// Delivery hint returned for every successful export.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    /// 1-based count of successful exports for this source.
    pub sequence: u64,
    /// Cosmetic: loud delivery every Nth notification.
    pub play_sound: bool,
}

/// Cross-event cooldown and loud/silent cadence for one source.
///
/// Only successful exports touch this state. A rejected or empty window leaves
/// both the cooldown and the counter where they were.
#[derive(Clone, Debug)]
pub struct NotificationThrottle {
    cooldown: Duration,
    sound_every_n: u64,
    last_notified_at: Option<DateTime<Utc>>,
    counter: u64,
}

impl NotificationThrottle {
    pub fn new(cooldown: Duration, sound_every_n: u64) -> Self {
        Self {
            cooldown,
            sound_every_n: sound_every_n.max(1),
            last_notified_at: None,
            counter: 0,
        }
    }

    /// Whether a new event window may open at `now`.
    ///
    /// Strictly greater than the cooldown; a frame landing exactly on the
    /// boundary is still throttled.
    pub fn permits(&self, now: DateTime<Utc>) -> bool {
        match self.last_notified_at {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed > self.cooldown,
                Err(_) => false,
            },
        }
    }

    /// Time left before `permits` turns true, zero when it already is.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.last_notified_at {
            None => Duration::ZERO,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                self.cooldown.saturating_sub(elapsed)
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Notification {
        self.counter += 1;
        self.last_notified_at = Some(now);
        Notification {
            sequence: self.counter,
            play_sound: self.counter % self.sound_every_n == 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn last_notified_at(&self) -> Option<DateTime<Utc>> {
        self.last_notified_at
    }
}
