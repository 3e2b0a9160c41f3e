//! Per-source export lanes.
//!
//! The frame loop hands accepted batches to `ExportDispatcher::submit`, which
//! never blocks. Every exporter gets its own bounded queue and thread, so a
//! slow or failing exporter only backs up its own lane; a full lane drops the
//! batch for that exporter alone. Operator messages travel the same lanes and
//! arrive after any batch queued before them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::Exporter;
use crate::engine::ExportBatch;

pub const DEFAULT_QUEUE_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("export queue full for {}, batch dropped", .exporters.join(", "))]
    QueueFull { exporters: Vec<String> },
    #[error("export thread for {} has stopped", .exporters.join(", "))]
    Closed { exporters: Vec<String> },
}

enum Job {
    Export(Arc<ExportBatch>),
    Operator(Arc<str>),
}

#[derive(Debug, Default)]
struct LaneCounters {
    exporter: String,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    submitted: AtomicU64,
    lanes: Vec<LaneCounters>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LaneSnapshot {
    pub exporter: String,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Totals across lanes plus the per-exporter breakdown.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub submitted: u64,
    pub dropped: u64,
    /// Exporter calls that succeeded.
    pub delivered: u64,
    /// Exporter calls that failed.
    pub exporter_failures: u64,
    pub lanes: Vec<LaneSnapshot>,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchSnapshot {
        let lanes: Vec<LaneSnapshot> = self
            .lanes
            .iter()
            .map(|lane| LaneSnapshot {
                exporter: lane.exporter.clone(),
                delivered: lane.delivered.load(Ordering::Relaxed),
                failed: lane.failed.load(Ordering::Relaxed),
                dropped: lane.dropped.load(Ordering::Relaxed),
            })
            .collect();
        DispatchSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: lanes.iter().map(|l| l.dropped).sum(),
            delivered: lanes.iter().map(|l| l.delivered).sum(),
            exporter_failures: lanes.iter().map(|l| l.failed).sum(),
            lanes,
        }
    }
}

struct Lane {
    exporter: String,
    sender: SyncSender<Job>,
    handle: JoinHandle<()>,
}

pub struct ExportDispatcher {
    source: String,
    lanes: Vec<Lane>,
    counters: Arc<DispatchCounters>,
}

impl ExportDispatcher {
    /// Start one export thread per exporter, each behind a queue of
    /// `queue_depth` jobs.
    pub fn spawn(
        source: impl Into<String>,
        exporters: Vec<Arc<dyn Exporter>>,
        queue_depth: usize,
    ) -> anyhow::Result<Self> {
        let source = source.into();
        let counters = Arc::new(DispatchCounters {
            submitted: AtomicU64::new(0),
            lanes: exporters
                .iter()
                .map(|e| LaneCounters {
                    exporter: e.name().to_string(),
                    ..LaneCounters::default()
                })
                .collect(),
        });

        let mut lanes = Vec::with_capacity(exporters.len());
        for (index, exporter) in exporters.into_iter().enumerate() {
            let (sender, receiver) = mpsc::sync_channel(queue_depth.max(1));
            let name = exporter.name().to_string();
            let thread_source = source.clone();
            let thread_counters = Arc::clone(&counters);
            let handle = std::thread::Builder::new()
                .name(format!("export-{}-{}", source, name))
                .spawn(move || {
                    run_lane(
                        &thread_source,
                        exporter.as_ref(),
                        receiver,
                        &thread_counters.lanes[index],
                    )
                })?;
            lanes.push(Lane {
                exporter: name,
                sender,
                handle,
            });
        }

        Ok(Self {
            source,
            lanes,
            counters,
        })
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    /// Queue a batch on every lane without blocking. The batch still goes to
    /// every lane that had room when some others are full or stopped.
    pub fn submit(&self, batch: ExportBatch) -> Result<(), SubmitError> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let sequence = batch.notification.sequence;
        let batch = Arc::new(batch);
        let mut full = Vec::new();
        let mut closed = Vec::new();

        for (lane, counters) in self.lanes.iter().zip(&self.counters.lanes) {
            match lane.sender.try_send(Job::Export(Arc::clone(&batch))) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "{} - {} export queue full, dropping event #{}",
                        self.source,
                        lane.exporter,
                        sequence
                    );
                    full.push(lane.exporter.clone());
                }
                Err(TrySendError::Disconnected(_)) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    closed.push(lane.exporter.clone());
                }
            }
        }

        if !closed.is_empty() {
            Err(SubmitError::Closed { exporters: closed })
        } else if !full.is_empty() {
            Err(SubmitError::QueueFull { exporters: full })
        } else {
            Ok(())
        }
    }

    /// Queue an operator message on every lane without blocking.
    pub fn notify_operator(&self, message: &str) {
        let message: Arc<str> = Arc::from(message);
        for lane in &self.lanes {
            if let Err(e) = lane.sender.try_send(Job::Operator(Arc::clone(&message))) {
                let why = match e {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Disconnected(_) => "export thread stopped",
                };
                log::warn!(
                    "{} - {} operator message dropped ({})",
                    self.source,
                    lane.exporter,
                    why
                );
            }
        }
    }

    /// Stop accepting jobs, let queued ones finish, and wait up to `timeout`
    /// for every lane. Returns whether all of them finished in time.
    pub fn shutdown(self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut handles = Vec::with_capacity(self.lanes.len());
        for lane in self.lanes {
            drop(lane.sender);
            handles.push((lane.exporter, lane.handle));
        }

        let mut all_finished = true;
        for (exporter, handle) in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!(
                    "{} - {} export thread still busy after {:.1}s, leaving it behind",
                    self.source,
                    exporter,
                    timeout.as_secs_f32()
                );
                all_finished = false;
            }
        }
        all_finished
    }
}

fn run_lane(
    source: &str,
    exporter: &dyn Exporter,
    receiver: Receiver<Job>,
    counters: &LaneCounters,
) {
    for job in receiver {
        match job {
            Job::Export(batch) => match exporter.export(&batch) {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "{} - event #{} delivered to {}",
                        source,
                        batch.notification.sequence,
                        exporter.name()
                    );
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "{} - {} exporter failed for event #{}: {:#}",
                        source,
                        exporter.name(),
                        batch.notification.sequence,
                        e
                    );
                }
            },
            Job::Operator(message) => {
                if let Err(e) = exporter.notify_operator(&message) {
                    log::error!(
                        "{}: failed to deliver operator message: {:#}",
                        exporter.name(),
                        e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_batch(sequence: u64) -> ExportBatch {
    use crate::engine::SelectedFrame;
    use crate::frame::{FrameResult, Image};
    use crate::selection::Stage;
    use crate::throttle::Notification;
    use crate::window::{CollectedFrame, Origin, StopReason};

    let now = chrono::Utc::now();
    let mut frame = FrameResult::empty(1, now, Image::blank(4, 4));
    frame.confidence = 0.9;
    ExportBatch {
        source: "barn".to_string(),
        opened_at: now,
        closed_at: now,
        stop_reason: StopReason::ImmediateConfidence,
        max_confidence: 0.9,
        high_confidence_count: 1,
        collected_count: 1,
        notification: Notification {
            sequence,
            play_sound: false,
        },
        annotated: false,
        frames: vec![SelectedFrame {
            frame: CollectedFrame {
                frame: Arc::new(frame),
                origin: Origin::Live,
            },
            stage: Stage::BestCapture,
            rank: 1,
            index: 0,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(u64, Instant)>>,
        operator: Mutex<Vec<String>>,
    }

    impl Recording {
        fn sequences(&self) -> Vec<u64> {
            self.seen.lock().unwrap().iter().map(|(s, _)| *s).collect()
        }
    }

    impl Exporter for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn export(&self, batch: &ExportBatch) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((batch.notification.sequence, Instant::now()));
            Ok(())
        }

        fn notify_operator(&self, message: &str) -> anyhow::Result<()> {
            self.operator.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl Exporter for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn export(&self, _batch: &ExportBatch) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("unreachable host"))
        }
    }

    struct Stalled {
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Exporter for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        fn export(&self, _batch: &ExportBatch) -> anyhow::Result<()> {
            let _ = self.release.lock().unwrap().recv();
            Ok(())
        }
    }

    struct Panicking;

    impl Exporter for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn export(&self, _batch: &ExportBatch) -> anyhow::Result<()> {
            panic!("exporter bug");
        }
    }

    fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    #[test]
    fn failing_exporter_does_not_affect_its_sibling() {
        let recording = Arc::new(Recording::default());
        let exporters: Vec<Arc<dyn Exporter>> = vec![
            Arc::new(Failing) as Arc<dyn Exporter>,
            recording.clone() as Arc<dyn Exporter>,
        ];
        let dispatcher = ExportDispatcher::spawn("barn", exporters, 4).unwrap();
        let counters = dispatcher.counters();
        dispatcher.submit(test_batch(7)).unwrap();
        assert!(dispatcher.shutdown(Duration::from_secs(5)));

        assert_eq!(recording.sequences(), vec![7]);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.exporter_failures, 1);
        assert_eq!(snapshot.lanes[0].exporter, "failing");
        assert_eq!(snapshot.lanes[0].failed, 1);
        assert_eq!(snapshot.lanes[1].delivered, 1);
    }

    #[test]
    fn stalled_exporter_does_not_delay_later_batches_for_its_sibling() {
        let (release_tx, release_rx) = mpsc::channel();
        let stalled: Arc<dyn Exporter> = Arc::new(Stalled {
            release: Mutex::new(release_rx),
        });
        let recording = Arc::new(Recording::default());
        let dispatcher = ExportDispatcher::spawn(
            "barn",
            vec![stalled, recording.clone() as Arc<dyn Exporter>],
            4,
        )
        .unwrap();

        let started = Instant::now();
        dispatcher.submit(test_batch(1)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        dispatcher.submit(test_batch(2)).unwrap();

        assert!(wait_for(Duration::from_secs(2), || recording.sequences().len() == 2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(recording.sequences(), vec![1, 2]);

        drop(release_tx);
        assert!(dispatcher.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn queued_jobs_are_delivered_in_order_before_shutdown() {
        let recording = Arc::new(Recording::default());
        let dispatcher =
            ExportDispatcher::spawn("barn", vec![recording.clone() as Arc<dyn Exporter>], 8)
                .unwrap();
        let counters = dispatcher.counters();
        for seq in 1..=3 {
            dispatcher.submit(test_batch(seq)).unwrap();
        }
        dispatcher.notify_operator("barn - detection stopped");
        assert!(dispatcher.shutdown(Duration::from_secs(5)));

        assert_eq!(recording.sequences(), vec![1, 2, 3]);
        assert_eq!(
            *recording.operator.lock().unwrap(),
            vec!["barn - detection stopped".to_string()]
        );
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.delivered, 3);
        assert_eq!(snapshot.exporter_failures, 0);
    }

    #[test]
    fn full_lane_drops_only_for_that_exporter() {
        let (release_tx, release_rx) = mpsc::channel();
        let stalled: Arc<dyn Exporter> = Arc::new(Stalled {
            release: Mutex::new(release_rx),
        });
        let recording = Arc::new(Recording::default());
        let dispatcher = ExportDispatcher::spawn(
            "barn",
            vec![stalled, recording.clone() as Arc<dyn Exporter>],
            1,
        )
        .unwrap();
        let counters = dispatcher.counters();

        // First batch occupies the stalled lane, the rest overflow its queue.
        let mut saw_full = false;
        for seq in 1..10 {
            match dispatcher.submit(test_batch(seq)) {
                Ok(()) => {}
                Err(SubmitError::QueueFull { exporters }) => {
                    saw_full = true;
                    assert!(exporters.contains(&"stalled".to_string()));
                }
                Err(e) => panic!("unexpected {:?}", e),
            }
            assert!(wait_for(Duration::from_secs(2), || recording
                .sequences()
                .contains(&seq)));
        }
        assert!(saw_full);
        let snapshot = counters.snapshot();
        assert!(snapshot.lanes[0].dropped >= 1);
        assert_eq!(snapshot.lanes[1].dropped, 0);
        assert_eq!(snapshot.lanes[1].delivered, 9);

        drop(release_tx);
        assert!(dispatcher.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn dead_lane_reports_closed() {
        let dispatcher =
            ExportDispatcher::spawn("barn", vec![Arc::new(Panicking) as Arc<dyn Exporter>], 4)
                .unwrap();
        let mut seq = 0;
        let closed = wait_for(Duration::from_secs(5), || {
            seq += 1;
            matches!(
                dispatcher.submit(test_batch(seq)),
                Err(SubmitError::Closed { .. })
            )
        });
        assert!(closed);
        assert!(dispatcher.shutdown(Duration::from_secs(5)));
    }
}
