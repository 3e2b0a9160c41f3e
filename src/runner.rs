//! Per-source workers and their supervisor.
//!
//! Every configured source gets one OS thread that owns its frame source,
//! detector, engine and export queue. Nothing in that loop is shared with
//! other sources except the exporters, so one camera failing or stalling never
//! holds back another.

use anyhow::{anyhow, Result};
use chrono::{Local, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{PeakwatchConfig, SourceSettings};
use crate::detect::{build_backend, DetectorBackend};
use crate::engine::{EngineCounters, EventEngine, ExportBatch, Step, WindowOutcome};
use crate::error::{DetectError, IngestError};
use crate::export::dispatch::DEFAULT_QUEUE_DEPTH;
use crate::export::{
    broadcast_operator, DispatchCounters, DispatchSnapshot, ExportDispatcher, Exporter,
    SubmitError,
};
use crate::frame::FrameResult;
use crate::ingest::{open_source, FrameSource};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Consecutive acquisition failures before the operator is alerted.
pub const FAILURE_ALERT_THRESHOLD: u32 = 5;
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Starting,
    Running,
    Reconnecting,
    Stopped,
    Failed,
}

/// Live counters for one worker, readable from any thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    frames_processed: AtomicU64,
    acquisition_failures: AtomicU64,
    inference_failures: AtomicU64,
    windows_opened: AtomicU64,
    exports_accepted: AtomicU64,
    exports_rejected: AtomicU64,
    non_events: AtomicU64,
    state: Mutex<WorkerState>,
    last_error: Mutex<Option<String>>,
    dispatch: Mutex<Option<Arc<DispatchCounters>>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkerStatsSnapshot {
    pub state: WorkerState,
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub frames_processed: u64,
    pub acquisition_failures: u64,
    pub inference_failures: u64,
    pub windows_opened: u64,
    pub exports_accepted: u64,
    pub exports_rejected: u64,
    pub non_events: u64,
    pub dispatch: DispatchSnapshot,
    pub last_error: Option<String>,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            state: self.state(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            acquisition_failures: self.acquisition_failures.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            windows_opened: self.windows_opened.load(Ordering::Relaxed),
            exports_accepted: self.exports_accepted.load(Ordering::Relaxed),
            exports_rejected: self.exports_rejected.load(Ordering::Relaxed),
            non_events: self.non_events.load(Ordering::Relaxed),
            dispatch: self
                .dispatch
                .lock()
                .ok()
                .and_then(|d| d.as_ref().map(|d| d.snapshot()))
                .unwrap_or_default(),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.lock().map(|s| *s).unwrap_or(WorkerState::Failed)
    }

    fn set_state(&self, state: WorkerState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn record_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    fn attach_dispatch(&self, counters: Arc<DispatchCounters>) {
        if let Ok(mut dispatch) = self.dispatch.lock() {
            *dispatch = Some(counters);
        }
    }

    fn sync_engine(&self, counters: EngineCounters) {
        self.windows_opened
            .store(counters.windows_opened, Ordering::Relaxed);
        self.exports_accepted.store(counters.exports, Ordering::Relaxed);
        self.exports_rejected.store(
            counters.rejected_low_confidence + counters.rejected_too_few,
            Ordering::Relaxed,
        );
        self.non_events.store(counters.non_events, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Doubling reconnect delay, reset by the first good frame.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::starting_at(INITIAL_BACKOFF)
    }

    pub fn starting_at(initial: Duration) -> Self {
        Self {
            initial,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

/// Why a worker's loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    /// A finite source ran out of frames.
    Exhausted,
    Failed(String),
}

impl WorkerExit {
    fn describe(&self) -> String {
        match self {
            WorkerExit::Shutdown => "shutdown requested".to_string(),
            WorkerExit::Exhausted => "source has no more frames".to_string(),
            WorkerExit::Failed(reason) => format!("error: {}", reason),
        }
    }
}

pub struct SourceWorker {
    settings: SourceSettings,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    engine: EventEngine,
    dispatcher: ExportDispatcher,
    stats: Arc<WorkerStats>,
    shutdown: Arc<AtomicBool>,
    join_timeout: Duration,
    initial_backoff: Duration,
}

impl SourceWorker {
    /// Open the source and detector described by `settings`.
    pub fn build(
        settings: SourceSettings,
        exporters: Vec<Arc<dyn Exporter>>,
        stats: Arc<WorkerStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let source = open_source(&settings.url, settings.target_fps)?;
        let detector = build_backend(&settings.detector)?;
        Self::with_parts(settings, source, detector, exporters, stats, shutdown)
    }

    pub fn with_parts(
        settings: SourceSettings,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        exporters: Vec<Arc<dyn Exporter>>,
        stats: Arc<WorkerStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let dispatcher =
            ExportDispatcher::spawn(settings.name.clone(), exporters, DEFAULT_QUEUE_DEPTH)?;
        stats.attach_dispatch(dispatcher.counters());
        Ok(Self {
            engine: EventEngine::new(settings.name.clone(), settings.detection.clone()),
            settings,
            source,
            detector,
            dispatcher,
            stats,
            shutdown,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Drive the source until shutdown, exhaustion or a fatal error, then
    /// flush the export queue and report.
    pub fn run(mut self) -> WorkerExit {
        let exit = self.run_loop();

        let report = self.engine.shutdown();
        self.stats.sync_engine(report.counters);
        self.stats.set_state(match exit {
            WorkerExit::Failed(_) => WorkerState::Failed,
            _ => WorkerState::Stopped,
        });
        if let WorkerExit::Failed(reason) = &exit {
            self.stats.record_error(reason.clone());
            log::error!("{} - worker stopped: {}", self.settings.name, reason);
        }

        let snapshot = self.stats.snapshot();
        let message = format!(
            "{} - detection stopped at {}\nReason: {}\nTotal frames processed: {}\nTotal notifications sent: {}\nAcquisition failures: {}",
            self.settings.name,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            exit.describe(),
            snapshot.frames_processed,
            report.counters.exports,
            snapshot.acquisition_failures,
        );
        log::info!("{}", message.replace('\n', "; "));
        self.dispatcher.notify_operator(&message);
        self.dispatcher.shutdown(self.join_timeout);
        exit
    }

    fn run_loop(&mut self) -> WorkerExit {
        let name = self.settings.name.clone();
        if let Err(e) = self.detector.warm_up() {
            return WorkerExit::Failed(format!("detector warm-up failed: {}", e));
        }
        log::info!(
            "{} - worker started ({} on {}, every {} frame(s))",
            name,
            self.detector.name(),
            self.source.url(),
            self.settings.detection.process_every_n_frames
        );

        let mut backoff = Backoff::starting_at(self.initial_backoff);
        let mut connected = false;
        let mut consecutive_failures = 0u32;
        let mut frame_number = 0u64;

        while !self.shutdown.load(Ordering::SeqCst) {
            if !connected {
                match self.source.connect() {
                    Ok(()) => {
                        connected = true;
                        self.stats.set_state(WorkerState::Running);
                    }
                    Err(e) => {
                        if let Some(exit) =
                            self.acquisition_failed(e, &mut consecutive_failures, &mut backoff)
                        {
                            return exit;
                        }
                        continue;
                    }
                }
            }

            let captured = match self.source.next_frame() {
                Ok(captured) => captured,
                Err(e) => {
                    connected = false;
                    if let Some(exit) =
                        self.acquisition_failed(e, &mut consecutive_failures, &mut backoff)
                    {
                        return exit;
                    }
                    continue;
                }
            };
            if consecutive_failures >= FAILURE_ALERT_THRESHOLD {
                let message = format!(
                    "{} - camera stream recovered after {} failed attempts",
                    name, consecutive_failures
                );
                log::info!("{}", message);
                self.dispatcher.notify_operator(&message);
            }
            consecutive_failures = 0;
            backoff.reset();
            self.stats.set_state(WorkerState::Running);

            frame_number += 1;
            self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
            if frame_number % self.settings.detection.process_every_n_frames != 0 {
                self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let result = match self.detector.detect(&captured.image) {
                Ok(detections) => FrameResult::from_detections(
                    frame_number,
                    captured.captured_at,
                    captured.image,
                    detections.filtered(
                        self.settings.detector.confidence_floor,
                        self.settings.detector.classes.as_deref(),
                    ),
                    self.settings.detection.annotate_live,
                ),
                Err(DetectError::Frame(msg)) => {
                    self.stats.inference_failures.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_error(format!("inference: {}", msg));
                    log::warn!("{} - inference failed on frame {}: {}", name, frame_number, msg);
                    FrameResult::empty(frame_number, captured.captured_at, captured.image)
                }
                Err(DetectError::Backend(msg)) => {
                    self.stats.inference_failures.fetch_add(1, Ordering::Relaxed);
                    return WorkerExit::Failed(format!("detector unusable: {}", msg));
                }
            };

            self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);
            if frame_number % 100 == 0 {
                log::debug!("{} - frames processed: {}", name, frame_number);
            }

            let step = self.engine.process(result);
            self.stats.sync_engine(self.engine.counters());
            if let Step::Closed(WindowOutcome::Exported(batch)) = step {
                self.hand_off(batch);
            }
        }
        WorkerExit::Shutdown
    }

    fn hand_off(&self, batch: ExportBatch) {
        match self.dispatcher.submit(batch) {
            Ok(()) => {}
            // Full lanes are logged and counted by the dispatcher.
            Err(SubmitError::QueueFull { .. }) => {}
            Err(e @ SubmitError::Closed { .. }) => {
                log::error!("{} - {}", self.settings.name, e);
                self.stats.record_error(e.to_string());
            }
        }
    }

    /// Count and log one failure, wait out the backoff, and say whether the
    /// worker has to stop.
    fn acquisition_failed(
        &mut self,
        err: IngestError,
        consecutive_failures: &mut u32,
        backoff: &mut Backoff,
    ) -> Option<WorkerExit> {
        match &err {
            IngestError::Exhausted => return Some(WorkerExit::Exhausted),
            IngestError::Fatal(msg) => return Some(WorkerExit::Failed(msg.clone())),
            IngestError::Disconnected(_) => {}
        }

        *consecutive_failures += 1;
        self.stats.acquisition_failures.fetch_add(1, Ordering::Relaxed);
        self.stats.record_error(err.to_string());
        self.stats.set_state(WorkerState::Reconnecting);

        let delay = backoff.next_delay();
        log::warn!(
            "{} - {} (attempt {}), retrying in {:.0}s",
            self.settings.name,
            err,
            consecutive_failures,
            delay.as_secs_f32()
        );
        if *consecutive_failures == FAILURE_ALERT_THRESHOLD {
            let message = format!(
                "{} - camera stream unavailable after {} attempts: {}",
                self.settings.name, consecutive_failures, err
            );
            self.dispatcher.notify_operator(&message);
        }
        sleep_unless_shutdown(&self.shutdown, delay);
        None
    }
}

fn sleep_unless_shutdown(shutdown: &AtomicBool, delay: Duration) {
    let deadline = Instant::now() + delay;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

// ----------------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------------

struct WorkerHandle {
    name: String,
    stats: Arc<WorkerStats>,
    join: JoinHandle<WorkerExit>,
}

/// Starts one worker per source and stops them together.
pub struct Supervisor {
    workers: Vec<WorkerHandle>,
    exporters: Vec<Arc<dyn Exporter>>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn start(config: &PeakwatchConfig, exporters: Vec<Arc<dyn Exporter>>) -> Result<Self> {
        let names: Vec<&str> = config.sources.iter().map(|s| s.name.as_str()).collect();
        let message = format!(
            "peakwatch started at {} watching {} source(s): {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            names.len(),
            names.join(", ")
        );
        log::info!("{}", message);
        broadcast_operator(&exporters, &message);

        let mut supervisor = Self::empty(exporters);
        for settings in &config.sources {
            supervisor.spawn(settings.clone())?;
        }
        Ok(supervisor)
    }

    /// Spawn a worker whose source and detector are opened inside its own
    /// thread, so a bad camera or model only takes down that worker.
    fn spawn(&mut self, settings: SourceSettings) -> Result<()> {
        let name = settings.name.clone();
        let stats = Arc::new(WorkerStats::default());
        let exporters = self.exporters.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let thread_stats = Arc::clone(&stats);
        let join = std::thread::Builder::new()
            .name(format!("source-{}", name))
            .spawn(move || {
                let worker_name = settings.name.clone();
                match SourceWorker::build(settings, exporters.clone(), Arc::clone(&thread_stats), shutdown)
                {
                    Ok(worker) => worker.run(),
                    Err(e) => {
                        let reason = format!("{:#}", e);
                        thread_stats.set_state(WorkerState::Failed);
                        thread_stats.record_error(reason.clone());
                        log::error!("{} - failed to start: {}", worker_name, reason);
                        broadcast_operator(
                            &exporters,
                            &format!("{} - failed to start at {}: {}", worker_name, Utc::now(), reason),
                        );
                        WorkerExit::Failed(reason)
                    }
                }
            })
            .map_err(|e| anyhow!("spawn worker thread for {}: {}", name, e))?;
        self.workers.push(WorkerHandle { name, stats, join });
        Ok(())
    }

    pub fn empty(exporters: Vec<Arc<dyn Exporter>>) -> Self {
        Self {
            workers: Vec::new(),
            exporters,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Vec<(String, WorkerStatsSnapshot)> {
        self.workers
            .iter()
            .map(|w| (w.name.clone(), w.stats.snapshot()))
            .collect()
    }

    /// True while at least one worker thread is still running.
    pub fn any_running(&self) -> bool {
        self.workers.iter().any(|w| !w.join.is_finished())
    }

    /// Signal every worker and wait up to `timeout` in total. Workers that do
    /// not finish in time are left detached and reported by name.
    pub fn stop(self, timeout: Duration) -> Vec<(String, Option<WorkerExit>)> {
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut exits = Vec::new();
        for worker in self.workers {
            while !worker.join.is_finished() && Instant::now() < deadline {
                std::thread::sleep(SHUTDOWN_POLL);
            }
            if worker.join.is_finished() {
                let exit = worker
                    .join
                    .join()
                    .unwrap_or_else(|_| WorkerExit::Failed("worker thread panicked".to_string()));
                exits.push((worker.name, Some(exit)));
            } else {
                log::warn!(
                    "{} - worker did not stop within {:.1}s",
                    worker.name,
                    timeout.as_secs_f32()
                );
                exits.push((worker.name, None));
            }
        }
        for exporter in &self.exporters {
            if let Err(e) = exporter.close() {
                log::warn!("{}: close failed: {:#}", exporter.name(), e);
            }
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionSettings;
    use crate::detect::{DetectionResult, DetectorSettings};
    use crate::frame::Image;
    use crate::ingest::{CapturedFrame, RtspConfig, RtspSource};

    /// Fails every other frame, or every frame fatally.
    struct FlakyDetector {
        calls: u64,
        fatal: bool,
    }

    impl DetectorBackend for FlakyDetector {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn detect(&mut self, _image: &Image) -> Result<DetectionResult, DetectError> {
            self.calls += 1;
            if self.fatal {
                return Err(DetectError::backend("model file truncated"));
            }
            if self.calls % 2 == 0 {
                return Err(DetectError::frame("tensor shape mismatch"));
            }
            Ok(DetectionResult::none())
        }
    }

    fn worker_with(detector: FlakyDetector, frames: u64) -> (SourceWorker, Arc<WorkerStats>) {
        let url = format!("stub://flaky?frames={}&pace=false", frames);
        let settings = SourceSettings {
            name: "flaky".to_string(),
            url: url.clone(),
            target_fps: 10,
            detector: DetectorSettings::default(),
            detection: DetectionSettings {
                process_every_n_frames: 1,
                ..DetectionSettings::default()
            },
        };
        let source = RtspSource::new(RtspConfig {
            url,
            ..RtspConfig::default()
        })
        .unwrap();
        let stats = Arc::new(WorkerStats::default());
        let worker = SourceWorker::with_parts(
            settings,
            Box::new(source),
            Box::new(detector),
            Vec::new(),
            Arc::clone(&stats),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        (worker, stats)
    }

    #[test]
    fn frame_level_inference_errors_count_as_empty_frames() {
        let (worker, stats) = worker_with(
            FlakyDetector {
                calls: 0,
                fatal: false,
            },
            10,
        );
        assert_eq!(worker.name(), "flaky");
        assert_eq!(worker.run(), WorkerExit::Exhausted);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_processed, 10);
        assert_eq!(snapshot.inference_failures, 5);
        assert_eq!(snapshot.state, WorkerState::Stopped);
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("tensor shape mismatch")));
    }

    #[test]
    fn unusable_backend_stops_the_worker() {
        let (worker, stats) = worker_with(
            FlakyDetector {
                calls: 0,
                fatal: true,
            },
            10,
        );
        match worker.run() {
            WorkerExit::Failed(reason) => assert!(reason.contains("model file truncated")),
            other => panic!("expected failure, got {:?}", other),
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.state, WorkerState::Failed);
        assert_eq!(snapshot.frames_processed, 0);
    }

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    #[test]
    fn sleep_returns_early_on_shutdown() {
        let flag = AtomicBool::new(true);
        let started = Instant::now();
        sleep_unless_shutdown(&flag, Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// Refuses `refusals` connects, then yields `frames` frames.
    struct RefusingSource {
        refusals: u32,
        frames: u64,
        captured: u64,
        connected: bool,
    }

    impl FrameSource for RefusingSource {
        fn url(&self) -> &str {
            "test://refusing"
        }

        fn connect(&mut self) -> Result<(), IngestError> {
            if self.refusals > 0 {
                self.refusals -= 1;
                return Err(IngestError::disconnected("connection refused"));
            }
            self.connected = true;
            Ok(())
        }

        fn next_frame(&mut self) -> Result<CapturedFrame, IngestError> {
            if self.captured >= self.frames {
                return Err(IngestError::Exhausted);
            }
            self.captured += 1;
            Ok(CapturedFrame {
                image: Image::blank(8, 8),
                captured_at: Utc::now(),
            })
        }

        fn is_healthy(&self) -> bool {
            self.connected
        }

        fn frames_captured(&self) -> u64 {
            self.captured
        }
    }

    /// An operator channel that takes a second per message.
    #[derive(Default)]
    struct SlowOperator {
        messages: Mutex<Vec<String>>,
    }

    impl Exporter for SlowOperator {
        fn name(&self) -> &str {
            "slow-operator"
        }

        fn export(&self, _batch: &ExportBatch) -> Result<()> {
            Ok(())
        }

        fn notify_operator(&self, message: &str) -> Result<()> {
            std::thread::sleep(Duration::from_secs(1));
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct Panicking;

    impl Exporter for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn export(&self, _batch: &ExportBatch) -> Result<()> {
            panic!("exporter bug");
        }
    }

    fn plain_settings(name: &str) -> SourceSettings {
        SourceSettings {
            name: name.to_string(),
            url: "test://refusing".to_string(),
            target_fps: 10,
            detector: DetectorSettings::default(),
            detection: DetectionSettings {
                process_every_n_frames: 1,
                ..DetectionSettings::default()
            },
        }
    }

    #[test]
    fn slow_operator_channel_does_not_stall_the_frame_loop() {
        let operator = Arc::new(SlowOperator::default());
        let stats = Arc::new(WorkerStats::default());
        let mut worker = SourceWorker::with_parts(
            plain_settings("porch"),
            Box::new(RefusingSource {
                refusals: FAILURE_ALERT_THRESHOLD,
                frames: 20,
                captured: 0,
                connected: false,
            }),
            Box::new(FlakyDetector {
                calls: 1,
                fatal: false,
            }),
            vec![operator.clone() as Arc<dyn Exporter>],
            Arc::clone(&stats),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        worker.initial_backoff = Duration::from_millis(1);
        worker.join_timeout = Duration::ZERO;

        // Outage, recovery and stop messages would take three seconds inline.
        let started = Instant::now();
        assert_eq!(worker.run(), WorkerExit::Exhausted);
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(stats.snapshot().frames_processed, 20);
        assert_eq!(stats.snapshot().acquisition_failures, 5);

        let deadline = Instant::now() + Duration::from_secs(10);
        while operator.messages.lock().unwrap().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        let messages = operator.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with("porch - camera stream unavailable after 5 attempts"));
        assert!(messages[1].starts_with("porch - camera stream recovered"));
        assert!(messages[2].starts_with("porch - detection stopped"));
    }

    #[test]
    fn dead_export_thread_is_recorded_as_last_error() {
        let stats = Arc::new(WorkerStats::default());
        let worker = SourceWorker::with_parts(
            plain_settings("shed"),
            Box::new(RefusingSource {
                refusals: 0,
                frames: 0,
                captured: 0,
                connected: false,
            }),
            Box::new(FlakyDetector {
                calls: 0,
                fatal: false,
            }),
            vec![Arc::new(Panicking) as Arc<dyn Exporter>],
            Arc::clone(&stats),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut sequence = 0;
        while stats.snapshot().last_error.is_none() && Instant::now() < deadline {
            sequence += 1;
            worker.hand_off(crate::export::dispatch::test_batch(sequence));
            std::thread::sleep(Duration::from_millis(10));
        }
        let last_error = stats.snapshot().last_error.unwrap();
        assert!(last_error.contains("panicking"), "{}", last_error);
        assert!(last_error.contains("stopped"), "{}", last_error);
    }

    #[test]
    fn backoff_can_start_below_the_default() {
        let mut backoff = Backoff::starting_at(Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn fresh_stats_snapshot_is_zeroed() {
        let stats = WorkerStats::default();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.state, WorkerState::Starting);
        assert_eq!(snapshot.frames_processed, 0);
        assert!(snapshot.last_error.is_none());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "starting");
    }
}
