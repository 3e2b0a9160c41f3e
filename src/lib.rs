//! peakwatch
//!
//! Watches camera streams with an object detector and turns bursts of
//! detections into a few well-chosen frames per event.
//!
//! # Pipeline
//!
//! For every source, independently:
//!
//! 1. `ingest` acquires frames (RTSP, synthetic `stub://` streams, JPEG
//!    directories) and `detect` scores them.
//! 2. `frame::ConfidenceHistory` keeps the last few processed frames.
//! 3. `window::EventWindow` opens when a frame reaches the save threshold and
//!    the cooldown allows it, seeds itself from recent history, and closes on
//!    peak settling, an immediate high confidence frame, inactivity, or the
//!    collection time limit.
//! 4. `selection` gates the closed window and picks the frames around its peak.
//! 5. `throttle::NotificationThrottle` enforces the cooldown between exports.
//! 6. `export` delivers accepted batches to disk, Telegram and MQTT from a
//!    bounded per-source queue.
//!
//! `engine::EventEngine` ties steps 2 to 5 together without doing any I/O;
//! `runner` owns the threads.
//!
//! # Module Structure
//!
//! - `config`: file, environment and default settings
//! - `error`: failure classes the worker acts on
//! - `frame`: images, per-frame results, confidence history
//! - `detect`: detector backends
//! - `ingest`: frame sources
//! - `window`, `selection`, `throttle`, `engine`: the event pipeline
//! - `export`: exporters and the per-source dispatcher
//! - `runner`: source workers and their supervisor

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod runner;
pub mod selection;
pub mod throttle;
pub mod window;

pub use config::{DetectionSettings, PeakwatchConfig, SourceSettings};
pub use detect::{Detection, DetectionResult, DetectorBackend};
pub use engine::{EventEngine, ExportBatch, Step, WindowOutcome};
pub use error::{DetectError, IngestError};
pub use export::{Exporter, ExportDispatcher};
pub use frame::{ConfidenceHistory, FrameResult, Image};
pub use ingest::{open_source, FrameSource};
pub use runner::{SourceWorker, Supervisor};
pub use selection::{select, Selection, Stage};
pub use throttle::NotificationThrottle;
pub use window::{EventWindow, StopReason};
