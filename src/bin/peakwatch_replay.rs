//! peakwatch_replay - run a recorded confidence trace through the event engine
//!
//! Input is JSON Lines, one processed frame per line:
//!
//! ```text
//! {"t": 0.0, "confidence": 0.0}
//! {"t": 0.5, "confidence": 0.91}
//! ```
//!
//! `t` is seconds since the start of the trace. Every closed window is printed
//! to stdout as one JSON object, so thresholds can be tuned offline.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use peakwatch::config::{DetectionSettings, DiskSettings, PeakwatchConfig};
use peakwatch::engine::{EventEngine, Step, WindowOutcome};
use peakwatch::export::{DiskExporter, Exporter};
use peakwatch::frame::{FrameResult, Image};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON Lines trace (`-` for stdin).
    #[arg(long)]
    input: PathBuf,

    /// Take detection settings from this configuration file.
    #[arg(long, env = "PEAKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Source whose settings to use (defaults to the first one).
    #[arg(long)]
    source: Option<String>,

    /// Also write exported batches to this directory.
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TraceLine {
    t: f64,
    confidence: f32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let (name, settings) = detection_settings(&args)?;
    let mut engine = EventEngine::new(name, settings);
    let disk = match &args.save_dir {
        Some(dir) => Some(DiskExporter::new(DiskSettings {
            directory: dir.clone(),
            group_by_event: true,
        })?),
        None => None,
    };

    let reader: Box<dyn BufRead> = if args.input.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(&args.input)
            .with_context(|| format!("open trace {}", args.input.display()))?;
        Box::new(BufReader::new(file))
    };

    let start = DateTime::<Utc>::UNIX_EPOCH;
    let mut frame_number = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: TraceLine = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid trace entry", line_no + 1))?;
        if !entry.t.is_finite() || entry.t < 0.0 {
            return Err(anyhow!("line {}: t must be a non-negative number", line_no + 1));
        }
        frame_number += 1;
        let timestamp = start + ChronoDuration::milliseconds((entry.t * 1000.0).round() as i64);
        let mut frame = FrameResult::empty(frame_number, timestamp, Image::blank(64, 48));
        frame.confidence = entry.confidence.clamp(0.0, 1.0);

        if let Step::Closed(outcome) = engine.process(frame) {
            let record = describe(&outcome, start);
            println!("{}", serde_json::to_string(&record)?);
            if let (Some(disk), WindowOutcome::Exported(batch)) = (&disk, &outcome) {
                disk.export(batch)?;
            }
        }
    }

    let report = engine.shutdown();
    eprintln!(
        "{}",
        serde_json::to_string(&json!({
            "counters": report.counters,
            "discarded_frames": report.discarded_frames,
        }))?
    );
    Ok(())
}

fn detection_settings(args: &Args) -> Result<(String, DetectionSettings)> {
    if args.config.is_none() {
        return Ok((
            args.source.clone().unwrap_or_else(|| "replay".to_string()),
            DetectionSettings::default(),
        ));
    }
    let config = PeakwatchConfig::load_from(args.config.as_deref())?;
    let source = match &args.source {
        Some(name) => config
            .sources
            .into_iter()
            .find(|s| &s.name == name)
            .ok_or_else(|| anyhow!("no source named {} in configuration", name))?,
        None => config
            .sources
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("configuration has no sources"))?,
    };
    Ok((source.name, source.detection))
}

fn offset_secs(start: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - start).num_milliseconds() as f64 / 1000.0
}

fn describe(outcome: &WindowOutcome, start: DateTime<Utc>) -> serde_json::Value {
    match outcome {
        WindowOutcome::NonEvent { window } => json!({
            "outcome": "non_event",
            "opened_at": offset_secs(start, window.opened_at),
            "closed_at": offset_secs(start, window.closed_at),
            "stop_reason": window.stop_reason,
        }),
        WindowOutcome::Rejected {
            window,
            reason,
            summary,
        } => json!({
            "outcome": "rejected",
            "reason": reason,
            "opened_at": offset_secs(start, window.opened_at),
            "closed_at": offset_secs(start, window.closed_at),
            "stop_reason": window.stop_reason,
            "confidences": window.confidences(),
            "summary": summary,
        }),
        WindowOutcome::Exported(batch) => json!({
            "outcome": "exported",
            "opened_at": offset_secs(start, batch.opened_at),
            "closed_at": offset_secs(start, batch.closed_at),
            "stop_reason": batch.stop_reason,
            "notification": batch.notification.sequence,
            "play_sound": batch.play_sound(),
            "frames": batch
                .frames
                .iter()
                .map(|f| json!({
                    "t": offset_secs(start, f.timestamp()),
                    "confidence": f.confidence(),
                    "stage": f.stage,
                    "rank": f.rank,
                }))
                .collect::<Vec<_>>(),
        }),
    }
}
