//! peakwatchd - detection event daemon
//!
//! This daemon:
//! 1. Loads the source and exporter configuration
//! 2. Starts one worker thread per camera source
//! 3. Exports accepted events to disk, Telegram and/or MQTT
//! 4. Stops every worker on Ctrl-C, or once all finite sources are exhausted

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use peakwatch::config::PeakwatchConfig;
use peakwatch::export::build_exporters;
use peakwatch::runner::{Supervisor, DEFAULT_JOIN_TIMEOUT};

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch camera streams and export peak detection frames")]
struct Args {
    /// Path to the TOML or JSON configuration file.
    #[arg(long, env = "PEAKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between per-source health log lines (0 disables).
    #[arg(long, env = "PEAKWATCH_HEALTH_INTERVAL", default_value_t = 60)]
    health_interval: u64,

    /// Seconds to wait for workers to stop on shutdown.
    #[arg(long, default_value_t = DEFAULT_JOIN_TIMEOUT.as_secs())]
    shutdown_timeout: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = PeakwatchConfig::load_from(args.config.as_deref())?;
    log::info!(
        "peakwatchd {} starting with {} source(s)",
        env!("CARGO_PKG_VERSION"),
        config.sources.len()
    );
    for source in &config.sources {
        log::info!(
            "{} - {} at {} fps, backend {}, cooldown {:.0}s",
            source.name,
            source.url,
            source.target_fps,
            source.detector.backend.as_str(),
            source.detection.cooldown_period.as_secs_f32()
        );
    }

    let exporters = build_exporters(&config.exporters)?;
    let supervisor = Supervisor::start(&config, exporters)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("peakwatchd running, waiting for shutdown signal (Ctrl-C)...");
    let health_interval = Duration::from_secs(args.health_interval);
    let mut last_health_log = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping workers...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !supervisor.any_running() {
            log::info!("all sources finished");
            break;
        }
        if !health_interval.is_zero() && last_health_log.elapsed() >= health_interval {
            for (name, stats) in supervisor.stats() {
                log::info!(
                    "{} - {:?}: {} processed, {} windows, {} exported, {} dropped, {} acquisition failure(s)",
                    name,
                    stats.state,
                    stats.frames_processed,
                    stats.windows_opened,
                    stats.exports_accepted,
                    stats.dispatch.dropped,
                    stats.acquisition_failures
                );
            }
            last_health_log = Instant::now();
        }
    }

    let final_stats = supervisor.stats();
    let exits = supervisor.stop(Duration::from_secs(args.shutdown_timeout));
    for (name, exit) in &exits {
        match exit {
            Some(exit) => log::info!("{} - worker exited: {:?}", name, exit),
            None => log::warn!("{} - worker abandoned at shutdown", name),
        }
    }
    if let Ok(json) = serde_json::to_string(&final_stats) {
        log::debug!("final stats: {}", json);
    }
    Ok(())
}
