//! Exporters: where accepted events go.
//!
//! Every exporter is shared by all source workers through `Arc<dyn Exporter>`,
//! so implementations must be safe for concurrent calls. Each source's
//! dispatcher drives every exporter from its own thread and logs and counts
//! failures per exporter.

use anyhow::Result;
use std::sync::Arc;

use crate::config::ExporterSettings;
use crate::engine::ExportBatch;

pub mod disk;
pub mod dispatch;
pub mod mqtt;
pub mod telegram;

pub use disk::DiskExporter;
pub use dispatch::{
    DispatchCounters, DispatchSnapshot, ExportDispatcher, LaneSnapshot, SubmitError,
};
pub use mqtt::MqttExporter;
pub use telegram::TelegramExporter;

pub trait Exporter: Send + Sync {
    /// Short identifier used in logs and stats.
    fn name(&self) -> &str;

    /// Persist or deliver one accepted event.
    fn export(&self, batch: &ExportBatch) -> Result<()>;

    /// Plain-text message for the operator (start, stop, repeated failures).
    /// Exporters without a human channel ignore it.
    fn notify_operator(&self, _message: &str) -> Result<()> {
        Ok(())
    }

    /// Flush and release connections. Called once after every worker stopped.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Build every exporter the configuration enables.
pub fn build_exporters(settings: &ExporterSettings) -> Result<Vec<Arc<dyn Exporter>>> {
    let mut exporters: Vec<Arc<dyn Exporter>> = Vec::new();
    if let Some(disk) = &settings.disk {
        exporters.push(Arc::new(DiskExporter::new(disk.clone())?));
    }
    if let Some(telegram) = &settings.telegram {
        let exporter = TelegramExporter::new(telegram.clone())?;
        if let Err(e) = exporter.check_connection() {
            log::warn!("telegram: connection check failed: {:#}", e);
        }
        exporters.push(Arc::new(exporter));
    }
    if let Some(mqtt) = &settings.mqtt {
        exporters.push(Arc::new(MqttExporter::connect(mqtt.clone())?));
    }
    if exporters.is_empty() {
        log::warn!("no exporters configured; accepted events will only be logged");
    }
    Ok(exporters)
}

/// Send an operator message through every exporter, logging failures.
pub fn broadcast_operator(exporters: &[Arc<dyn Exporter>], message: &str) {
    for exporter in exporters {
        if let Err(e) = exporter.notify_operator(message) {
            log::error!(
                "{}: failed to deliver operator message: {:#}",
                exporter.name(),
                e
            );
        }
    }
}

/// Replace characters that do not belong in a path segment or topic level.
pub(crate) fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
