use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use super::{sanitize_segment, Exporter};
use crate::config::DiskSettings;
use crate::engine::ExportBatch;

const EVENT_METADATA_FILE: &str = "event.json";

/// Writes selected frames as JPEG files under `{directory}/{source}/`.
///
/// With `group_by_event`, each event gets its own directory named after the
/// second it opened, holding the frames and an `event.json` summary.
pub struct DiskExporter {
    settings: DiskSettings,
}

impl DiskExporter {
    pub fn new(settings: DiskSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.directory).with_context(|| {
            format!(
                "failed to create save directory {}",
                settings.directory.display()
            )
        })?;
        Ok(Self { settings })
    }

    /// Directory the frames of `batch` are written to.
    pub fn event_dir(&self, batch: &ExportBatch) -> PathBuf {
        let source_dir = self.settings.directory.join(sanitize_segment(&batch.source));
        if self.settings.group_by_event {
            source_dir.join(batch.opened_at.format("%Y-%m-%dT%H-%M-%S").to_string())
        } else {
            source_dir
        }
    }
}

/// `2025-03-01T14-05-09.123_0.912.jpg`: millisecond timestamp with hyphens in
/// place of colons, then the confidence to three decimals.
pub fn frame_filename(timestamp: DateTime<Utc>, confidence: f32) -> String {
    format!(
        "{}_{:.3}.jpg",
        timestamp.format("%Y-%m-%dT%H-%M-%S%.3f"),
        confidence
    )
}

impl Exporter for DiskExporter {
    fn name(&self) -> &str {
        "disk"
    }

    fn export(&self, batch: &ExportBatch) -> Result<()> {
        let dir = self.event_dir(batch);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        for frame in &batch.frames {
            let path = dir.join(frame_filename(frame.timestamp(), frame.confidence()));
            let jpeg = frame.render(batch.annotated).encode_jpeg()?;
            write_file(&path, &jpeg)?;
        }

        if self.settings.group_by_event {
            let summary = serde_json::to_vec_pretty(&batch.summary())?;
            write_file(&dir.join(EVENT_METADATA_FILE), &summary)?;
        }
        log::debug!(
            "disk: wrote {} frame(s) for {} to {}",
            batch.frames.len(),
            batch.source,
            dir.display()
        );
        Ok(())
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
