//! Replay a directory of JPEG stills as a finite stream.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use super::rtsp::frame_interval;
use super::{CapturedFrame, FrameSource};
use crate::error::IngestError;
use crate::frame::Image;

/// Frames are the `.jpg`/`.jpeg` files of one directory in file-name order,
/// stamped one frame interval apart from the time of `connect`.
pub struct ImageDirSource {
    url: String,
    files: Vec<PathBuf>,
    target_fps: u32,
    cursor: usize,
    frame_count: u64,
    started_at: Option<DateTime<Utc>>,
}

impl ImageDirSource {
    pub fn new(url: &str, dir: &Path, target_fps: u32) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("read image directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_jpeg = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
                .unwrap_or(false);
            if is_jpeg && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no JPEG files in {}", dir.display()));
        }
        files.sort();
        Ok(Self {
            url: url.to_string(),
            files,
            target_fps,
            cursor: 0,
            frame_count: 0,
            started_at: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn connect(&mut self) -> Result<(), IngestError> {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        log::info!(
            "ImageDirSource: replaying {} still(s) from {}",
            self.files.len(),
            self.url
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedFrame, IngestError> {
        let started_at = self
            .started_at
            .ok_or_else(|| IngestError::disconnected("image directory not opened"))?;
        while let Some(path) = self.files.get(self.cursor) {
            self.cursor += 1;
            let decoded = std::fs::read(path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Image::decode_jpeg(&bytes));
            match decoded {
                Ok(image) => {
                    let offset = frame_interval(self.target_fps) * self.frame_count as u32;
                    self.frame_count += 1;
                    let captured_at = started_at
                        + chrono::Duration::from_std(offset)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    return Ok(CapturedFrame { image, captured_at });
                }
                Err(e) => log::warn!("ImageDirSource: skipping {}: {:#}", path.display(), e),
            }
        }
        Err(IngestError::Exhausted)
    }

    fn is_healthy(&self) -> bool {
        self.cursor < self.files.len()
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_jpeg(dir: &Path, name: &str) {
        let bytes = Image::blank(8, 8).encode_jpeg().unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn replays_stills_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        write_jpeg(dir.path(), "b.jpg");
        write_jpeg(dir.path(), "a.JPEG");
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("c.jpg"), "not a jpeg").unwrap();

        let mut source = ImageDirSource::new("dir://test", dir.path(), 10).unwrap();
        assert_eq!(source.len(), 3);
        source.connect().unwrap();

        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        assert_eq!(first.image.width(), 8);
        assert_eq!(
            (second.captured_at - first.captured_at).num_milliseconds(),
            100
        );
        assert!(matches!(source.next_frame(), Err(IngestError::Exhausted)));
        assert_eq!(source.frames_captured(), 2);
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDirSource::new("dir://empty", dir.path(), 10).is_err());
    }
}
