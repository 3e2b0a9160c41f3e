//! Frame acquisition.
//!
//! - `RtspSource`: IP cameras over RTSP (feature `rtsp-gstreamer`), plus
//!   synthetic `stub://` streams
//! - `ImageDirSource`: a directory of JPEG stills, `dir://<path>` or a plain
//!   directory path
//!
//! Sources block in `next_frame` until a frame arrives. A broken stream reports
//! `IngestError::Disconnected` and is reconnected by the caller; finite
//! sources end with `IngestError::Exhausted`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::IngestError;
use crate::frame::Image;

pub mod dir;
pub mod rtsp;

pub use dir::ImageDirSource;
pub use rtsp::{RtspConfig, RtspSource};

/// One acquired frame, before inference.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub image: Image,
    pub captured_at: DateTime<Utc>,
}

/// A blocking stream of frames owned by one source worker.
pub trait FrameSource: Send {
    fn url(&self) -> &str;

    /// (Re)establish the stream. Called before the first frame and after
    /// every `Disconnected`.
    fn connect(&mut self) -> Result<(), IngestError>;

    fn next_frame(&mut self) -> Result<CapturedFrame, IngestError>;

    fn is_healthy(&self) -> bool;

    fn frames_captured(&self) -> u64;
}

/// Pick a source implementation from the URL scheme.
pub fn open_source(url: &str, target_fps: u32) -> Result<Box<dyn FrameSource>> {
    let url = url.trim();
    if url.starts_with("stub://")
        || url.starts_with("rtsp://")
        || url.starts_with("rtsps://")
    {
        let config = RtspConfig {
            url: url.to_string(),
            target_fps,
            ..RtspConfig::default()
        };
        return Ok(Box::new(RtspSource::new(config)?));
    }
    let dir = url.strip_prefix("dir://").unwrap_or(url);
    if Path::new(dir).is_dir() {
        return Ok(Box::new(ImageDirSource::new(url, Path::new(dir), target_fps)?));
    }
    Err(anyhow!(
        "unsupported source url '{}' (expected rtsp://, stub:// or an image directory)",
        url
    ))
}
