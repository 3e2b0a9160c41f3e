//! RTSP frame source.
//!
//! `stub://` URLs produce synthetic frames for demos and tests. Anything else
//! goes through GStreamer (feature `rtsp-gstreamer`):
//! `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps.
//!
//! Synthetic URLs accept query options:
//! - `frames=N`: end the stream after N frames
//! - `drop_at=N`: report a disconnect on frame N (once)
//! - `pace=false`: do not sleep between frames; timestamps still advance by
//!   one frame interval

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Instant;

use super::{CapturedFrame, FrameSource};
use crate::error::IngestError;
use crate::frame::Image;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate, used for pacing and stall detection.
    pub target_fps: u32,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            width: 320,
            height: 240,
        }
    }
}

/// RTSP frame source.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)?),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("{} requires the rtsp-gstreamer feature", config.url)
            }
        }
    }
}

impl FrameSource for RtspSource {
    fn url(&self) -> &str {
        match &self.backend {
            RtspBackend::Synthetic(source) => &source.config.url,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => &source.config.url,
        }
    }

    fn connect(&mut self) -> Result<(), IngestError> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<CapturedFrame, IngestError> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.frame_count,
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    limit: Option<u64>,
    drop_at: Option<u64>,
    pace: bool,
    connected: bool,
    started_at: Option<DateTime<Utc>>,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        let mut source = Self {
            config,
            frame_count: 0,
            limit: None,
            drop_at: None,
            pace: true,
            connected: false,
            started_at: None,
        };
        if let Some((_, query)) = source.config.url.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed stub option '{}'", pair))?;
                match key {
                    "frames" => source.limit = Some(parse_option(key, value)?),
                    "drop_at" => source.drop_at = Some(parse_option(key, value)?),
                    "pace" => {
                        source.pace = value
                            .parse()
                            .map_err(|_| anyhow!("stub option pace must be true or false"))?
                    }
                    other => return Err(anyhow!("unknown stub option '{}'", other)),
                }
            }
        }
        Ok(source)
    }

    fn connect(&mut self) -> Result<(), IngestError> {
        self.connected = true;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedFrame, IngestError> {
        if !self.connected {
            return Err(IngestError::disconnected("synthetic stream not connected"));
        }
        if self.limit.is_some_and(|limit| self.frame_count >= limit) {
            return Err(IngestError::Exhausted);
        }
        if self.drop_at == Some(self.frame_count + 1) {
            self.drop_at = None;
            self.connected = false;
            return Err(IngestError::disconnected("synthetic stream dropped"));
        }

        let interval = frame_interval(self.config.target_fps);
        if self.pace {
            std::thread::sleep(interval);
        }
        self.frame_count += 1;

        let started_at = self.started_at.unwrap_or_else(Utc::now);
        let offset = chrono::Duration::from_std(interval * self.frame_count as u32)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Ok(CapturedFrame {
            image: self.generate_image(),
            captured_at: started_at + offset,
        })
    }

    /// A horizontal gradient that drifts one step per frame.
    fn generate_image(&self) -> Image {
        let (w, h) = (self.config.width.max(1), self.config.height.max(1));
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for _y in 0..h {
            for x in 0..w {
                let v = ((x as u64 + self.frame_count) % 256) as u8;
                pixels.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        Image::from_rgb(w, h, pixels).unwrap_or_else(|_| Image::blank(w, h))
    }
}

fn parse_option(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow!("stub option {} must be a number", key))
}

/// Session setup and the first keyframe can take seconds after a (re)connect.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the next sample before calling the stream stalled.
#[cfg_attr(not(feature = "rtsp-gstreamer"), allow(dead_code))]
fn pull_timeout(target_fps: u32, awaiting_first_frame: bool) -> Duration {
    if awaiting_first_frame {
        FIRST_FRAME_TIMEOUT
    } else {
        (frame_interval(target_fps) * 4).max(Duration::from_millis(500))
    }
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_millis(1000 / target_fps as u64)
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<(), IngestError> {
        // A restart from Null forces rtspsrc to renegotiate after a drop.
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| IngestError::disconnected(format!("set pipeline to Playing: {}", e)))?;
        self.connected_at = Some(Instant::now());
        self.last_frame_at = None;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedFrame, IngestError> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(IngestError::disconnected(err.clone()));
        }

        let timeout = pull_timeout(self.config.target_fps, self.last_frame_at.is_none());
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| IngestError::disconnected("RTSP stream stalled"))?;

        let image = sample_to_image(&sample)
            .map_err(|e| IngestError::disconnected(format!("{:#}", e)))?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(CapturedFrame {
            image,
            captured_at: Utc::now(),
        })
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= FIRST_FRAME_TIMEOUT;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn health_grace(&self) -> Duration {
        (frame_interval(self.config.target_fps) * 6).max(Duration::from_secs(2))
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<Image> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Image::from_rgb(width, height, data[..row_bytes * height as usize].to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Image::from_rgb(width, height, pixels)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
