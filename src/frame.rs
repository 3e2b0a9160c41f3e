//! Frames and per-frame inference results.
//!
//! - `Image`: owned RGB pixel buffer with JPEG encode/decode.
//! - `FrameResult`: one inference outcome for one frame. Immutable once built and
//!   shared by `Arc` between the history and an open event window.
//! - `ConfidenceHistory`: bounded ring buffer of the most recent results, used to
//!   look back for context frames when an event opens.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::detect::{Detection, DetectionResult};

/// Default number of results kept for look-back.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

const JPEG_QUALITY: u8 = 90;
const BOX_COLOR: [u8; 3] = [0, 255, 0];
const MARKER_COLOR: [u8; 3] = [0, 255, 0];
const MARKER_TRACK_COLOR: [u8; 3] = [40, 40, 40];

// ----------------------------------------------------------------------------
// Image
// ----------------------------------------------------------------------------

/// Owned RGB8 image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Image {
    /// Wrap a packed RGB8 buffer. The length must be `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("image dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Solid black image.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * 3],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_rgb(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]])
    }

    pub fn decode_jpeg(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).context("decode jpeg")?;
        let rgb = decoded.into_rgb8();
        let (width, height) = (rgb.width(), rgb.height());
        Self::from_rgb(width, height, rgb.into_raw())
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode jpeg")?;
        Ok(out)
    }

    /// Copy of this image with an outline drawn around every detection.
    pub fn with_boxes(&self, detections: &[Detection]) -> Image {
        let mut out = self.clone();
        let thickness = (self.width.min(self.height) / 200).max(2);
        for det in detections {
            let x0 = scale(det.x, self.width);
            let y0 = scale(det.y, self.height);
            let x1 = scale(det.x + det.w, self.width);
            let y1 = scale(det.y + det.h, self.height);
            out.outline(x0, y0, x1, y1, thickness, BOX_COLOR);
        }
        out
    }

    /// Copy of this image with a confidence bar along the top edge.
    ///
    /// Used for frames pulled from history, which have no detector output to draw.
    pub fn with_confidence_marker(&self, confidence: f32) -> Image {
        let mut out = self.clone();
        let bar_height = (self.height / 60).max(4).min(self.height);
        let filled = scale(confidence, self.width);
        out.fill(0, 0, self.width, bar_height, MARKER_TRACK_COLOR);
        out.fill(0, 0, filled, bar_height, MARKER_COLOR);
        out
    }

    fn fill(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, color: [u8; 3]) {
        let x1 = x1.min(self.width);
        let y1 = y1.min(self.height);
        for y in y0..y1 {
            for x in x0..x1 {
                let idx = (y as usize * self.width as usize + x as usize) * 3;
                self.pixels[idx..idx + 3].copy_from_slice(&color);
            }
        }
    }

    fn outline(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, t: u32, color: [u8; 3]) {
        if x1 <= x0 || y1 <= y0 {
            return;
        }
        self.fill(x0, y0, x1, y0.saturating_add(t), color);
        self.fill(x0, y1.saturating_sub(t), x1, y1, color);
        self.fill(x0, y0, x0.saturating_add(t), y1, color);
        self.fill(x1.saturating_sub(t), y0, x1, y1, color);
    }
}

fn scale(normalized: f32, extent: u32) -> u32 {
    (normalized.clamp(0.0, 1.0) * extent as f32).round() as u32
}

// ----------------------------------------------------------------------------
// FrameResult
// ----------------------------------------------------------------------------

/// One inference outcome for one processed frame.
#[derive(Debug)]
pub struct FrameResult {
    /// Sequence number of the acquired frame within its source.
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
    /// Highest detection confidence in the frame, 0.0 if none.
    pub confidence: f32,
    pub image: Image,
    /// Only materialised when live annotation is enabled.
    pub annotated_image: Option<Image>,
    /// Kept so the frame can be annotated later without re-running inference.
    pub raw_detections: Option<Vec<Detection>>,
}

impl FrameResult {
    pub fn from_detections(
        frame_number: u64,
        timestamp: DateTime<Utc>,
        image: Image,
        result: DetectionResult,
        annotate_live: bool,
    ) -> Self {
        let confidence = result.top_confidence();
        let detections = result.detections;
        let annotated_image = if annotate_live && !detections.is_empty() {
            Some(image.with_boxes(&detections))
        } else {
            None
        };
        let raw_detections = if detections.is_empty() {
            None
        } else {
            Some(detections)
        };
        Self {
            frame_number,
            timestamp,
            confidence,
            image,
            annotated_image,
            raw_detections,
        }
    }

    /// A frame that produced nothing (no detections, or inference skipped).
    pub fn empty(frame_number: u64, timestamp: DateTime<Utc>, image: Image) -> Self {
        Self {
            frame_number,
            timestamp,
            confidence: 0.0,
            image,
            annotated_image: None,
            raw_detections: None,
        }
    }

    pub fn qualifies(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }

    /// Image to hand to an exporter.
    ///
    /// With `annotated`, prefers the live annotation, then a render from the raw
    /// detections, then falls back to the original frame.
    pub fn render(&self, annotated: bool) -> Cow<'_, Image> {
        if !annotated {
            return Cow::Borrowed(&self.image);
        }
        if let Some(img) = &self.annotated_image {
            return Cow::Borrowed(img);
        }
        match &self.raw_detections {
            Some(dets) => Cow::Owned(self.image.with_boxes(dets)),
            None => Cow::Borrowed(&self.image),
        }
    }
}

// ----------------------------------------------------------------------------
// ConfidenceHistory
// ----------------------------------------------------------------------------

/// Fixed-capacity, time-ordered ring buffer of recent frame results.
///
/// - Append only; the oldest entry is evicted at capacity.
/// - Entries are shared, never copied: an event window may hold the same `Arc`.
pub struct ConfidenceHistory {
    entries: VecDeque<Arc<FrameResult>>,
    capacity: usize,
}

impl ConfidenceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Arc<FrameResult>) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Arc<FrameResult>> {
        self.entries.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FrameResult>> + '_ {
        self.entries.iter()
    }

    /// Entries at or above `threshold`, oldest first.
    pub fn qualifying(&self, threshold: f32) -> impl Iterator<Item = &Arc<FrameResult>> + '_ {
        self.entries.iter().filter(move |f| f.qualifies(threshold))
    }

    /// Approximate pixel memory held by the history.
    pub fn memory_bytes(&self) -> usize {
        self.entries.iter().map(|f| f.image.byte_len()).sum()
    }
}

impl Default for ConfidenceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn make_result(n: u64, confidence: f32) -> Arc<FrameResult> {
        let mut result = FrameResult::empty(n, at(n as i64), Image::blank(8, 8));
        result.confidence = confidence;
        Arc::new(result)
    }

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Image::from_rgb(4, 4, vec![0u8; 10]).is_err());
        assert!(Image::from_rgb(4, 4, vec![0u8; 48]).is_ok());
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let img = Image::blank(32, 16);
        let jpg = img.encode_jpeg().unwrap();
        assert_eq!(&jpg[..2], &[0xFF, 0xD8]);
        let decoded = Image::decode_jpeg(&jpg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn boxes_are_drawn_on_a_copy() {
        let img = Image::blank(100, 100);
        let det = Detection {
            x: 0.1,
            y: 0.1,
            w: 0.5,
            h: 0.5,
            confidence: 0.9,
            class_id: 0,
        };
        let boxed = img.with_boxes(&[det]);
        assert_eq!(boxed.pixel(10, 10), Some(BOX_COLOR));
        assert_eq!(boxed.pixel(35, 35), Some([0, 0, 0]));
        assert_eq!(img.pixel(10, 10), Some([0, 0, 0]));
    }

    #[test]
    fn marker_length_follows_confidence() {
        let img = Image::blank(100, 60);
        let marked = img.with_confidence_marker(0.5);
        assert_eq!(marked.pixel(10, 0), Some(MARKER_COLOR));
        assert_eq!(marked.pixel(80, 0), Some(MARKER_TRACK_COLOR));
        assert_eq!(marked.pixel(10, 30), Some([0, 0, 0]));
    }

    #[test]
    fn render_prefers_live_annotation_then_raw_detections() {
        let det = Detection {
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
            confidence: 0.9,
            class_id: 0,
        };
        let result = DetectionResult {
            detections: vec![det],
        };
        let live = FrameResult::from_detections(1, at(0), Image::blank(20, 20), result.clone(), true);
        assert!(matches!(live.render(true), Cow::Borrowed(_)));
        assert!(live.annotated_image.is_some());

        let deferred = FrameResult::from_detections(2, at(1), Image::blank(20, 20), result, false);
        assert!(deferred.annotated_image.is_none());
        let rendered = deferred.render(true);
        assert!(matches!(rendered, Cow::Owned(_)));
        assert_eq!(rendered.pixel(0, 0), Some(BOX_COLOR));
        assert_eq!(deferred.render(false).pixel(0, 0), Some([0, 0, 0]));
    }

    #[test]
    fn history_evicts_oldest_and_keeps_order() {
        let mut history = ConfidenceHistory::new(3);
        for n in 0..5 {
            history.push(make_result(n, n as f32 / 10.0));
        }
        assert_eq!(history.len(), 3);
        let numbers: Vec<u64> = history.iter().map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        assert_eq!(history.latest().map(|f| f.frame_number), Some(4));
    }

    #[test]
    fn history_filters_qualifying_frames() {
        let mut history = ConfidenceHistory::new(10);
        for (n, c) in [0.2f32, 0.75, 0.1, 0.9].iter().enumerate() {
            history.push(make_result(n as u64, *c));
        }
        let numbers: Vec<u64> = history.qualifying(0.7).map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }
}
