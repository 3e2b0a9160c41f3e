use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::error::DetectError;
use crate::frame::Image;

/// Idle frames, a short rise through a peak, then idle again.
const DEFAULT_SCRIPT: &[f32] = &[
    0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
    0.0, 0.3, 0.72, 0.78, 0.86, 0.91, 0.94, 0.88, 0.85, 0.74, 0.4, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
    0.0, 0.0, 0.0, 0.0,
];

/// Stub backend for testing and `stub://` demos.
///
/// Ignores pixels and replays a confidence script, one value per call, looping
/// at the end. A value of 0.0 produces no detection; anything else produces one
/// centered box with that confidence.
pub struct StubBackend {
    script: Vec<f32>,
    cursor: usize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_script(DEFAULT_SCRIPT.to_vec())
    }

    pub fn with_script(script: Vec<f32>) -> Self {
        Self { script, cursor: 0 }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &Image) -> Result<DetectionResult, DetectError> {
        if self.script.is_empty() {
            return Ok(DetectionResult::none());
        }
        let confidence = self.script[self.cursor % self.script.len()];
        self.cursor = self.cursor.wrapping_add(1);

        if confidence <= 0.0 {
            return Ok(DetectionResult::none());
        }
        Ok(DetectionResult {
            detections: vec![Detection {
                x: 0.35,
                y: 0.35,
                w: 0.3,
                h: 0.3,
                confidence,
                class_id: 0,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_replays_script_and_loops() {
        let mut backend = StubBackend::with_script(vec![0.0, 0.8]);
        let img = Image::blank(4, 4);

        let r1 = backend.detect(&img).unwrap();
        assert!(r1.is_empty());

        let r2 = backend.detect(&img).unwrap();
        assert_eq!(r2.top_confidence(), 0.8);

        let r3 = backend.detect(&img).unwrap();
        assert!(r3.is_empty());
    }

    #[test]
    fn empty_script_never_detects() {
        let mut backend = StubBackend::with_script(Vec::new());
        assert!(backend.detect(&Image::blank(4, 4)).unwrap().is_empty());
    }
}
