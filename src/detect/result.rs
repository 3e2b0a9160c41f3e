use serde::Serialize;

/// Detections produced for one frame.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

/// One bounding box. Coordinates are normalized to 0..1, origin top-left.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl DetectionResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Highest confidence among detections, 0.0 if there are none.
    pub fn top_confidence(&self) -> f32 {
        self.detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0, f32::max)
    }

    /// Drops detections below `floor` and, when `classes` is given, any class not listed.
    pub fn filtered(mut self, floor: f32, classes: Option<&[u32]>) -> Self {
        self.detections.retain(|d| {
            d.confidence >= floor && classes.map_or(true, |allowed| allowed.contains(&d.class_id))
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(confidence: f32, class_id: u32) -> Detection {
        Detection {
            x: 0.0,
            y: 0.0,
            w: 0.1,
            h: 0.1,
            confidence,
            class_id,
        }
    }

    #[test]
    fn top_confidence_of_empty_result_is_zero() {
        assert_eq!(DetectionResult::none().top_confidence(), 0.0);
    }

    #[test]
    fn filtered_applies_floor_and_classes() {
        let result = DetectionResult {
            detections: vec![det(0.1, 0), det(0.6, 0), det(0.9, 2)],
        };
        let kept = result.clone().filtered(0.2, None);
        assert_eq!(kept.detections.len(), 2);
        assert_eq!(kept.top_confidence(), 0.9);

        let only_zero = result.filtered(0.2, Some(&[0]));
        assert_eq!(only_zero.detections.len(), 1);
        assert_eq!(only_zero.top_confidence(), 0.6);
    }
}
