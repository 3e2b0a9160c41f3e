#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::error::DetectError;
use crate::frame::Image;

/// Number of box coordinates ahead of the class scores in each output column.
const BOX_ROWS: usize = 4;

/// Tract-based backend for YOLO-style ONNX object detection models.
///
/// Expects a square `1x3xSxS` float input and a `1x(4+C)xN` output where each of
/// the N columns holds `cx, cy, w, h` in input pixels followed by C class scores.
/// No network I/O; the model is read from disk once.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, image: &Image) -> Result<Tensor> {
        let rgb = RgbImage::from_raw(image.width(), image.height(), image.as_rgb().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = imageops::resize(&rgb, self.input_size, self.input_size, FilterType::Triangle);

        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, output: &Tensor) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;
        let (_, rows, columns) = view.dim();
        if rows <= BOX_ROWS {
            return Err(anyhow!("model output has {} rows, expected more than 4", rows));
        }

        let size = self.input_size as f32;
        let mut detections = Vec::new();
        for i in 0..columns {
            let (class_id, score) = (BOX_ROWS..rows)
                .map(|r| (r - BOX_ROWS, view[[0, r, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if !score.is_finite() || score <= 0.0 {
                continue;
            }
            let (cx, cy, w, h) = (view[[0, 0, i]], view[[0, 1, i]], view[[0, 2, i]], view[[0, 3, i]]);
            detections.push(Detection {
                x: ((cx - w / 2.0) / size).clamp(0.0, 1.0),
                y: ((cy - h / 2.0) / size).clamp(0.0, 1.0),
                w: (w / size).clamp(0.0, 1.0),
                h: (h / size).clamp(0.0, 1.0),
                confidence: score.min(1.0),
                class_id: class_id as u32,
            });
        }
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &Image) -> Result<DetectionResult, DetectError> {
        let input = self
            .build_input(image)
            .map_err(|e| DetectError::frame(format!("{:#}", e)))?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::backend(format!("ONNX inference failed: {:#}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::backend("model produced no outputs"))?;
        let detections = self
            .decode(output)
            .map_err(|e| DetectError::backend(format!("{:#}", e)))?;
        Ok(DetectionResult { detections })
    }
}
