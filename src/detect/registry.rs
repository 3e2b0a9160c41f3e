use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
#[cfg(feature = "backend-tract")]
use super::backends::TractBackend;

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.2;

/// Known detector backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Stub,
    Tract,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Stub => "stub",
            BackendKind::Tract => "tract",
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" | "onnx" => Ok(BackendKind::Tract),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

/// How a source builds and queries its detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    pub backend: BackendKind,
    /// Model file, required by the tract backend.
    pub model: Option<PathBuf>,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Detections below this confidence are dropped before the engine sees them.
    pub confidence_floor: f32,
    /// Only these class ids are kept, when set.
    pub classes: Option<Vec<u32>>,
    /// Confidence script for the stub backend.
    pub script: Option<Vec<f32>>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Stub,
            model: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            classes: None,
            script: None,
        }
    }
}

/// Build the backend described by `settings`.
///
/// Called from inside the source worker so a model that fails to load only
/// takes down that source.
pub fn build_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend {
        BackendKind::Stub => {
            let backend = match &settings.script {
                Some(script) => StubBackend::with_script(script.clone()),
                None => StubBackend::new(),
            };
            Ok(Box::new(backend))
        }
        BackendKind::Tract => {
            let model = settings
                .model
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires a model path"))?;
            #[cfg(feature = "backend-tract")]
            {
                Ok(Box::new(TractBackend::new(model, settings.input_size)?))
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                Err(anyhow!(
                    "model {} needs the tract backend; rebuild with the backend-tract feature",
                    model.display()
                ))
            }
        }
    }
}
