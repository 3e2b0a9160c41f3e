//! Detection Source boundary.
//!
//! The detector is an opaque, possibly slow, blocking capability: it maps one
//! image to a set of `(confidence, box)` detections. Everything downstream only
//! looks at `DetectionResult`.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{build_backend, BackendKind, DetectorSettings};
pub use result::{Detection, DetectionResult};
