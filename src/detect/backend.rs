use crate::detect::result::DetectionResult;
use crate::error::DetectError;
use crate::frame::Image;

/// Detector backend trait.
///
/// One instance is owned by one source worker, so `detect` takes `&mut self`
/// and implementations need `Send` but not `Sync`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. May block for as long as inference takes.
    ///
    /// Return `DetectError::Frame` when only this frame failed and
    /// `DetectError::Backend` when the model or runtime is unusable.
    fn detect(&mut self, image: &Image) -> Result<DetectionResult, DetectError>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}
