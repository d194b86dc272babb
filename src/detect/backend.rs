use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Capabilities a backend can advertise.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// Box proposals for road damage.
    ObjectDetection,
    /// Per-crop damage confidence.
    Classification,
}

/// Produces pothole proposals for a frame.
///
/// Backends return raw proposals in frame pixel coordinates. Thresholding and
/// non-maximum suppression happen in the pipeline, not in the backend.
pub trait DetectorBackend: Send {
    /// Short name used in config (`detection.backend`) and logs.
    fn name(&self) -> &'static str;

    fn supports(&self, capability: DetectionCapability) -> bool;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Called once before the first frame, e.g. to run a dummy inference.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Crop classifier used to refine severity scores.
pub trait Classifier: Send {
    fn name(&self) -> &'static str;

    /// Square input edge in pixels; crops are resized to this before `predict`.
    fn input_size(&self) -> u32;

    /// Damage confidence for the crop. Callers clamp the value to [0, 1].
    fn predict(&mut self, crop: &RgbImage) -> Result<f32>;
}
