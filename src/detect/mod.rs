mod backend;
pub mod backends;
mod nms;
mod result;

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::config::DetectionSettings;

pub use backend::{Classifier, DetectionCapability, DetectorBackend};
pub use backends::{CpuBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, TractClassifier};
pub use nms::{non_max_suppression, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_NMS_THRESHOLD};
pub use result::{BoundingBox, Detection, DEFAULT_CLASS_NAME};

/// Names accepted by `detection.backend`.
pub const BACKEND_NAMES: [&str; 3] = ["cpu", "stub", "tract"];

/// Build the configured detector. Every configured model file must exist,
/// whichever backend is selected.
pub fn build_detector(settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    for path in [&settings.model_path, &settings.classifier_path].into_iter().flatten() {
        require_file(path)?;
    }
    let backend: Box<dyn DetectorBackend> = match settings.backend.as_str() {
        "cpu" => Box::new(CpuBackend::default()),
        "stub" => Box::new(StubBackend::new()),
        "tract" => build_tract(settings)?,
        other => {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of {})",
                other,
                BACKEND_NAMES.join(", ")
            ))
        }
    };
    if !backend.supports(DetectionCapability::ObjectDetection) {
        return Err(anyhow!(
            "backend '{}' does not support object detection",
            backend.name()
        ));
    }
    Ok(backend)
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    let path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("the tract backend needs detection.model_path"))?;
    let backend = TractBackend::new(path, settings.input_size, settings.input_size)?
        .with_class_names(settings.class_names.clone());
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!("the tract backend requires the backend-tract feature"))
}

/// Optional severity classifier from `detection.classifier_path`.
pub fn build_classifier(settings: &DetectionSettings) -> Result<Option<Box<dyn Classifier>>> {
    let Some(path) = settings.classifier_path.as_ref() else {
        return Ok(None);
    };
    require_file(path)?;
    #[cfg(feature = "backend-tract")]
    {
        let classifier = TractClassifier::new(path, settings.classifier_input_size)?;
        Ok(Some(Box::new(classifier)))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        log::warn!(
            "classifier {} ignored: built without backend-tract; severity uses box geometry only",
            path.display()
        );
        Ok(None)
    }
}

fn require_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(anyhow!("model file {} does not exist", path.display()));
    }
    Ok(())
}
