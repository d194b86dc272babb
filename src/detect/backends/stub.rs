use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Scripted backend for tests and dry runs.
///
/// Each `detect` call returns the next entry of the script, cycling. An empty
/// script yields no proposals. Boxes are emitted as scripted; the pipeline clamps them.
#[derive(Default)]
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    calls: usize,
    fail_on_call: Option<usize>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same proposals on every frame.
    pub fn with_fixed(detections: Vec<Detection>) -> Self {
        Self::with_script(vec![detections])
    }

    pub fn with_script(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Return an error on the n-th call (1-based).
    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            return Err(anyhow!("stub backend scripted failure on call {}", self.calls));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let idx = (self.calls - 1) % self.script.len();
        Ok(self.script[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use image::RgbImage;

    #[test]
    fn script_cycles_per_call() {
        let a = Detection::new(BoundingBox::new(0, 0, 4, 4), 0.9);
        let mut backend = StubBackend::with_script(vec![vec![a.clone()], vec![]]);
        let frame = Frame::new(1, RgbImage::new(8, 8));
        assert_eq!(backend.detect(&frame).unwrap(), vec![a.clone()]);
        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(backend.detect(&frame).unwrap(), vec![a]);
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn scripted_failure_is_reported() {
        let mut backend = StubBackend::new().failing_on(2);
        let frame = Frame::new(1, RgbImage::new(8, 8));
        assert!(backend.detect(&frame).is_ok());
        assert!(backend.detect(&frame).is_err());
    }
}
