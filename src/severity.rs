//! Severity estimation from box geometry, optionally refined by a crop classifier.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use serde::Serialize;

use crate::detect::{BoundingBox, Classifier};
use crate::frame::Frame;
use crate::Severity;

pub const DEFAULT_LOW_THRESHOLD: f64 = 0.01;
pub const DEFAULT_MEDIUM_THRESHOLD: f64 = 0.05;
pub const DEFAULT_CLASSIFIER_INPUT: u32 = 224;

const LOW_SCORE: f32 = 0.3;
const MEDIUM_SCORE: f32 = 0.6;
const HIGH_SCORE: f32 = 0.9;
const EMPTY_CROP_SCORE: f32 = 0.5;

/// Area-ratio cut points. A ratio strictly below `low` is Low, strictly below
/// `medium` is Medium, anything else High.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_THRESHOLD,
            medium: DEFAULT_MEDIUM_THRESHOLD,
        }
    }
}

impl SeverityThresholds {
    pub fn new(low: f64, medium: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&medium) || low > medium {
            return Err(anyhow!(
                "severity thresholds must satisfy 0 <= low <= medium <= 1 (got {} / {})",
                low,
                medium
            ));
        }
        Ok(Self { low, medium })
    }

    pub fn classify(&self, area_ratio: f64) -> (Severity, f32) {
        if area_ratio < self.low {
            (Severity::Low, LOW_SCORE)
        } else if area_ratio < self.medium {
            (Severity::Medium, MEDIUM_SCORE)
        } else {
            (Severity::High, HIGH_SCORE)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SeverityAssessment {
    pub severity: Severity,
    pub score: f32,
}

pub struct SeverityEstimator {
    thresholds: SeverityThresholds,
    classifier: Option<Box<dyn Classifier>>,
}

impl SeverityEstimator {
    pub fn new(thresholds: SeverityThresholds) -> Self {
        Self {
            thresholds,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn thresholds(&self) -> SeverityThresholds {
        self.thresholds
    }

    pub fn estimate(&mut self, frame: &Frame, bbox: &BoundingBox) -> SeverityAssessment {
        let Some(clamped) = bbox.clamp_to(frame.width(), frame.height()) else {
            return SeverityAssessment {
                severity: Severity::Unknown,
                score: EMPTY_CROP_SCORE,
            };
        };

        let ratio = clamped.area_ratio(frame.width(), frame.height());
        let (severity, heuristic) = self.thresholds.classify(ratio);

        let score = match self.classifier.as_mut() {
            Some(classifier) => {
                let size = classifier.input_size().max(1);
                let crop = imageops::crop_imm(
                    &frame.image,
                    clamped.x,
                    clamped.y,
                    clamped.width,
                    clamped.height,
                )
                .to_image();
                let input = imageops::resize(&crop, size, size, FilterType::Triangle);
                match classifier.predict(&input) {
                    Ok(confidence) => (heuristic + confidence.clamp(0.0, 1.0)) / 2.0,
                    Err(err) => {
                        log::debug!("classifier '{}' failed: {}", classifier.name(), err);
                        heuristic
                    }
                }
            }
            None => heuristic,
        };

        SeverityAssessment { severity, score }
    }
}

impl Default for SeverityEstimator {
    fn default() -> Self {
        Self::new(SeverityThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    struct FixedClassifier(Result<f32, String>);

    impl Classifier for FixedClassifier {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn input_size(&self) -> u32 {
            DEFAULT_CLASSIFIER_INPUT
        }

        fn predict(&mut self, crop: &RgbImage) -> Result<f32> {
            assert_eq!(crop.dimensions(), (224, 224));
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(1, RgbImage::new(w, h))
    }

    #[test]
    fn boundary_ratio_is_medium() {
        // 50x50 in 500x500 is exactly 0.01, which is not below the Low cut.
        let mut est = SeverityEstimator::default();
        let a = est.estimate(&frame(500, 500), &BoundingBox::new(0, 0, 50, 50));
        assert_eq!(a.severity, Severity::Medium);
        assert!((a.score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn larger_boxes_never_get_lower_severity() {
        let mut est = SeverityEstimator::default();
        let f = frame(400, 300);
        let mut last = Severity::Unknown;
        for side in [5u32, 20, 40, 60, 90, 150, 300] {
            let a = est.estimate(&f, &BoundingBox::new(0, 0, side, side));
            assert!(a.severity >= last, "side {} regressed", side);
            last = a.severity;
        }
        assert_eq!(last, Severity::High);
    }

    #[test]
    fn empty_crop_is_unknown() {
        let mut est = SeverityEstimator::default();
        let a = est.estimate(&frame(100, 100), &BoundingBox::new(150, 150, 10, 10));
        assert_eq!(a.severity, Severity::Unknown);
        assert_eq!(a.score, 0.5);
    }

    #[test]
    fn classifier_confidence_is_averaged_without_changing_label() {
        let mut est = SeverityEstimator::default()
            .with_classifier(Box::new(FixedClassifier(Ok(1.7))));
        let a = est.estimate(&frame(100, 100), &BoundingBox::new(0, 0, 5, 5));
        assert_eq!(a.severity, Severity::Low);
        assert!((a.score - 0.65).abs() < 1e-6);
    }

    #[test]
    fn classifier_failure_falls_back_to_heuristic() {
        let mut est = SeverityEstimator::default()
            .with_classifier(Box::new(FixedClassifier(Err("gpu gone".into()))));
        let a = est.estimate(&frame(100, 100), &BoundingBox::new(0, 0, 50, 50));
        assert_eq!(a.severity, Severity::High);
        assert!((a.score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        assert!(SeverityThresholds::new(0.2, 0.1).is_err());
        assert!(SeverityThresholds::new(0.02, 0.1).is_ok());
    }
}
