#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{Classifier, DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection, DEFAULT_CLASS_NAME};
use crate::frame::Frame;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

fn load_plan(model_path: &Path, width: u32, height: u32) -> Result<Plan> {
    if !model_path.exists() {
        return Err(anyhow!("model file {} does not exist", model_path.display()));
    }
    tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

fn image_to_tensor(image: &RgbImage) -> Tensor {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let input = tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
        image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    });
    input.into_tensor()
}

/// YOLO-style ONNX detector.
///
/// The first output is read as rows of `[cx, cy, w, h, objectness, class scores...]`
/// with coordinates normalized to the model input. Row confidence is
/// `objectness * best class score` (or objectness alone for single-class heads).
pub struct TractBackend {
    model: Plan,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    min_confidence: f32,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model = load_plan(model_path.as_ref(), width, height)?;
        Ok(Self {
            model,
            width,
            height,
            class_names: vec![DEFAULT_CLASS_NAME.to_string()],
            min_confidence: 0.05,
        })
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        if !names.is_empty() {
            self.class_names = names;
        }
        self
    }

    fn decode_rows(&self, output: &Tensor, frame_w: u32, frame_h: u32) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let row_len = *shape.last().ok_or_else(|| anyhow!("model output has no shape"))?;
        if row_len < 5 {
            return Err(anyhow!("model output rows have {} values; need >= 5", row_len));
        }
        let flat: Vec<f32> = view.iter().copied().collect();
        let mut out = Vec::new();
        for row in flat.chunks_exact(row_len) {
            let objectness = row[4];
            let (class_id, class_score) = row[5..]
                .iter()
                .enumerate()
                .fold((0usize, 1.0f32), |best, (i, s)| {
                    if i == 0 || *s > best.1 {
                        (i, *s)
                    } else {
                        best
                    }
                });
            let confidence = (objectness * class_score).clamp(0.0, 1.0);
            if confidence < self.min_confidence {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let fw = frame_w as f32;
            let fh = frame_h as f32;
            let Some(bbox) = BoundingBox::from_corners(
                (cx - w / 2.0) * fw,
                (cy - h / 2.0) * fh,
                (cx + w / 2.0) * fw,
                (cy + h / 2.0) * fh,
            ) else {
                continue;
            };
            let name = self
                .class_names
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", class_id));
            out.push(Detection::new(bbox, confidence).with_class(class_id as u32, name));
        }
        Ok(out)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let resized =
            image::imageops::resize(&frame.image, self.width, self.height, FilterType::Triangle);
        let outputs = self
            .model
            .run(tvec!(image_to_tensor(&resized).into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode_rows(output, frame.width(), frame.height())
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.width, self.height);
        self.model
            .run(tvec!(image_to_tensor(&blank).into()))
            .context("ONNX warm-up failed")?;
        Ok(())
    }
}

/// ONNX crop classifier. The maximum output score is the damage confidence.
pub struct TractClassifier {
    model: Plan,
    input_size: u32,
}

impl TractClassifier {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model = load_plan(model_path.as_ref(), input_size, input_size)?;
        Ok(Self { model, input_size })
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&mut self, crop: &RgbImage) -> Result<f32> {
        if crop.width() != self.input_size || crop.height() != self.input_size {
            return Err(anyhow!(
                "crop size {}x{} does not match classifier input {}",
                crop.width(),
                crop.height(),
                self.input_size
            ));
        }
        let outputs = self
            .model
            .run(tvec!(image_to_tensor(crop).into()))
            .context("classifier inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("classifier produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("classifier output tensor was not f32")?;
        let max_score = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max_score.is_finite() {
            Ok(max_score)
        } else {
            Ok(0.0)
        }
    }
}
