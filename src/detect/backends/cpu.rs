use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const DEFAULT_CELL_SIZE: u32 = 16;
const DEFAULT_DARK_RATIO: f32 = 0.55;
const DEFAULT_MAX_LUMA: f32 = 90.0;
const DEFAULT_MIN_CELLS: usize = 2;
/// Components covering more than this share of the grid are shadows or night scenes.
const MAX_COMPONENT_SHARE: f32 = 0.5;

/// Classical dark-region detector.
///
/// The frame is split into square cells; a cell is dark when its mean luma is
/// below both `max_luma` and `dark_ratio` times the frame mean. 4-connected
/// components of dark cells become proposals, with confidence rising with the
/// contrast against the frame mean.
pub struct CpuBackend {
    cell_size: u32,
    dark_ratio: f32,
    max_luma: f32,
    min_cells: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            dark_ratio: DEFAULT_DARK_RATIO,
            max_luma: DEFAULT_MAX_LUMA,
            min_cells: DEFAULT_MIN_CELLS,
        }
    }
}

impl CpuBackend {
    pub fn new(cell_size: u32) -> Result<Self> {
        if cell_size == 0 {
            return Err(anyhow!("cpu backend cell size must be greater than zero"));
        }
        Ok(Self {
            cell_size,
            ..Self::default()
        })
    }

    pub fn with_min_cells(mut self, min_cells: usize) -> Self {
        self.min_cells = min_cells.max(1);
        self
    }

    fn cell_lumas(&self, frame: &Frame) -> (Vec<f32>, u32, u32) {
        let cols = frame.width().div_ceil(self.cell_size);
        let rows = frame.height().div_ceil(self.cell_size);
        let mut sums = vec![0f64; (cols * rows) as usize];
        let mut counts = vec![0u32; (cols * rows) as usize];
        for (x, y, pixel) in frame.image.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
            let idx = ((y / self.cell_size) * cols + x / self.cell_size) as usize;
            sums[idx] += luma;
            counts[idx] += 1;
        }
        let lumas = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| if *count == 0 { 0.0 } else { (*sum / *count as f64) as f32 })
            .collect();
        (lumas, cols, rows)
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let (lumas, cols, rows) = self.cell_lumas(frame);
        let frame_mean = lumas.iter().sum::<f32>() / lumas.len() as f32;
        if frame_mean <= f32::EPSILON {
            return Ok(Vec::new());
        }
        let cutoff = self.max_luma.min(frame_mean * self.dark_ratio);
        let dark: Vec<bool> = lumas.iter().map(|l| *l < cutoff).collect();

        let mut visited = vec![false; dark.len()];
        let mut out = Vec::new();
        for start in 0..dark.len() {
            if !dark[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            let mut queue = VecDeque::from([start]);
            let mut cells = Vec::new();
            while let Some(idx) = queue.pop_front() {
                cells.push(idx);
                let cx = idx as u32 % cols;
                let cy = idx as u32 / cols;
                let mut neighbours = Vec::with_capacity(4);
                if cx > 0 {
                    neighbours.push(idx - 1);
                }
                if cx + 1 < cols {
                    neighbours.push(idx + 1);
                }
                if cy > 0 {
                    neighbours.push(idx - cols as usize);
                }
                if cy + 1 < rows {
                    neighbours.push(idx + cols as usize);
                }
                for n in neighbours {
                    if dark[n] && !visited[n] {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                }
            }

            if cells.len() < self.min_cells
                || cells.len() as f32 > dark.len() as f32 * MAX_COMPONENT_SHARE
            {
                continue;
            }

            let (mut min_cx, mut min_cy, mut max_cx, mut max_cy) = (u32::MAX, u32::MAX, 0, 0);
            let mut luma_sum = 0f32;
            for idx in &cells {
                let cx = *idx as u32 % cols;
                let cy = *idx as u32 / cols;
                min_cx = min_cx.min(cx);
                min_cy = min_cy.min(cy);
                max_cx = max_cx.max(cx);
                max_cy = max_cy.max(cy);
                luma_sum += lumas[*idx];
            }
            let bbox = BoundingBox::new(
                min_cx * self.cell_size,
                min_cy * self.cell_size,
                (max_cx - min_cx + 1) * self.cell_size,
                (max_cy - min_cy + 1) * self.cell_size,
            );
            let Some(bbox) = bbox.clamp_to(frame.width(), frame.height()) else {
                continue;
            };
            let component_mean = luma_sum / cells.len() as f32;
            let contrast = ((frame_mean - component_mean) / frame_mean).clamp(0.0, 1.0);
            out.push(Detection::new(bbox, 0.5 + 0.5 * contrast));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backend::DetectorBackend;
    use image::{Rgb, RgbImage};

    fn road_with_hole() -> Frame {
        let mut image = RgbImage::from_pixel(128, 128, Rgb([180, 180, 180]));
        for y in 32..64 {
            for x in 48..96 {
                image.put_pixel(x, y, Rgb([20, 20, 20]));
            }
        }
        Frame::new(1, image)
    }

    #[test]
    fn dark_patch_is_proposed() {
        let mut backend = CpuBackend::default();
        let out = backend.detect(&road_with_hole()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, BoundingBox::new(48, 32, 48, 32));
        assert!(out[0].confidence > 0.85);
        assert_eq!(out[0].class_name, "pothole");
    }

    #[test]
    fn uniform_frame_has_no_proposals() {
        let mut backend = CpuBackend::default();
        let frame = Frame::new(1, RgbImage::from_pixel(64, 64, Rgb([120, 120, 120])));
        assert!(backend.detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn zero_cell_size_is_rejected() {
        assert!(CpuBackend::new(0).is_err());
    }
}
