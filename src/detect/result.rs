use serde::{Deserialize, Serialize};

pub const DEFAULT_CLASS_NAME: &str = "pothole";

/// Axis-aligned box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from signed/fractional corner coordinates, clipping negatives to 0.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Self> {
        let left = x1.min(x2).max(0.0);
        let top = y1.min(y2).max(0.0);
        let right = x1.max(x2).max(0.0);
        let bottom = y1.max(y2).max(0.0);
        let width = (right - left).round() as u32;
        let height = (bottom - top).round() as u32;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self::new(left.round() as u32, top.round() as u32, width, height))
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Intersect with the frame rectangle. `None` when nothing remains.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<Self> {
        let x1 = self.x.min(frame_width);
        let y1 = self.y.min(frame_height);
        let x2 = self.right().min(frame_width);
        let y2 = self.bottom().min(frame_height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self::new(x1, y1, x2 - x1, y2 - y1))
    }

    pub fn area_ratio(&self, frame_width: u32, frame_height: u32) -> f64 {
        let frame_area = frame_width as u64 * frame_height as u64;
        if frame_area == 0 {
            return 0.0;
        }
        self.area() as f64 / frame_area as f64
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = self.right().min(other.right());
        let iy2 = self.bottom().min(other.bottom());
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = (ix2 - ix1) as u64 * (iy2 - iy1) as u64;
        let union = self.area() + other.area() - inter;
        if union == 0 {
            return 0.0;
        }
        (inter as f64 / union as f64) as f32
    }
}

/// One detector proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub class_name: String,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            class_id: 0,
            class_name: DEFAULT_CLASS_NAME.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn with_class(mut self, class_id: u32, class_name: impl Into<String>) -> Self {
        self.class_id = class_id;
        self.class_name = class_name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_trims_box_to_frame() {
        let b = BoundingBox::new(90, 90, 20, 20);
        assert_eq!(b.clamp_to(100, 100), Some(BoundingBox::new(90, 90, 10, 10)));
        assert_eq!(BoundingBox::new(120, 0, 5, 5).clamp_to(100, 100), None);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(10, 10, 30, 30);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
        assert_eq!(b.iou(&BoundingBox::new(100, 100, 5, 5)), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 10, 10);
        // inter 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn corners_reject_degenerate_boxes() {
        assert!(BoundingBox::from_corners(5.0, 5.0, 5.2, 40.0).is_none());
        let b = BoundingBox::from_corners(-4.0, 2.0, 10.0, 12.0).unwrap();
        assert_eq!(b, BoundingBox::new(0, 2, 10, 10));
    }
}
