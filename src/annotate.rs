//! Frame annotation: severity-colored boxes, HUD overlay and FPS counter.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::detect::BoundingBox;
use crate::telemetry::Telemetry;
use crate::Severity;

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: u32 = 2;
const HUD_SCALE: u32 = 2;
const LABEL_PAD: i32 = 3;
const HUD_BACKGROUND: Rgb<u8> = Rgb([15, 15, 15]);
const TEXT_COLOR: Rgb<u8> = Rgb([240, 240, 240]);
const HUD_ACCENT: Rgb<u8> = Rgb([0, 200, 255]);

/// Rolling frames-per-second over a fixed time window.
#[derive(Debug)]
pub struct FpsCounter {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ticks: VecDeque::new(),
        }
    }

    /// Record a frame and return the current rate.
    pub fn tick(&mut self) -> f64 {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> f64 {
        self.ticks.push_back(now);
        while let Some(first) = self.ticks.front() {
            if now.duration_since(*first) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        self.fps()
    }

    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.ticks.front(), self.ticks.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if self.ticks.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.ticks.len() - 1) as f64 / span
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Values shown in the top-left overlay.
#[derive(Clone, Debug, Default)]
pub struct HudInfo {
    pub frame_number: u64,
    pub detections: u64,
    pub fps: f64,
    pub telemetry: Option<Telemetry>,
}

impl HudInfo {
    fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "FRAME {}  DET {}  FPS {:.1}",
            self.frame_number, self.detections, self.fps
        )];
        if let Some(t) = self.telemetry.as_ref().filter(|t| t.has_position()) {
            lines.push(format!("ALT {:.1}M  HDG {:.0}", t.altitude_m, t.heading_deg));
            lines.push(format!("POS {:.5}, {:.5}", t.latitude, t.longitude));
        }
        lines
    }
}

/// Outline `bbox` in the severity color with a confidence label above it.
pub fn draw_detection(image: &mut RgbImage, bbox: &BoundingBox, severity: Severity, confidence: f32) {
    let Some(bbox) = bbox.clamp_to(image.width(), image.height()) else {
        return;
    };
    let color = Rgb(severity.color());
    for inset in 0..BOX_THICKNESS {
        let w = bbox.width.saturating_sub(2 * inset);
        let h = bbox.height.saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(image, rect, color);
    }
    let label = format!("{} {:.0}%", severity.as_str(), confidence * 100.0);
    let label_h = text_height(LABEL_SCALE) as i32 + 2 * LABEL_PAD;
    let y = if bbox.y as i32 >= label_h {
        bbox.y as i32 - label_h
    } else {
        bbox.bottom() as i32
    };
    draw_text_with_bg(image, &label, bbox.x as i32, y, LABEL_SCALE, color);
}

pub fn draw_hud(image: &mut RgbImage, hud: &HudInfo) {
    let line_h = text_height(HUD_SCALE) as i32 + 2 * LABEL_PAD + 2;
    for (i, line) in hud.lines().iter().enumerate() {
        draw_text_with_bg(image, line, 8, 8 + i as i32 * line_h, HUD_SCALE, HUD_ACCENT);
    }
}

/// Dark label box with a colored accent bar on the left.
fn draw_text_with_bg(image: &mut RgbImage, text: &str, x: i32, y: i32, scale: u32, accent: Rgb<u8>) {
    let w = text_width(text, scale) + 2 * LABEL_PAD as u32 + 3;
    let h = text_height(scale) + 2 * LABEL_PAD as u32;
    draw_filled_rect_mut(image, Rect::at(x, y).of_size(w, h), HUD_BACKGROUND);
    draw_filled_rect_mut(image, Rect::at(x, y).of_size(3, h), accent);
    draw_text(image, text, x + 3 + LABEL_PAD, y + LABEL_PAD, scale, TEXT_COLOR);
}

pub fn text_width(text: &str, scale: u32) -> u32 {
    let n = text.chars().count() as u32;
    if n == 0 {
        0
    } else {
        n * (GLYPH_W + 1) * scale - scale
    }
}

pub fn text_height(scale: u32) -> u32 {
    GLYPH_H * scale
}

/// Render `text` with the built-in 3x5 pixel font. Pixels outside the image are skipped.
pub fn draw_text(image: &mut RgbImage, text: &str, x: i32, y: i32, scale: u32, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let scale_i = scale as i32;
    for (i, ch) in text.chars().enumerate() {
        let rows = glyph(ch);
        let gx = x + i as i32 * (GLYPH_W as i32 + 1) * scale_i;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W as i32 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale_i {
                    for dx in 0..scale_i {
                        let px = gx + col * scale_i + dx;
                        let py = y + row as i32 * scale_i + dy;
                        if px >= 0 && py >= 0 && px < w && py < h {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

const GLYPH_W: u32 = 3;
const GLYPH_H: u32 = 5;

fn glyph(ch: char) -> [u8; 5] {
    match ch.to_ascii_uppercase() {
        '0' => [7, 5, 5, 5, 7],
        '1' => [2, 6, 2, 2, 7],
        '2' => [7, 1, 7, 4, 7],
        '3' => [7, 1, 7, 1, 7],
        '4' => [5, 5, 7, 1, 1],
        '5' => [7, 4, 7, 1, 7],
        '6' => [7, 4, 7, 5, 7],
        '7' => [7, 1, 1, 1, 1],
        '8' => [7, 5, 7, 5, 7],
        '9' => [7, 5, 7, 1, 7],
        'A' => [2, 5, 7, 5, 5],
        'B' => [6, 5, 6, 5, 6],
        'C' => [3, 4, 4, 4, 3],
        'D' => [6, 5, 5, 5, 6],
        'E' => [7, 4, 6, 4, 7],
        'F' => [7, 4, 6, 4, 4],
        'G' => [3, 4, 5, 5, 3],
        'H' => [5, 5, 7, 5, 5],
        'I' => [7, 2, 2, 2, 7],
        'J' => [1, 1, 1, 5, 2],
        'K' => [5, 5, 6, 5, 5],
        'L' => [4, 4, 4, 4, 7],
        'M' => [5, 7, 7, 5, 5],
        'N' => [6, 5, 5, 5, 5],
        'O' => [2, 5, 5, 5, 2],
        'P' => [6, 5, 6, 4, 4],
        'Q' => [2, 5, 5, 6, 3],
        'R' => [6, 5, 6, 5, 5],
        'S' => [3, 4, 2, 1, 6],
        'T' => [7, 2, 2, 2, 2],
        'U' => [5, 5, 5, 5, 7],
        'V' => [5, 5, 5, 5, 2],
        'W' => [5, 5, 7, 7, 5],
        'X' => [5, 5, 2, 5, 5],
        'Y' => [5, 5, 2, 2, 2],
        'Z' => [7, 1, 2, 4, 7],
        '.' => [0, 0, 0, 0, 2],
        ',' => [0, 0, 0, 2, 4],
        '-' => [0, 0, 7, 0, 0],
        '+' => [0, 2, 7, 2, 0],
        ':' => [0, 2, 0, 2, 0],
        '/' => [1, 1, 2, 4, 4],
        '%' => [5, 1, 2, 4, 5],
        '(' => [1, 2, 2, 2, 1],
        ')' => [4, 2, 2, 2, 4],
        ' ' => [0, 0, 0, 0, 0],
        _ => [7, 1, 2, 0, 2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_is_drawn_in_severity_color() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]));
        let bbox = BoundingBox::new(40, 40, 30, 20);
        draw_detection(&mut image, &bbox, Severity::High, 0.9);
        assert_eq!(image.get_pixel(40, 50), &Rgb(Severity::High.color()));
        assert_eq!(image.get_pixel(69, 50), &Rgb(Severity::High.color()));
        // interior untouched
        assert_eq!(image.get_pixel(55, 50), &Rgb([128, 128, 128]));
    }

    #[test]
    fn box_outside_frame_is_ignored() {
        let mut image = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        draw_detection(&mut image, &BoundingBox::new(50, 50, 5, 5), Severity::Low, 0.7);
        assert!(image.pixels().all(|p| *p == Rgb([1, 2, 3])));
    }

    #[test]
    fn text_stays_inside_image() {
        let mut image = RgbImage::new(20, 8);
        draw_text(&mut image, "FRAME 123456789", -4, 2, 2, TEXT_COLOR);
        assert!(image.pixels().any(|p| *p == TEXT_COLOR));
        assert_eq!(text_width("AB", 1), 7);
        assert_eq!(text_width("", 3), 0);
    }

    #[test]
    fn hud_shows_telemetry_only_with_position() {
        let mut hud = HudInfo {
            frame_number: 4,
            detections: 1,
            fps: 12.5,
            telemetry: Some(Telemetry::default()),
        };
        assert_eq!(hud.lines().len(), 1);
        hud.telemetry = Some(Telemetry {
            latitude: 17.66,
            longitude: 75.9,
            altitude_m: 30.0,
            ..Telemetry::default()
        });
        let lines = hud.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("ALT 30.0M"));
        let mut image = RgbImage::new(320, 240);
        draw_hud(&mut image, &hud);
        assert_eq!(image.get_pixel(8, 8), &HUD_ACCENT);
    }

    #[test]
    fn fps_counts_frames_over_window() {
        let mut fps = FpsCounter::new(Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(fps.tick_at(start), 0.0);
        for i in 1..=10 {
            fps.tick_at(start + Duration::from_millis(100 * i));
        }
        assert!((fps.fps() - 10.0).abs() < 1e-6);
    }
}
