//! Synthetic road scene (`stub://`).
//!
//! Draws textured asphalt with dark elliptical potholes scrolling towards the
//! camera, so the classical CPU detector has something to find. Query
//! parameters: `frames` (stream length, unbounded when absent), `potholes`
//! (count, default 1) and `seed`.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use url::Url;

use super::{frame_interval, FrameSource, SourceStats};
use crate::config::SourceSettings;

const ASPHALT_LUMA: u8 = 160;
const ASPHALT_NOISE: i16 = 8;
const POTHOLE_LUMA: u8 = 35;
const MAX_POTHOLES: u32 = 8;

pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    target_fps: u32,
    frame_limit: Option<u64>,
    potholes: u32,
    seed: u64,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let url = Url::parse(&settings.url)
            .with_context(|| format!("parse synthetic source url '{}'", settings.url))?;
        let mut frame_limit = None;
        let mut potholes = 1;
        let mut seed = 0;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    frame_limit = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| anyhow!("stub frames must be an integer"))?,
                    )
                }
                "potholes" => {
                    potholes = value
                        .parse::<u32>()
                        .map_err(|_| anyhow!("stub potholes must be an integer"))?
                }
                "seed" => {
                    seed = value
                        .parse::<u64>()
                        .map_err(|_| anyhow!("stub seed must be an integer"))?
                }
                other => log::debug!("ignoring stub parameter '{}'", other),
            }
        }
        if potholes > MAX_POTHOLES {
            return Err(anyhow!("stub supports at most {} potholes", MAX_POTHOLES));
        }
        if settings.width < 16 || settings.height < 16 {
            return Err(anyhow!("synthetic frames must be at least 16x16"));
        }
        Ok(Self {
            url: settings.url.clone(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            frame_limit,
            potholes,
            seed,
            frame_count: 0,
            last_frame_at: None,
            connected: false,
        })
    }

    fn render(&self) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(self.seed ^ self.frame_count);
        let mut image = RgbImage::from_fn(self.width, self.height, |_, _| {
            let jitter = rng.gen_range(-ASPHALT_NOISE..=ASPHALT_NOISE);
            let v = (ASPHALT_LUMA as i16 + jitter).clamp(0, 255) as u8;
            Rgb([v, v, v.saturating_sub(4)])
        });

        let rx = (self.width / 8).max(2) as i64;
        let ry = (self.height / 10).max(2) as i64;
        let travel = self.height as i64 + 2 * ry;
        let speed = (self.height as i64 / 60).max(1);
        for i in 0..self.potholes as i64 {
            let lanes = self.potholes as i64 + 1;
            let cx = self.width as i64 * (i + 1) / lanes;
            let offset = i * travel / self.potholes as i64;
            let cy = (self.frame_count as i64 * speed + offset) % travel - ry;
            draw_ellipse(&mut image, cx, cy, rx, ry);
        }
        image
    }
}

fn draw_ellipse(image: &mut RgbImage, cx: i64, cy: i64, rx: i64, ry: i64) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    for y in (cy - ry).max(0)..(cy + ry + 1).min(h) {
        for x in (cx - rx).max(0)..(cx + rx + 1).min(w) {
            let dx = (x - cx) as f64 / rx as f64;
            let dy = (y - cy) as f64 / ry as f64;
            if dx * dx + dy * dy <= 1.0 {
                image.put_pixel(x as u32, y as u32, Rgb([POTHOLE_LUMA; 3]));
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.url);
        Ok(())
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        if self.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        let interval = frame_interval(self.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(self.render()))
    }

    fn is_healthy(&self) -> bool {
        self.connected
            && self
                .last_frame_at
                .map_or(true, |at| at.elapsed() < Duration::from_secs(5))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            decode_failures: 0,
            source: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{CpuBackend, DetectorBackend};
    use crate::frame::Frame;

    fn settings(url: &str, width: u32, height: u32) -> SourceSettings {
        SourceSettings {
            url: url.to_string(),
            target_fps: 0,
            width,
            height,
        }
    }

    #[test]
    fn honours_frame_limit() -> Result<()> {
        let mut source = SyntheticSource::new(&settings("stub://road?frames=3", 64, 48))?;
        source.connect()?;
        let mut n = 0;
        while source.next_image()?.is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn frames_have_configured_size() -> Result<()> {
        let mut source = SyntheticSource::new(&settings("stub://road", 320, 240))?;
        source.connect()?;
        let image = source.next_image()?.unwrap();
        assert_eq!(image.dimensions(), (320, 240));
        Ok(())
    }

    #[test]
    fn same_seed_renders_same_scene() -> Result<()> {
        let mut a = SyntheticSource::new(&settings("stub://road?seed=9", 64, 48))?;
        let mut b = SyntheticSource::new(&settings("stub://road?seed=9", 64, 48))?;
        a.connect()?;
        b.connect()?;
        assert_eq!(a.next_image()?, b.next_image()?);
        Ok(())
    }

    #[test]
    fn cpu_detector_finds_synthetic_pothole() -> Result<()> {
        let mut source = SyntheticSource::new(&settings("stub://road?frames=40", 640, 480))?;
        source.connect()?;
        let mut backend = CpuBackend::default();
        // skip frames where the pothole is still entering the view
        let mut found = false;
        for n in 1..=40 {
            let image = source.next_image()?.unwrap();
            if !backend.detect(&Frame::new(n, image))?.is_empty() {
                found = true;
                break;
            }
        }
        assert!(found);
        Ok(())
    }

    #[test]
    fn bad_parameters_are_rejected() {
        assert!(SyntheticSource::new(&settings("stub://road?frames=x", 64, 48)).is_err());
        assert!(SyntheticSource::new(&settings("stub://road?potholes=99", 64, 48)).is_err());
        assert!(SyntheticSource::new(&settings("stub://road", 8, 8)).is_err());
    }

    #[test]
    fn next_image_requires_connect() {
        let mut source = SyntheticSource::new(&settings("stub://road", 64, 48)).unwrap();
        assert!(source.next_image().is_err());
    }
}
