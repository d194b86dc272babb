//! JPEG encoding, detection snapshots and the MJPEG video writer.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out)
}

/// Write `image` into `dir` as `<utc timestamp>_<content hash>.jpg`.
///
/// The name is derived from the encoded bytes, so saving the same frame twice
/// yields the same file.
pub fn save_snapshot(dir: &Path, image: &RgbImage, captured_at: DateTime<Utc>) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create snapshot directory {}", dir.display()))?;
    let bytes = encode_jpeg(image, DEFAULT_JPEG_QUALITY)?;
    let digest = Sha256::digest(&bytes);
    let name = format!(
        "pothole_{}_{}.jpg",
        captured_at.format("%Y%m%d_%H%M%S"),
        &hex::encode(digest)[..16]
    );
    let path = dir.join(name);
    std::fs::write(&path, &bytes).with_context(|| format!("write snapshot {}", path.display()))?;
    Ok(path)
}

/// Motion-JPEG recorder: each frame is appended as a complete JPEG.
pub struct VideoWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    quality: u8,
    frames: u64,
    size: Option<(u32, u32)>,
}

impl VideoWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create video directory {}", parent.display()))?;
        }
        let file =
            File::create(&path).with_context(|| format!("create video file {}", path.display()))?;
        log::info!("recording annotated video to {}", path.display());
        Ok(Self {
            path,
            out: Some(BufWriter::new(file)),
            quality: DEFAULT_JPEG_QUALITY,
            frames: 0,
            size: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Frames must keep the size of the first frame written.
    pub fn write_frame(&mut self, image: &RgbImage) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| anyhow!("video writer {} already finished", self.path.display()))?;
        let dims = image.dimensions();
        match self.size {
            Some(size) if size != dims => {
                return Err(anyhow!(
                    "frame size {}x{} differs from recording size {}x{}",
                    dims.0,
                    dims.1,
                    size.0,
                    size.1
                ))
            }
            _ => self.size = Some(dims),
        }
        let bytes = encode_jpeg(image, self.quality)?;
        out.write_all(&bytes).context("write video frame")?;
        self.frames += 1;
        Ok(())
    }

    /// Flush and close the file. Safe to call more than once.
    pub fn finish(&mut self) -> Result<u64> {
        if let Some(mut out) = self.out.take() {
            out.flush()
                .with_context(|| format!("flush video file {}", self.path.display()))?;
            log::info!(
                "video {} closed after {} frames",
                self.path.display(),
                self.frames
            );
        }
        Ok(self.frames)
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::warn!("{:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FileSource, FrameSource};
    use image::Rgb;

    #[test]
    fn snapshot_name_is_content_addressed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = RgbImage::from_pixel(16, 16, Rgb([10, 20, 30]));
        let at = Utc::now();
        let a = save_snapshot(dir.path(), &image, at)?;
        let b = save_snapshot(dir.path(), &image, at)?;
        assert_eq!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("pothole_"));
        assert!(name.ends_with(".jpg"));
        assert!(image::open(&a).is_ok());
        Ok(())
    }

    #[test]
    fn video_round_trips_through_file_source() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out/survey.mjpeg");
        let mut writer = VideoWriter::create(&path)?;
        for shade in [0u8, 100, 200] {
            writer.write_frame(&RgbImage::from_pixel(24, 16, Rgb([shade; 3])))?;
        }
        assert_eq!(writer.finish()?, 3);
        assert!(writer.write_frame(&RgbImage::new(24, 16)).is_err());

        let mut source = FileSource::new(&path, 0)?;
        source.connect()?;
        let mut n = 0;
        while source.next_image()?.is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
        Ok(())
    }

    #[test]
    fn frame_size_change_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = VideoWriter::create(dir.path().join("v.mjpeg"))?;
        writer.write_frame(&RgbImage::new(8, 8))?;
        assert!(writer.write_frame(&RgbImage::new(16, 8)).is_err());
        Ok(())
    }
}
