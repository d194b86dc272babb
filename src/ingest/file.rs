//! Local file frame source.
//!
//! Replays recorded material without any network access:
//! - a directory of `.jpg`/`.jpeg`/`.png` images, in file-name order
//! - a single image (one frame, then end of stream)
//! - a `.mjpeg`/`.mjpg` file of concatenated JPEGs, as written by the video writer

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::esp32::{decode_jpeg, MjpegStream};
use super::{frame_interval, FrameSource, SourceStats};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const MJPEG_EXTENSIONS: [&str; 2] = ["mjpeg", "mjpg"];

/// Local file frame source.
pub struct FileSource {
    path: PathBuf,
    target_fps: u32,
    backend: FileBackend,
    frame_count: u64,
    decode_failures: u64,
    last_frame_at: Option<Instant>,
}

enum FileBackend {
    Images(VecDeque<PathBuf>),
    Mjpeg(Option<MjpegStream>),
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>, target_fps: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("open frame source {}", path.display()))?;
        let backend = if metadata.is_dir() {
            FileBackend::Images(list_images(&path)?)
        } else if has_extension(&path, &MJPEG_EXTENSIONS) {
            FileBackend::Mjpeg(None)
        } else if has_extension(&path, &IMAGE_EXTENSIONS) {
            FileBackend::Images(VecDeque::from([path.clone()]))
        } else {
            return Err(anyhow!(
                "unsupported file source {}; expected an image, an image directory or .mjpeg",
                path.display()
            ));
        };
        Ok(Self {
            path,
            target_fps,
            backend,
            frame_count: 0,
            decode_failures: 0,
            last_frame_at: None,
        })
    }

    fn pace(&mut self) {
        let interval = frame_interval(self.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        if let FileBackend::Mjpeg(stream) = &mut self.backend {
            let file = File::open(&self.path)
                .with_context(|| format!("open {}", self.path.display()))?;
            *stream = Some(MjpegStream::new(Box::new(BufReader::new(file))));
        }
        log::info!("FileSource: opened {}", self.path.display());
        Ok(())
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>> {
        loop {
            let decoded = match &mut self.backend {
                FileBackend::Images(queue) => {
                    let Some(next) = queue.pop_front() else {
                        return Ok(None);
                    };
                    image::open(&next)
                        .map(|image| image.into_rgb8())
                        .with_context(|| format!("decode {}", next.display()))
                }
                FileBackend::Mjpeg(stream) => {
                    let stream = stream
                        .as_mut()
                        .ok_or_else(|| anyhow!("file source not connected; call connect() first"))?;
                    let Some(bytes) = stream.read_next_jpeg()? else {
                        return Ok(None);
                    };
                    decode_jpeg(&bytes)
                }
            };
            match decoded {
                Ok(image) => {
                    self.pace();
                    self.frame_count += 1;
                    return Ok(Some(image));
                }
                Err(err) => {
                    self.decode_failures += 1;
                    log::warn!("skipping frame: {:#}", err);
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            decode_failures: self.decode_failures,
            source: self.path.display().to_string(),
        }
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<VecDeque<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, &IMAGE_EXTENSIONS) {
            images.push(path);
        }
    }
    if images.is_empty() {
        return Err(anyhow!("no images found in {}", dir.display()));
    }
    images.sort();
    Ok(images.into())
}
