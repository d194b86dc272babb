//! Frame ingestion sources.
//!
//! This module provides different sources for camera frames:
//! - ESP32 / IP camera MJPEG over HTTP, JPEG over RTP/UDP (`http://`, `udp://`)
//! - RTSP streams via GStreamer (feature: rtsp-gstreamer)
//! - Local image directories, single images and recorded `.mjpeg` files
//! - Synthetic road scenes (`stub://`), for tests and demos
//!
//! Sources only decode. Numbering, timestamps and hand-off to the consumer loop
//! belong to the `CaptureWorker`.

pub mod esp32;
pub mod file;
pub mod rtsp;
pub mod synthetic;
mod worker;

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Duration;

use crate::config::SourceSettings;

pub use esp32::Esp32Source;
pub use file::FileSource;
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;
pub use worker::{CaptureWorker, DEFAULT_JOIN_TIMEOUT};

/// A decoded stream of RGB images.
pub trait FrameSource: Send {
    /// Open the underlying device or stream. Called once by the capture worker.
    fn connect(&mut self) -> Result<()>;

    /// Next image, or `None` at end of stream.
    fn next_image(&mut self) -> Result<Option<RgbImage>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub decode_failures: u64,
    pub source: String,
}

/// Pick a source implementation from the URL scheme.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let url = settings.url.trim();
    if url.is_empty() {
        return Err(anyhow!("source url is empty"));
    }
    let scheme = url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());
    let source: Box<dyn FrameSource> = match scheme.as_deref() {
        Some("stub") => Box::new(SyntheticSource::new(settings)?),
        Some("http") | Some("https") | Some("udp") => {
            Box::new(Esp32Source::new(url, settings.target_fps)?)
        }
        Some("rtsp") | Some("rtsps") => rtsp::open(settings)?,
        Some("file") => Box::new(FileSource::new(&url["file://".len()..], settings.target_fps)?),
        Some(other) => return Err(anyhow!("unsupported source scheme '{}'", other)),
        None => Box::new(FileSource::new(url, settings.target_fps)?),
    };
    Ok(source)
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> SourceSettings {
        SourceSettings {
            url: url.to_string(),
            target_fps: 0,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn stub_scheme_opens_synthetic_source() {
        let mut source = open_source(&settings("stub://road?frames=2")).unwrap();
        source.connect().unwrap();
        assert!(source.next_image().unwrap().is_some());
        assert!(source.next_image().unwrap().is_some());
        assert!(source.next_image().unwrap().is_none());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(open_source(&settings("gopher://camera")).is_err());
        assert!(open_source(&settings("   ")).is_err());
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_gstreamer_is_rejected() {
        assert!(open_source(&settings("rtsp://10.0.0.2/stream")).is_err());
    }

    #[test]
    fn missing_local_path_is_rejected() {
        assert!(open_source(&settings("/definitely/not/here.jpg")).is_err());
    }

    #[test]
    fn pacing_helpers() {
        assert_eq!(frame_interval(0), Duration::ZERO);
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(health_grace(0), Duration::from_secs(2));
        assert_eq!(health_grace(1), Duration::from_secs(6));
    }
}
