//! RTSP frame source for IP cameras and drone video downlinks.
//!
//! Frames come out of a GStreamer launch line ending in an RGB `appsink`.
//! Without the `rtsp-gstreamer` feature, `open` fails with a descriptive error.

use anyhow::Result;

use super::FrameSource;
use crate::config::SourceSettings;

#[cfg(feature = "rtsp-gstreamer")]
pub use gst::RtspSource;

#[cfg_attr(not(feature = "rtsp-gstreamer"), allow(dead_code))]
const APPSINK_NAME: &str = "roadwatch_sink";

/// Open an RTSP source for `settings.url`.
pub fn open(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    #[cfg(feature = "rtsp-gstreamer")]
    {
        Ok(Box::new(RtspSource::new(settings)?))
    }
    #[cfg(not(feature = "rtsp-gstreamer"))]
    {
        anyhow::bail!(
            "RTSP source {} requires the rtsp-gstreamer feature",
            settings.url
        )
    }
}

/// Launch line for `settings`. Drone links drop UDP packets under load, so
/// the session is forced onto TCP. A configured width/height inserts a scaler.
#[cfg_attr(not(feature = "rtsp-gstreamer"), allow(dead_code))]
pub(crate) fn launch_line(settings: &SourceSettings) -> String {
    let mut caps = String::from("video/x-raw,format=RGB");
    let mut scale = "";
    if settings.width > 0 && settings.height > 0 {
        caps.push_str(&format!(",width={},height={}", settings.width, settings.height));
        scale = "videoscale ! ";
    }
    format!(
        "rtspsrc location=\"{}\" protocols=tcp latency=0 ! decodebin ! videoconvert ! {}{} ! \
         appsink name={} sync=false max-buffers=1 drop=true",
        settings.url.replace('"', "%22"),
        scale,
        caps,
        APPSINK_NAME
    )
}

#[cfg(feature = "rtsp-gstreamer")]
mod gst {
    use anyhow::{anyhow, Context, Result};
    use gstreamer::prelude::*;
    use image::RgbImage;
    use std::time::{Duration, Instant};

    use super::{launch_line, APPSINK_NAME};
    use crate::config::SourceSettings;
    use crate::ingest::{frame_interval, health_grace, FrameSource, SourceStats};

    const CONNECT_GRACE: Duration = Duration::from_secs(5);
    const MIN_PULL_TIMEOUT: Duration = Duration::from_millis(500);

    pub struct RtspSource {
        url: String,
        target_fps: u32,
        pipeline: gstreamer::Pipeline,
        sink: gstreamer_app::AppSink,
        frames: u64,
        short_buffers: u64,
        started: Option<Instant>,
        last_frame: Option<Instant>,
        failure: Option<String>,
        finished: bool,
    }

    impl RtspSource {
        pub fn new(settings: &SourceSettings) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;
            let line = launch_line(settings);
            log::debug!("RTSP launch line: {}", line);
            let pipeline = gstreamer::parse::launch(&line)
                .with_context(|| format!("build RTSP pipeline for {}", settings.url))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("RTSP launch line did not produce a pipeline"))?;
            let sink = pipeline
                .by_name(APPSINK_NAME)
                .context("appsink missing from RTSP pipeline")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("{} is not an appsink", APPSINK_NAME))?;

            Ok(Self {
                url: settings.url.clone(),
                target_fps: settings.target_fps,
                pipeline,
                sink,
                frames: 0,
                short_buffers: 0,
                started: None,
                last_frame: None,
                failure: None,
                finished: false,
            })
        }

        /// Drain pending bus messages; errors stick until the source is dropped.
        fn drain_bus(&mut self) {
            let Some(bus) = self.pipeline.bus() else {
                return;
            };
            while let Some(message) = bus.pop() {
                match message.view() {
                    gstreamer::MessageView::Error(err) => {
                        let origin = err
                            .src()
                            .map(|s| s.path_string().to_string())
                            .unwrap_or_else(|| "pipeline".to_string());
                        self.failure = Some(format!("{}: {}", origin, err.error()));
                    }
                    gstreamer::MessageView::Eos(_) => self.finished = true,
                    _ => {}
                }
            }
        }

        fn pull_timeout(&self) -> Duration {
            (frame_interval(self.target_fps) * 4).max(MIN_PULL_TIMEOUT)
        }
    }

    impl FrameSource for RtspSource {
        fn connect(&mut self) -> Result<()> {
            self.pipeline
                .set_state(gstreamer::State::Playing)
                .with_context(|| format!("start RTSP stream {}", self.url))?;
            self.started = Some(Instant::now());
            log::info!("RTSP stream {} playing", self.url);
            Ok(())
        }

        fn next_image(&mut self) -> Result<Option<RgbImage>> {
            loop {
                self.drain_bus();
                if let Some(failure) = &self.failure {
                    return Err(anyhow!("RTSP stream {} failed: {}", self.url, failure));
                }
                if self.finished {
                    return Ok(None);
                }
                let timeout = gstreamer::ClockTime::from_mseconds(
                    self.pull_timeout().as_millis() as u64,
                );
                let Some(sample) = self.sink.try_pull_sample(timeout) else {
                    if self.sink.is_eos() {
                        self.finished = true;
                        return Ok(None);
                    }
                    return Err(anyhow!(
                        "no RTSP frame from {} within {:?}",
                        self.url,
                        self.pull_timeout()
                    ));
                };
                match rgb_from_sample(&sample) {
                    Ok(image) => {
                        self.frames += 1;
                        self.last_frame = Some(Instant::now());
                        return Ok(Some(image));
                    }
                    Err(err) => {
                        self.short_buffers += 1;
                        log::debug!("dropping RTSP sample: {:#}", err);
                    }
                }
            }
        }

        fn is_healthy(&self) -> bool {
            if self.failure.is_some() {
                return false;
            }
            match (self.started, self.last_frame) {
                (None, _) => false,
                (Some(started), None) => started.elapsed() <= CONNECT_GRACE,
                (Some(_), Some(last)) => last.elapsed() <= health_grace(self.target_fps),
            }
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.frames,
                decode_failures: self.short_buffers,
                source: self.url.clone(),
            }
        }
    }

    impl Drop for RtspSource {
        fn drop(&mut self) {
            if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RTSP pipeline for {} did not stop: {}", self.url, err);
            }
        }
    }

    /// Copy an RGB sample into an image, dropping any row padding.
    fn rgb_from_sample(sample: &gstreamer::Sample) -> Result<RgbImage> {
        let caps = sample.caps().context("sample without caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("caps are not raw video")?;
        let buffer = sample.buffer().context("sample without buffer")?;
        let map = buffer.map_readable().context("buffer not readable")?;

        let (width, height) = (info.width(), info.height());
        let row = width as usize * 3;
        let stride = usize::try_from(info.stride()[0]).context("negative stride")?;
        if stride < row {
            return Err(anyhow!("stride {} shorter than a {}px RGB row", stride, width));
        }
        let pixels: Vec<u8> = map
            .as_slice()
            .chunks(stride)
            .take(height as usize)
            .flat_map(|line| line.iter().take(row).copied())
            .collect();
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("{}x{} sample is truncated", width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str, width: u32, height: u32) -> SourceSettings {
        SourceSettings {
            url: url.to_string(),
            target_fps: 15,
            width,
            height,
        }
    }

    #[test]
    fn launch_line_scales_to_configured_size() {
        let line = launch_line(&settings("rtsp://drone/live", 1280, 720));
        assert!(line.contains("location=\"rtsp://drone/live\""));
        assert!(line.contains("protocols=tcp"));
        assert!(line.contains("videoscale ! video/x-raw,format=RGB,width=1280,height=720"));
        assert!(line.ends_with("appsink name=roadwatch_sink sync=false max-buffers=1 drop=true"));
    }

    #[test]
    fn launch_line_keeps_native_size_without_dimensions() {
        let line = launch_line(&settings("rtsp://cam/stream", 0, 0));
        assert!(!line.contains("videoscale"));
        assert!(line.contains("videoconvert ! video/x-raw,format=RGB ! appsink"));
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn open_without_feature_names_the_feature() {
        let err = open(&settings("rtsp://cam/stream", 0, 0)).err().expect("must fail");
        assert!(err.to_string().contains("rtsp-gstreamer"));
    }
}
