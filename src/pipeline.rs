//! Detection pipeline loop.
//!
//! `Idle -> Streaming -> (Detecting <-> Streaming) -> Stopped`
//!
//! Each processed frame runs detector, NMS and acceptance filtering. Every
//! accepted box then gets a severity, a coordinate and a snapshot, is persisted,
//! and is queued for remote reporting. The annotated frame goes to the
//! optional video writer and to the shared feed read by `/video_feed`.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::annotate::{draw_detection, draw_hud, FpsCounter, HudInfo};
use crate::config::RoadwatchConfig;
use crate::detect::{build_classifier, build_detector, non_max_suppression, Detection, DetectorBackend};
use crate::frame::{Frame, LatestFrame, SlotStatus};
use crate::geo::{pixel_to_ground, CameraFov};
use crate::ingest::{CaptureWorker, FrameSource, DEFAULT_JOIN_TIMEOUT};
use crate::location::{
    LocationMetadata, LocationResolution, LocationResolver, LocationSources, Provenance,
    SharedFlightController, SharedGps,
};
use crate::output::{save_snapshot, VideoWriter};
use crate::report::{RemoteReporter, ReportPayload};
use crate::severity::SeverityEstimator;
use crate::storage::{DetectionRecord, DetectionStore, NewDetection, SqliteDetectionStore};
use crate::telemetry::ipgeo::IpGeolocator;
use crate::telemetry::{FixQuality, FlightController, GpsFix, GpsReceiver, Telemetry};
use crate::{validate_camera_tag, Severity};

const SLOT_POLL: Duration = Duration::from_millis(200);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Shared handle to the most recent resolved location.
pub type SharedLocation = Arc<Mutex<Option<LocationResolution>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Streaming,
    Detecting,
    Stopped,
}

/// Cloneable stop flag, safe to trigger from a signal handler.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub detector_failures: u64,
    pub detections: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub snapshots: u64,
    pub reports_queued: u64,
    pub reports_dropped: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub location_sources: BTreeMap<String, u64>,
    pub duration_s: f64,
    pub average_fps: f64,
}

/// Knobs for one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub camera_tag: String,
    pub frame_skip: u64,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub acceptance_confidence: f32,
    /// Snapshots are written here when set.
    pub snapshot_dir: Option<PathBuf>,
    /// Ground projection is used when set.
    pub aerial_fov: Option<CameraFov>,
    pub video_path: Option<PathBuf>,
    pub max_duration: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            camera_tag: "main_camera".to_string(),
            frame_skip: 1,
            confidence_threshold: crate::detect::DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: crate::detect::DEFAULT_NMS_THRESHOLD,
            acceptance_confidence: 0.6,
            snapshot_dir: None,
            aerial_fov: None,
            video_path: None,
            max_duration: None,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(cfg: &RoadwatchConfig) -> Self {
        Self {
            camera_tag: cfg.camera_tag.clone(),
            frame_skip: cfg.detection.frame_skip,
            confidence_threshold: cfg.detection.confidence_threshold,
            nms_threshold: cfg.detection.nms_threshold,
            acceptance_confidence: cfg.detection.acceptance_confidence,
            snapshot_dir: cfg
                .detection
                .save_snapshots
                .then(|| cfg.detections_dir.clone()),
            aerial_fov: cfg.drone.aerial.then_some(cfg.drone.fov),
            video_path: cfg.output.video_path.clone(),
            max_duration: cfg.output.max_duration,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_camera_tag(&self.camera_tag)?;
        if self.frame_skip == 0 {
            return Err(anyhow!("frame_skip must be at least 1"));
        }
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nms_threshold", self.nms_threshold),
            ("acceptance_confidence", self.acceptance_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1] (got {})", name, value));
            }
        }
        Ok(())
    }
}

/// What happened to one frame.
#[derive(Debug)]
pub struct FrameOutcome {
    pub processed: bool,
    pub records: Vec<DetectionRecord>,
    pub image: RgbImage,
}

pub struct DetectionPipeline {
    options: PipelineOptions,
    detector: Box<dyn DetectorBackend>,
    estimator: SeverityEstimator,
    resolver: LocationResolver,
    store: Box<dyn DetectionStore>,
    reporter: Option<RemoteReporter>,
    flight_controller: Option<SharedFlightController>,
    gps: Option<SharedGps>,
    feed: Arc<LatestFrame>,
    last_location: SharedLocation,
    stop: StopHandle,
    state: PipelineState,
    stats: PipelineStats,
    fps: FpsCounter,
    video: Option<VideoWriter>,
    frame_counter: u64,
}

impl DetectionPipeline {
    pub fn new(
        options: PipelineOptions,
        detector: Box<dyn DetectorBackend>,
        estimator: SeverityEstimator,
        resolver: LocationResolver,
        store: Box<dyn DetectionStore>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            detector,
            estimator,
            resolver,
            store,
            reporter: None,
            flight_controller: None,
            gps: None,
            feed: Arc::new(LatestFrame::new()),
            last_location: Arc::new(Mutex::new(None)),
            stop: StopHandle::default(),
            state: PipelineState::Idle,
            stats: PipelineStats::default(),
            fps: FpsCounter::default(),
            video: None,
            frame_counter: 0,
        })
    }

    /// Build every component from configuration. Missing model files, an
    /// unreachable aerial telemetry link or an unopenable database fail here.
    pub fn from_config(cfg: &RoadwatchConfig) -> Result<Self> {
        let mut detector = build_detector(&cfg.detection)?;
        detector
            .warm_up()
            .with_context(|| format!("warm up detector '{}'", detector.name()))?;
        let mut estimator = SeverityEstimator::new(cfg.detection.severity);
        if let Some(classifier) = build_classifier(&cfg.detection)? {
            estimator = estimator.with_classifier(classifier);
        }

        let gps = cfg
            .gps
            .enabled
            .then(|| Arc::new(Mutex::new(GpsReceiver::open(cfg.gps.settings.clone()))));

        let flight_controller = match cfg.drone.telemetry.as_deref() {
            Some(connection) => match FlightController::from_connection(connection) {
                Ok(fc) => {
                    log::info!("flight controller: {}", fc.describe());
                    Some(Arc::new(Mutex::new(fc)))
                }
                Err(err) if cfg.drone.aerial => {
                    return Err(err.context("aerial mode needs flight-controller telemetry"))
                }
                Err(err) => {
                    log::warn!("flight controller unavailable: {:#}", err);
                    None
                }
            },
            None => None,
        };

        let ip_geolocator = cfg
            .location
            .ip_fallback
            .then(|| IpGeolocator::new(cfg.location.ip_url.clone(), cfg.location.ip_timeout));
        let resolver = LocationResolver::from_settings(
            &cfg.location_settings(),
            LocationSources {
                flight_controller: flight_controller.clone(),
                gps: gps.clone(),
                ip_geolocator,
            },
        )?;
        log::info!(
            "location chain: {}",
            resolver
                .chain()
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let store = SqliteDetectionStore::open(&cfg.db_path)?;
        let reporter = if cfg.report.enabled {
            Some(RemoteReporter::spawn(&cfg.report)?)
        } else {
            None
        };

        let mut pipeline = Self::new(
            PipelineOptions::from_config(cfg),
            detector,
            estimator,
            resolver,
            Box::new(store),
        )?;
        pipeline.reporter = reporter;
        pipeline.flight_controller = flight_controller;
        pipeline.gps = gps;
        Ok(pipeline)
    }

    pub fn with_reporter(mut self, reporter: RemoteReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Telemetry for ground projection and the HUD.
    pub fn with_flight_controller(mut self, controller: SharedFlightController) -> Self {
        self.flight_controller = Some(controller);
        self
    }

    /// Closed when the pipeline stops.
    pub fn with_gps(mut self, gps: SharedGps) -> Self {
        self.gps = Some(gps);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Latest annotated frame, for the video feed.
    pub fn annotated_feed(&self) -> Arc<LatestFrame> {
        self.feed.clone()
    }

    pub fn last_location(&self) -> SharedLocation {
        self.last_location.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn store(&self) -> &dyn DetectionStore {
        self.store.as_ref()
    }

    /// Capture from `source` until end of stream, stop, max duration or a
    /// capture failure. Cleanup runs on every path.
    pub fn run(&mut self, source: Box<dyn FrameSource>) -> Result<PipelineStats> {
        if self.state == PipelineState::Stopped {
            return Err(anyhow!("pipeline already stopped"));
        }
        let started = Instant::now();
        if let Some(path) = self.options.video_path.clone() {
            match VideoWriter::create(&path) {
                Ok(writer) => self.video = Some(writer),
                Err(err) => {
                    self.finish(started);
                    return Err(err);
                }
            }
        }

        let slot = Arc::new(LatestFrame::new());
        let mut worker = match CaptureWorker::spawn(source, slot.clone()) {
            Ok(worker) => worker,
            Err(err) => {
                log::error!("capture open failed: {:#}", err);
                self.finish(started);
                return Err(err);
            }
        };
        self.state = PipelineState::Streaming;
        log::info!("pipeline streaming (frame_skip={})", self.options.frame_skip);

        let result = self.consume(&slot, started);

        if !worker.stop(DEFAULT_JOIN_TIMEOUT) {
            log::warn!("capture worker detached");
        }
        if let Some(source_stats) = worker.final_stats() {
            log::info!(
                "source {} captured {} frames ({} undecodable)",
                source_stats.source,
                source_stats.frames_captured,
                source_stats.decode_failures
            );
        }
        self.stats.frames_dropped = slot.dropped();
        self.finish(started);
        result.map(|()| self.stats.clone())
    }

    /// Stop without capturing, running the same cleanup as the end of `run`.
    /// Used when the source cannot be opened at all.
    pub fn shutdown(&mut self) -> PipelineStats {
        self.finish(Instant::now());
        self.stats.clone()
    }

    fn consume(&mut self, slot: &LatestFrame, started: Instant) -> Result<()> {
        let mut last_health_log = Instant::now();
        loop {
            if self.stop.is_stopped() {
                log::info!("stop requested");
                return Ok(());
            }
            if let Some(max) = self.options.max_duration {
                if started.elapsed() >= max {
                    log::info!("max duration {:?} reached", max);
                    return Ok(());
                }
            }
            match slot.take_timeout(SLOT_POLL) {
                Ok(frame) => {
                    self.process_frame(frame);
                }
                Err(SlotStatus::Empty) => {}
                Err(SlotStatus::Closed(None)) => {
                    log::info!("end of stream");
                    return Ok(());
                }
                Err(SlotStatus::Closed(Some(reason))) => {
                    return Err(anyhow!("capture failed: {}", reason));
                }
            }
            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "frames={} processed={} detections={} fps={:.1}",
                    self.stats.frames_seen,
                    self.stats.frames_processed,
                    self.stats.detections,
                    self.fps.fps()
                );
                last_health_log = Instant::now();
            }
        }
    }

    /// Run one frame through the pipeline. Frames whose counter is not a
    /// multiple of `frame_skip` pass through unannotated.
    pub fn process_frame(&mut self, frame: Frame) -> FrameOutcome {
        self.frame_counter += 1;
        self.stats.frames_seen += 1;
        let fps = self.fps.tick();

        if self.frame_counter % self.options.frame_skip != 0 {
            self.emit(&frame, &frame.image);
            return FrameOutcome {
                processed: false,
                records: Vec::new(),
                image: frame.image,
            };
        }

        self.state = PipelineState::Detecting;
        self.stats.frames_processed += 1;
        let proposals = match self.detector.detect(&frame) {
            Ok(proposals) => proposals,
            Err(err) => {
                self.stats.detector_failures += 1;
                log::warn!("detector failed on frame {}: {:#}", frame.number, err);
                Vec::new()
            }
        };
        let accepted: Vec<Detection> = non_max_suppression(
            &proposals,
            self.options.confidence_threshold,
            self.options.nms_threshold,
        )
        .into_iter()
        .filter(|d| d.confidence >= self.options.acceptance_confidence)
        .filter_map(|d| {
            let bbox = d.bbox.clamp_to(frame.width(), frame.height())?;
            Some(Detection { bbox, ..d })
        })
        .collect();

        let telemetry = self.current_telemetry();
        let mut annotated = frame.image.clone();
        let mut assessed = Vec::with_capacity(accepted.len());
        for detection in &accepted {
            let assessment = self.estimator.estimate(&frame, &detection.bbox);
            let location = self.locate(&frame, detection, telemetry.as_ref());
            draw_detection(&mut annotated, &detection.bbox, assessment.severity, detection.confidence);
            self.stats.detections += 1;
            *self
                .stats
                .by_severity
                .entry(assessment.severity.as_str().to_string())
                .or_insert(0) += 1;
            *self
                .stats
                .location_sources
                .entry(location.provenance.as_str().to_string())
                .or_insert(0) += 1;
            assessed.push((detection, assessment, location));
        }

        // One snapshot per frame, taken once every accepted box is drawn.
        let image_path = if assessed.is_empty() {
            None
        } else {
            self.snapshot(&frame, &annotated)
        };
        let mut records = Vec::with_capacity(assessed.len());
        for (detection, assessment, location) in assessed {
            let new = NewDetection {
                timestamp: frame.captured_at,
                latitude: location.latitude,
                longitude: location.longitude,
                severity: assessment.severity,
                confidence: detection.confidence,
                class_name: detection.class_name.clone(),
                image_path: image_path.clone(),
                image_base64: None,
                camera_source: self.options.camera_tag.clone(),
                gps_quality: location.metadata.gps_quality,
                location_source: location.provenance,
            };
            if let Some(record) = self.persist(new) {
                log::info!(
                    "detection #{} {} conf={:.2} at ({:.6}, {:.6}) via {}",
                    record.id,
                    record.severity,
                    record.confidence,
                    record.latitude,
                    record.longitude,
                    record.location_source
                );
                self.report(&record);
                records.push(record);
            }
        }

        draw_hud(
            &mut annotated,
            &HudInfo {
                frame_number: frame.number,
                detections: self.stats.detections,
                fps,
                telemetry,
            },
        );
        self.emit(&frame, &annotated);
        self.state = PipelineState::Streaming;
        FrameOutcome {
            processed: true,
            records,
            image: annotated,
        }
    }

    fn current_telemetry(&mut self) -> Option<Telemetry> {
        let controller = self.flight_controller.as_ref()?;
        let mut guard = match controller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get_telemetry()
    }

    /// Ground projection in aerial mode, the resolver chain otherwise (or when
    /// telemetry cannot be projected).
    fn locate(
        &mut self,
        frame: &Frame,
        detection: &Detection,
        telemetry: Option<&Telemetry>,
    ) -> LocationResolution {
        let projected = match (self.options.aerial_fov, telemetry) {
            (Some(fov), Some(t)) if t.can_project() => {
                let (cx, cy) = detection.bbox.center();
                match pixel_to_ground(cx, cy, frame.width(), frame.height(), t, fov) {
                    Ok(point) => Some(LocationResolution {
                        latitude: point.latitude,
                        longitude: point.longitude,
                        provenance: Provenance::FlightController,
                        metadata: LocationMetadata {
                            gps_quality: t.fix_quality.ordinal(),
                            gps_timestamp: Some(t.timestamp),
                            satellites: (t.satellites > 0).then_some(t.satellites),
                            altitude_m: Some(t.altitude_m),
                            heading_deg: Some(t.heading_deg),
                        },
                    }),
                    Err(err) => {
                        log::debug!("ground projection failed: {:#}", err);
                        None
                    }
                }
            }
            (Some(_), _) => {
                log::debug!("aerial telemetry not usable; falling back to location chain");
                None
            }
            _ => None,
        };
        let resolution = projected.unwrap_or_else(|| self.resolver.resolve());

        if resolution.provenance == Provenance::LocalGpsModule {
            self.log_fix(&resolution);
        }
        if let Ok(mut last) = self.last_location.lock() {
            *last = Some(resolution);
        }
        resolution
    }

    fn log_fix(&mut self, resolution: &LocationResolution) {
        let fix = GpsFix {
            latitude: resolution.latitude,
            longitude: resolution.longitude,
            timestamp: resolution.metadata.gps_timestamp.unwrap_or_else(Utc::now),
            quality: FixQuality::from_ordinal(resolution.metadata.gps_quality),
            satellites: resolution.metadata.satellites.unwrap_or(0),
            altitude_m: resolution.metadata.altitude_m,
            hdop: None,
        };
        if let Err(err) = self.store.log_gps_fix(&fix) {
            log::warn!("gps log write failed: {:#}", err);
        }
    }

    fn snapshot(&mut self, frame: &Frame, annotated: &RgbImage) -> Option<String> {
        let dir = self.options.snapshot_dir.as_ref()?;
        match save_snapshot(dir, annotated, frame.captured_at) {
            Ok(path) => {
                self.stats.snapshots += 1;
                Some(path.to_string_lossy().to_string())
            }
            Err(err) => {
                log::warn!("snapshot not saved: {:#}", err);
                None
            }
        }
    }

    fn persist(&mut self, new: NewDetection) -> Option<DetectionRecord> {
        let id = match self.store.add_detection(&new) {
            Ok(id) => id,
            Err(err) => {
                self.stats.persist_failures += 1;
                log::error!("failed to persist detection: {:#}", err);
                return None;
            }
        };
        self.stats.persisted += 1;
        match self.store.get_detection(id) {
            Ok(Some(record)) => Some(record),
            Ok(None) | Err(_) => {
                log::warn!("detection {} stored but could not be read back", id);
                None
            }
        }
    }

    fn report(&mut self, record: &DetectionRecord) {
        let Some(reporter) = self.reporter.as_ref() else {
            return;
        };
        if reporter.submit(ReportPayload::from_record(record)) {
            self.stats.reports_queued += 1;
        } else {
            self.stats.reports_dropped += 1;
        }
    }

    fn emit(&mut self, frame: &Frame, image: &RgbImage) {
        if let Some(writer) = self.video.as_mut() {
            if let Err(err) = writer.write_frame(image) {
                log::error!("video writer disabled: {:#}", err);
                self.video = None;
            }
        }
        self.feed.publish(Frame {
            number: frame.number,
            captured_at: frame.captured_at,
            image: image.clone(),
        });
    }

    fn finish(&mut self, started: Instant) {
        if self.state == PipelineState::Stopped {
            return;
        }
        self.state = PipelineState::Stopped;
        self.feed.close(None);
        if let Some(mut writer) = self.video.take() {
            if let Err(err) = writer.finish() {
                log::warn!("{:#}", err);
            }
        }
        if let Some(gps) = self.gps.as_ref() {
            match gps.lock() {
                Ok(mut receiver) => receiver.close(),
                Err(poisoned) => poisoned.into_inner().close(),
            }
        }
        if let Some(reporter) = self.reporter.take() {
            let report_stats = reporter.shutdown();
            log::info!(
                "reports sent={} failed={} dropped={}",
                report_stats.sent,
                report_stats.failed,
                report_stats.dropped
            );
        }
        let elapsed = started.elapsed().as_secs_f64();
        self.stats.duration_s = elapsed;
        self.stats.average_fps = if elapsed > 0.0 {
            self.stats.frames_seen as f64 / elapsed
        } else {
            0.0
        };
        log::info!(
            "pipeline stopped after {:.1}s: frames={} processed={} dropped={} detections={} persisted={} avg_fps={:.1}",
            self.stats.duration_s,
            self.stats.frames_seen,
            self.stats.frames_processed,
            self.stats.frames_dropped,
            self.stats.detections,
            self.stats.persisted,
            self.stats.average_fps
        );
        for severity in [Severity::High, Severity::Medium, Severity::Low] {
            if let Some(n) = self.stats.by_severity.get(severity.as_str()) {
                log::info!("  {}: {}", severity, n);
            }
        }
        for (provenance, n) in self.resolver.resolution_counts() {
            log::debug!("  location via {}: {}", provenance, n);
        }
    }
}
