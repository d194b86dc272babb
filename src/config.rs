use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geo::{CameraFov, DEFAULT_FOV_HORIZONTAL_DEG, DEFAULT_FOV_VERTICAL_DEG};
use crate::location::{LocationSettings, Provenance, DEFAULT_LATITUDE, DEFAULT_LONGITUDE};
use crate::severity::{SeverityThresholds, DEFAULT_LOW_THRESHOLD, DEFAULT_MEDIUM_THRESHOLD};
use crate::telemetry::gps::{
    GpsSettings, DEFAULT_GPS_BAUD, DEFAULT_GPS_MAX_RETRIES, DEFAULT_GPS_MIN_SATELLITES,
    DEFAULT_GPS_PORT,
};
use crate::telemetry::ipgeo::DEFAULT_IPGEO_URL;
use crate::telemetry::mavlink::DEFAULT_CONNECTION as DEFAULT_MAVLINK_CONNECTION;
use crate::telemetry::FixQuality;
use crate::GeoPoint;

const DEFAULT_DB_PATH: &str = "roadwatch.db";
const DEFAULT_DETECTIONS_DIR: &str = "detections";
const DEFAULT_CAMERA_TAG: &str = "main_camera";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_SOURCE_URL: &str = "stub://road_camera";
const DEFAULT_SOURCE_FPS: u32 = 15;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_BACKEND: &str = "cpu";
const DEFAULT_INPUT_SIZE: u32 = 416;
const DEFAULT_CLASSIFIER_INPUT_SIZE: u32 = 224;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_NMS_THRESHOLD: f32 = 0.4;
const DEFAULT_ACCEPTANCE_CONFIDENCE: f32 = 0.6;
const DEFAULT_FRAME_SKIP: u64 = 2;
const DEFAULT_GPS_TIMEOUT_MS: u64 = 1000;
const DEFAULT_GPS_MIN_QUALITY: u8 = 1;
const DEFAULT_REPORT_URL: &str = "http://localhost:5000/api/report";
const DEFAULT_REPORT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REPORT_QUEUE: usize = 32;
const DEFAULT_IPGEO_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Deserialize, Default)]
struct RoadwatchConfigFile {
    db_path: Option<String>,
    detections_dir: Option<PathBuf>,
    camera_tag: Option<String>,
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    detection: Option<DetectionConfigFile>,
    gps: Option<GpsConfigFile>,
    location: Option<LocationConfigFile>,
    drone: Option<DroneConfigFile>,
    report: Option<ReportConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    classifier_path: Option<PathBuf>,
    class_names: Option<Vec<String>>,
    input_size: Option<u32>,
    classifier_input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    acceptance_confidence: Option<f32>,
    frame_skip: Option<u64>,
    severity_low: Option<f64>,
    severity_medium: Option<f64>,
    save_snapshots: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct GpsConfigFile {
    enabled: Option<bool>,
    port: Option<String>,
    baud: Option<u32>,
    timeout_ms: Option<u64>,
    max_retries: Option<usize>,
    min_satellites: Option<u32>,
    min_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct LocationConfigFile {
    priority: Option<Vec<String>>,
    use_cached_if_no_fix: Option<bool>,
    ip_fallback: Option<bool>,
    ip_url: Option<String>,
    ip_timeout_ms: Option<u64>,
    default_latitude: Option<f64>,
    default_longitude: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DroneConfigFile {
    aerial: Option<bool>,
    telemetry: Option<String>,
    fov_horizontal: Option<f64>,
    fov_vertical: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportConfigFile {
    enabled: Option<bool>,
    url: Option<String>,
    timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    include_image: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    video_path: Option<PathBuf>,
    max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub db_path: String,
    pub detections_dir: PathBuf,
    pub camera_tag: String,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub source: SourceSettings,
    pub detection: DetectionSettings,
    pub gps: GpsConfig,
    pub location: LocationConfig,
    pub drone: DroneSettings,
    pub report: ReportSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub classifier_path: Option<PathBuf>,
    pub class_names: Vec<String>,
    pub input_size: u32,
    pub classifier_input_size: u32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub acceptance_confidence: f32,
    pub frame_skip: u64,
    pub severity: SeverityThresholds,
    pub save_snapshots: bool,
}

#[derive(Debug, Clone)]
pub struct GpsConfig {
    pub enabled: bool,
    pub settings: GpsSettings,
    pub min_quality: FixQuality,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub priority: Vec<Provenance>,
    pub use_cached_if_no_fix: bool,
    pub ip_fallback: bool,
    pub ip_url: String,
    pub ip_timeout: Duration,
    pub default_point: GeoPoint,
}

#[derive(Debug, Clone)]
pub struct DroneSettings {
    pub aerial: bool,
    pub telemetry: Option<String>,
    pub fov: CameraFov,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub enabled: bool,
    pub url: String,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub include_image: bool,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub video_path: Option<PathBuf>,
    pub max_duration: Option<Duration>,
}

impl RoadwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults, no file and no environment.
    pub fn defaults() -> Result<Self> {
        let mut cfg = Self::from_file(RoadwatchConfigFile::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let detections_dir = file
            .detections_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DETECTIONS_DIR));
        let camera_tag = file
            .camera_tag
            .unwrap_or_else(|| DEFAULT_CAMERA_TAG.to_string());
        let api = file.api.unwrap_or_default();
        let api_addr = api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_token_path = api.token_path;

        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: source_file
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source_file.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source_file.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source_file.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
        };

        let det = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            backend: det.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: det.model_path,
            classifier_path: det.classifier_path,
            class_names: det
                .class_names
                .unwrap_or_else(|| vec![crate::detect::DEFAULT_CLASS_NAME.to_string()]),
            input_size: det.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            classifier_input_size: det
                .classifier_input_size
                .unwrap_or(DEFAULT_CLASSIFIER_INPUT_SIZE),
            confidence_threshold: det
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            nms_threshold: det.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
            acceptance_confidence: det
                .acceptance_confidence
                .unwrap_or(DEFAULT_ACCEPTANCE_CONFIDENCE),
            frame_skip: det.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
            severity: SeverityThresholds {
                low: det.severity_low.unwrap_or(DEFAULT_LOW_THRESHOLD),
                medium: det.severity_medium.unwrap_or(DEFAULT_MEDIUM_THRESHOLD),
            },
            save_snapshots: det.save_snapshots.unwrap_or(true),
        };

        let gps_file = file.gps.unwrap_or_default();
        let gps = GpsConfig {
            enabled: gps_file.enabled.unwrap_or(false),
            settings: GpsSettings {
                port: gps_file
                    .port
                    .unwrap_or_else(|| DEFAULT_GPS_PORT.to_string()),
                baud: gps_file.baud.unwrap_or(DEFAULT_GPS_BAUD),
                timeout: Duration::from_millis(
                    gps_file.timeout_ms.unwrap_or(DEFAULT_GPS_TIMEOUT_MS),
                ),
                max_retries: gps_file.max_retries.unwrap_or(DEFAULT_GPS_MAX_RETRIES),
                min_satellites: gps_file
                    .min_satellites
                    .unwrap_or(DEFAULT_GPS_MIN_SATELLITES),
            },
            min_quality: FixQuality::from_ordinal(
                gps_file.min_quality.unwrap_or(DEFAULT_GPS_MIN_QUALITY),
            ),
        };

        let loc = file.location.unwrap_or_default();
        let priority = match loc.priority {
            Some(names) => names
                .iter()
                .map(|name| name.parse::<Provenance>())
                .collect::<Result<Vec<_>>>()?,
            None => Provenance::default_priority(),
        };
        let location = LocationConfig {
            priority,
            use_cached_if_no_fix: loc.use_cached_if_no_fix.unwrap_or(true),
            ip_fallback: loc.ip_fallback.unwrap_or(true),
            ip_url: loc.ip_url.unwrap_or_else(|| DEFAULT_IPGEO_URL.to_string()),
            ip_timeout: Duration::from_millis(loc.ip_timeout_ms.unwrap_or(DEFAULT_IPGEO_TIMEOUT_MS)),
            default_point: GeoPoint::new(
                loc.default_latitude.unwrap_or(DEFAULT_LATITUDE),
                loc.default_longitude.unwrap_or(DEFAULT_LONGITUDE),
            ),
        };

        let drone_file = file.drone.unwrap_or_default();
        let drone = DroneSettings {
            aerial: drone_file.aerial.unwrap_or(false),
            telemetry: drone_file.telemetry,
            fov: CameraFov {
                horizontal_deg: drone_file
                    .fov_horizontal
                    .unwrap_or(DEFAULT_FOV_HORIZONTAL_DEG),
                vertical_deg: drone_file.fov_vertical.unwrap_or(DEFAULT_FOV_VERTICAL_DEG),
            },
        };

        let report_file = file.report.unwrap_or_default();
        let report = ReportSettings {
            enabled: report_file.enabled.unwrap_or(false),
            url: report_file
                .url
                .unwrap_or_else(|| DEFAULT_REPORT_URL.to_string()),
            timeout: Duration::from_secs(
                report_file
                    .timeout_secs
                    .unwrap_or(DEFAULT_REPORT_TIMEOUT_SECS),
            ),
            queue_capacity: report_file.queue_capacity.unwrap_or(DEFAULT_REPORT_QUEUE),
            include_image: report_file.include_image.unwrap_or(false),
        };

        let output_file = file.output.unwrap_or_default();
        let output = OutputSettings {
            video_path: output_file.video_path,
            max_duration: output_file.max_duration_secs.map(Duration::from_secs),
        };

        Ok(Self {
            db_path,
            detections_dir,
            camera_tag,
            api_addr,
            api_token_path,
            source,
            detection,
            gps,
            location,
            drone,
            report,
            output,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_non_empty("ROADWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = env_non_empty("ROADWATCH_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(addr) = env_non_empty("ROADWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = env_non_empty("ROADWATCH_API_TOKEN_PATH") {
            self.api_token_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_non_empty("ROADWATCH_REPORT_URL") {
            self.report.url = url;
            self.report.enabled = true;
        }
        if let Some(port) = env_non_empty("ROADWATCH_GPS_PORT") {
            self.gps.settings.port = port;
            self.gps.enabled = true;
        }
        if let Some(skip) = env_non_empty("ROADWATCH_FRAME_SKIP") {
            self.detection.frame_skip = skip
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_FRAME_SKIP must be a positive integer"))?;
        }
        if let Some(aerial) = env_non_empty("ROADWATCH_AERIAL") {
            self.drone.aerial = parse_bool(&aerial)
                .ok_or_else(|| anyhow!("ROADWATCH_AERIAL must be true/false/1/0"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        crate::validate_camera_tag(&self.camera_tag)?;
        if self.detection.frame_skip == 0 {
            return Err(anyhow!("frame_skip must be at least 1"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detection.confidence_threshold),
            ("nms_threshold", self.detection.nms_threshold),
            ("acceptance_confidence", self.detection.acceptance_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1] (got {})", name, value));
            }
        }
        self.detection.severity =
            SeverityThresholds::new(self.detection.severity.low, self.detection.severity.medium)?;
        self.drone.fov = CameraFov::new(self.drone.fov.horizontal_deg, self.drone.fov.vertical_deg)?;
        if self.drone.aerial && self.drone.telemetry.is_none() {
            self.drone.telemetry = Some(DEFAULT_MAVLINK_CONNECTION.to_string());
        }
        if self.location.priority.contains(&Provenance::Default) {
            return Err(anyhow!(
                "'default' is always the last location source and cannot be listed in priority"
            ));
        }
        let mut seen = Vec::new();
        for p in &self.location.priority {
            if seen.contains(p) {
                return Err(anyhow!("location source '{}' listed twice", p));
            }
            seen.push(*p);
        }
        if !self.location.default_point.is_valid() {
            return Err(anyhow!("default latitude/longitude out of range"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if self.report.queue_capacity == 0 {
            return Err(anyhow!("report queue capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn location_settings(&self) -> LocationSettings {
        LocationSettings {
            priority: self.location.priority.clone(),
            min_quality: self.gps.min_quality,
            min_satellites: self.gps.settings.min_satellites,
            use_cached_if_no_fix: self.location.use_cached_if_no_fix,
            ip_fallback: self.location.ip_fallback,
            default_point: self.location.default_point,
        }
    }
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RoadwatchConfig::defaults().unwrap();
        assert_eq!(cfg.detection.frame_skip, 2);
        assert_eq!(cfg.detection.confidence_threshold, 0.5);
        assert_eq!(cfg.detection.nms_threshold, 0.4);
        assert_eq!(cfg.detection.acceptance_confidence, 0.6);
        assert_eq!(cfg.location.priority, Provenance::default_priority());
        assert!(!cfg.gps.enabled);
        assert!(!cfg.report.enabled);
    }

    #[test]
    fn zero_frame_skip_is_rejected() {
        let mut cfg = RoadwatchConfig::defaults().unwrap();
        cfg.detection.frame_skip = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_cannot_be_prioritised() {
        let mut cfg = RoadwatchConfig::defaults().unwrap();
        cfg.location.priority.push(Provenance::Default);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
