//! roadwatch
//!
//! Road-damage (pothole) detection and reporting pipeline.
//!
//! # Architecture
//!
//! Frames flow one way through the crate:
//!
//! 1. **Ingest**: a capture worker reads frames from a camera, drone stream or file
//!    source into a single-slot latest-frame buffer.
//! 2. **Detect**: a detector backend proposes boxes; non-maximum suppression removes
//!    duplicates.
//! 3. **Assess**: each accepted box gets a severity label and score.
//! 4. **Locate**: an ordered chain of location strategies (flight controller, GPS
//!    receiver, cached fix, IP geolocation, static default) produces a coordinate with
//!    provenance. Aerial frames are ground-projected instead.
//! 5. **Persist**: fused records go to the detection store and, optionally, to a remote
//!    reporting endpoint.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: frames, frame sources, capture worker
//! - `detect`, `severity`: detector/classifier interfaces, NMS, severity estimation
//! - `telemetry`, `location`, `geo`: position sources, resolver chain, ground projection
//! - `storage`, `report`: detection store and remote reporting
//! - `annotate`, `output`, `pipeline`: overlay drawing, video output, the frame loop
//! - `api`: HTTP surface for dashboards and citizen reports

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod geo;
pub mod ingest;
pub mod location;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod severity;
pub mod storage;
pub mod telemetry;

pub use detect::{non_max_suppression, BoundingBox, Detection, DetectorBackend};
pub use frame::{Frame, LatestFrame};
pub use geo::{pixel_to_ground, plan_survey, CameraFov, Waypoint};
pub use location::{LocationResolution, LocationResolver, Provenance};
pub use pipeline::{DetectionPipeline, PipelineState, PipelineStats, StopHandle};
pub use severity::{SeverityAssessment, SeverityEstimator, SeverityThresholds};
pub use storage::{
    DetectionRecord, DetectionStore, InMemoryDetectionStore, NewDetection, SqliteDetectionStore,
};
pub use telemetry::{FixQuality, GpsFix, Telemetry};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:roadwatch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Severity --------------------

/// Severity label of a road-damage detection.
///
/// `Unknown` is only produced for empty crops and sorts below `Low`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Unknown => "Unknown",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
        }
    }

    /// Heatmap weight.
    pub fn weight(self) -> u32 {
        match self {
            Severity::Unknown | Severity::Low => 1,
            Severity::Medium => 5,
            Severity::High => 10,
        }
    }

    /// Annotation color (RGB).
    pub fn color(self) -> [u8; 3] {
        match self {
            Severity::Low => [0, 255, 0],
            Severity::Medium => [255, 165, 0],
            Severity::High => [255, 0, 0],
            Severity::Unknown => [255, 255, 255],
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "unknown" => Ok(Severity::Unknown),
            other => Err(anyhow!("unknown severity '{}'", other)),
        }
    }
}

// -------------------- Repair Status --------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Rejected,
}

impl RepairStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairStatus::Pending => "pending",
            RepairStatus::InProgress => "in_progress",
            RepairStatus::Completed => "completed",
            RepairStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepairStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RepairStatus::Pending),
            "in_progress" => Ok(RepairStatus::InProgress),
            "completed" => Ok(RepairStatus::Completed),
            "rejected" => Ok(RepairStatus::Rejected),
            other => Err(anyhow!(
                "unknown repair status '{}'; expected pending, in_progress, completed or rejected",
                other
            )),
        }
    }
}

// -------------------- Geography --------------------

/// WGS84 coordinate in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
    }
}

/// Rectangular latitude/longitude bounds (inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl GeoBounds {
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Result<Self> {
        if lat_min > lat_max || lon_min > lon_max {
            return Err(anyhow!(
                "bounds must satisfy lat_min <= lat_max and lon_min <= lon_max"
            ));
        }
        Ok(Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        })
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }
}

// -------------------- Camera Tags --------------------

/// Camera/source tags are short local identifiers stored with every record.
///
/// Allowed: "main_camera", "drone:survey-1", "citizen_app"
pub fn validate_camera_tag(tag: &str) -> Result<()> {
    let re = regex::Regex::new(r"^[a-z0-9_:-]{1,64}$")?;
    if !re.is_match(tag) {
        return Err(anyhow!(
            "camera tag '{}' must match ^[a-z0-9_:-]{{1,64}}$",
            tag
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_high() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::Unknown < Severity::Low);
    }

    #[test]
    fn severity_weights_match_heatmap_scale() {
        let weights: Vec<u32> = [Severity::Low, Severity::Medium, Severity::High]
            .iter()
            .map(|s| s.weight())
            .collect();
        assert_eq!(weights, vec![1, 5, 10]);
    }

    #[test]
    fn repair_status_parses_wire_names() {
        assert_eq!(
            "in_progress".parse::<RepairStatus>().unwrap(),
            RepairStatus::InProgress
        );
        assert!("fixed".parse::<RepairStatus>().is_err());
    }

    #[test]
    fn camera_tags_are_allowlisted() {
        assert!(validate_camera_tag("drone:survey-1").is_ok());
        assert!(validate_camera_tag("Main Camera").is_err());
        assert!(validate_camera_tag("").is_err());
    }

    #[test]
    fn bounds_reject_inverted_ranges() {
        assert!(GeoBounds::new(18.0, 17.0, 75.0, 76.0).is_err());
        let b = GeoBounds::new(17.0, 18.0, 75.0, 76.0).unwrap();
        assert!(b.contains(17.5, 75.5));
        assert!(!b.contains(19.0, 75.5));
    }
}
