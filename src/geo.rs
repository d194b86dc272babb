//! Ground projection for aerial frames and survey-grid planning.
//!
//! Flat-earth model: the camera looks straight down, the footprint is
//! `2·alt·tan(fov/2)` on each axis, and meter offsets are converted to degrees with
//! 111 320 m per degree of latitude and `111 320·cos(lat)` per degree of longitude.

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::telemetry::Telemetry;
use crate::GeoPoint;

pub const METERS_PER_DEGREE: f64 = 111_320.0;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_FOV_HORIZONTAL_DEG: f64 = 90.0;
pub const DEFAULT_FOV_VERTICAL_DEG: f64 = 60.0;
pub const DEFAULT_SURVEY_ALTITUDE_M: f64 = 50.0;
pub const DEFAULT_SURVEY_OVERLAP_PCT: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraFov {
    pub horizontal_deg: f64,
    pub vertical_deg: f64,
}

impl Default for CameraFov {
    fn default() -> Self {
        Self {
            horizontal_deg: DEFAULT_FOV_HORIZONTAL_DEG,
            vertical_deg: DEFAULT_FOV_VERTICAL_DEG,
        }
    }
}

impl CameraFov {
    pub fn new(horizontal_deg: f64, vertical_deg: f64) -> Result<Self> {
        for (axis, fov) in [("horizontal", horizontal_deg), ("vertical", vertical_deg)] {
            if !(fov > 0.0 && fov < 180.0) {
                return Err(anyhow!("{} fov must be in (0, 180) degrees, got {}", axis, fov));
            }
        }
        Ok(Self {
            horizontal_deg,
            vertical_deg,
        })
    }
}

/// Ground footprint `(width_m, height_m)` at `altitude_m`.
pub fn ground_coverage(altitude_m: f64, fov: CameraFov) -> (f64, f64) {
    let width = 2.0 * altitude_m * (fov.horizontal_deg.to_radians() / 2.0).tan();
    let height = 2.0 * altitude_m * (fov.vertical_deg.to_radians() / 2.0).tan();
    (width, height)
}

/// Shift `origin` by east/north meter offsets.
pub fn offset_meters(origin: GeoPoint, east_m: f64, north_m: f64) -> GeoPoint {
    let dlat = north_m / METERS_PER_DEGREE;
    let dlon = east_m / (METERS_PER_DEGREE * origin.latitude.to_radians().cos());
    GeoPoint::new(origin.latitude + dlat, origin.longitude + dlon)
}

/// Project pixel `(px, py)` of a nadir frame onto the ground.
///
/// Image x grows east and image y grows north before the heading rotation, so the
/// frame center always maps to the vehicle position.
pub fn pixel_to_ground(
    px: f64,
    py: f64,
    frame_width: u32,
    frame_height: u32,
    telemetry: &Telemetry,
    fov: CameraFov,
) -> Result<GeoPoint> {
    if telemetry.altitude_m <= 0.0 || !telemetry.altitude_m.is_finite() {
        return Err(anyhow!(
            "ground projection needs altitude > 0 (got {})",
            telemetry.altitude_m
        ));
    }
    if frame_width == 0 || frame_height == 0 {
        return Err(anyhow!("ground projection needs non-empty frame dimensions"));
    }

    let nx = px / frame_width as f64 - 0.5;
    let ny = py / frame_height as f64 - 0.5;
    let (cover_w, cover_h) = ground_coverage(telemetry.altitude_m, fov);
    let x = nx * cover_w;
    let y = ny * cover_h;

    let theta = telemetry.heading_deg.to_radians();
    let xr = x * theta.cos() - y * theta.sin();
    let yr = x * theta.sin() + y * theta.cos();

    Ok(offset_meters(
        GeoPoint::new(telemetry.latitude, telemetry.longitude),
        xr,
        yr,
    ))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Waypoint {
    pub index: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
}

/// Upper bound on the waypoints in one plan.
pub const MAX_SURVEY_WAYPOINTS: usize = 100_000;

/// Lawnmower survey over an `area_width_m` (east) × `area_length_m` (north) rectangle
/// whose south-west corner is `start`.
///
/// Spacing per axis is `coverage · (1 − overlap/100)` and the pass count is
/// `floor(extent / spacing) + 1`. Even rows run west to east, odd rows east to west.
pub fn plan_survey(
    start: GeoPoint,
    area_width_m: f64,
    area_length_m: f64,
    altitude_m: f64,
    overlap_pct: f64,
    fov: CameraFov,
) -> Result<Vec<Waypoint>> {
    if !(altitude_m.is_finite() && altitude_m > 0.0) {
        return Err(anyhow!("survey altitude must be > 0 (got {})", altitude_m));
    }
    if !(0.0..100.0).contains(&overlap_pct) {
        return Err(anyhow!(
            "survey overlap must be in [0, 100) percent (got {})",
            overlap_pct
        ));
    }
    for (name, extent) in [("width", area_width_m), ("length", area_length_m)] {
        if !(extent.is_finite() && extent >= 0.0) {
            return Err(anyhow!(
                "survey area {} must be a finite, non-negative number of meters (got {})",
                name,
                extent
            ));
        }
    }

    let (cover_w, cover_h) = ground_coverage(altitude_m, fov);
    let spacing_x = cover_w * (1.0 - overlap_pct / 100.0);
    let spacing_y = cover_h * (1.0 - overlap_pct / 100.0);
    let cols = (area_width_m / spacing_x).floor() + 1.0;
    let rows = (area_length_m / spacing_y).floor() + 1.0;
    if !(cols * rows <= MAX_SURVEY_WAYPOINTS as f64) {
        return Err(anyhow!(
            "survey of {} x {} m at {} m needs {} x {} passes; the limit is {} waypoints",
            area_width_m,
            area_length_m,
            altitude_m,
            cols,
            rows,
            MAX_SURVEY_WAYPOINTS
        ));
    }
    let (cols, rows) = (cols as usize, rows as usize);

    let mut waypoints = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for step in 0..cols {
            let col = if row % 2 == 0 { step } else { cols - 1 - step };
            let point = offset_meters(start, col as f64 * spacing_x, row as f64 * spacing_y);
            waypoints.push(Waypoint {
                index: waypoints.len(),
                latitude: point.latitude,
                longitude: point.longitude,
                altitude_m,
            });
        }
    }
    Ok(waypoints)
}

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drone(heading: f64) -> Telemetry {
        Telemetry {
            latitude: 17.6599,
            longitude: 75.9064,
            altitude_m: 50.0,
            heading_deg: heading,
            ..Telemetry::default()
        }
    }

    #[test]
    fn coverage_at_fifty_meters() {
        let (w, h) = ground_coverage(50.0, CameraFov::default());
        assert!((w - 100.0).abs() < 1e-9);
        assert!((h - 57.735).abs() < 1e-3);
    }

    #[test]
    fn frame_center_maps_to_vehicle() {
        let p = pixel_to_ground(320.0, 240.0, 640, 480, &drone(0.0), CameraFov::default()).unwrap();
        assert!((p.latitude - 17.6599).abs() < 1e-12);
        assert!((p.longitude - 75.9064).abs() < 1e-12);
    }

    #[test]
    fn right_edge_is_half_coverage_east_at_heading_zero() {
        let t = drone(0.0);
        let p = pixel_to_ground(640.0, 240.0, 640, 480, &t, CameraFov::default()).unwrap();
        let east = haversine_m(GeoPoint::new(t.latitude, t.longitude), p);
        assert!((east - 50.0).abs() < 0.5, "east offset {}", east);
        assert!(p.longitude > t.longitude);
    }

    #[test]
    fn heading_ninety_rotates_east_offset_north() {
        let t = drone(90.0);
        let p = pixel_to_ground(640.0, 240.0, 640, 480, &t, CameraFov::default()).unwrap();
        assert!(p.latitude > t.latitude);
        assert!((p.longitude - t.longitude).abs() < 1e-9);
    }

    #[test]
    fn zero_altitude_is_rejected() {
        let mut t = drone(0.0);
        t.altitude_m = 0.0;
        assert!(pixel_to_ground(1.0, 1.0, 10, 10, &t, CameraFov::default()).is_err());
    }

    #[test]
    fn survey_grid_is_boustrophedon() {
        let start = GeoPoint::new(17.6599, 75.9064);
        // spacing_x = 100 * 0.7 = 70 m -> 200/70 -> 2 + 1 = 3 columns
        // spacing_y = 57.735 * 0.7 = 40.41 m -> 100/40.41 -> 2 + 1 = 3 rows
        let wps = plan_survey(start, 200.0, 100.0, 50.0, 30.0, CameraFov::default()).unwrap();
        assert_eq!(wps.len(), 9);
        assert!(wps[0].longitude < wps[1].longitude);
        assert!(wps[3].longitude > wps[4].longitude);
        assert!((wps[2].longitude - wps[3].longitude).abs() < 1e-12);
        assert!(wps.iter().all(|w| w.altitude_m == 50.0));
        assert_eq!(wps[8].index, 8);
    }

    #[test]
    fn survey_rejects_full_overlap() {
        let start = GeoPoint::new(0.0, 0.0);
        assert!(plan_survey(start, 10.0, 10.0, 50.0, 100.0, CameraFov::default()).is_err());
        assert!(plan_survey(start, 10.0, 10.0, 0.0, 30.0, CameraFov::default()).is_err());
    }

    #[test]
    fn survey_rejects_unbounded_areas() {
        let start = GeoPoint::new(17.0, 75.0);
        let fov = CameraFov::default();
        assert!(plan_survey(start, f64::INFINITY, 10.0, 50.0, 30.0, fov).is_err());
        assert!(plan_survey(start, 10.0, f64::NAN, 50.0, 30.0, fov).is_err());
        assert!(plan_survey(start, 10.0, 10.0, f64::INFINITY, 30.0, fov).is_err());
        let err = plan_survey(start, 1.0e12, 1.0e12, 50.0, 30.0, fov).unwrap_err();
        assert!(err.to_string().contains("waypoints"));
        // 6.95 km x 4 km at 50 m: 100 x 99 passes, under the cap
        assert_eq!(plan_survey(start, 6950.0, 4000.0, 50.0, 30.0, fov).unwrap().len(), 100 * 99);
    }

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_m(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 50.0);
    }
}
