//! Best-effort location for a detection.
//!
//! `LocationResolver` walks an ordered list of `LocationStrategy` values and returns
//! the first coordinate one of them produces. The static default is always the last
//! step, so `resolve` is total. Sources are shared handles because the pipeline HUD
//! and diagnostics read the same receiver and flight controller.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::telemetry::{FixQuality, FlightController, GpsReceiver, IpGeolocator};
use crate::GeoPoint;

pub type SharedGps = Arc<Mutex<GpsReceiver>>;
pub type SharedFlightController = Arc<Mutex<FlightController>>;

pub const DEFAULT_LATITUDE: f64 = 17.6599;
pub const DEFAULT_LONGITUDE: f64 = 75.9064;

/// Which source produced a resolved coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    FlightController,
    LocalGpsModule,
    CachedGps,
    IpGeolocation,
    Default,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::FlightController => "flight_controller",
            Provenance::LocalGpsModule => "local_gps_module",
            Provenance::CachedGps => "cached_gps",
            Provenance::IpGeolocation => "ip_geolocation",
            Provenance::Default => "default",
        }
    }

    /// Resolution order used when nothing is configured.
    pub fn default_priority() -> Vec<Provenance> {
        vec![
            Provenance::FlightController,
            Provenance::LocalGpsModule,
            Provenance::CachedGps,
            Provenance::IpGeolocation,
        ]
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "flight_controller" => Ok(Provenance::FlightController),
            "local_gps_module" => Ok(Provenance::LocalGpsModule),
            "cached_gps" => Ok(Provenance::CachedGps),
            "ip_geolocation" => Ok(Provenance::IpGeolocation),
            "default" => Ok(Provenance::Default),
            other => Err(anyhow!("unknown location source '{}'", other)),
        }
    }
}

/// Quality details copied from the winning source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationMetadata {
    pub gps_quality: u8,
    pub gps_timestamp: Option<DateTime<Utc>>,
    pub satellites: Option<u32>,
    pub altitude_m: Option<f64>,
    pub heading_deg: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationResolution {
    pub latitude: f64,
    pub longitude: f64,
    pub provenance: Provenance,
    pub metadata: LocationMetadata,
}

impl LocationResolution {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// One step of the resolution chain.
///
/// Implementations own their I/O failures: they log and return `None`.
pub trait LocationStrategy: Send {
    fn provenance(&self) -> Provenance;

    fn try_resolve(&mut self) -> Option<LocationResolution>;
}

fn lock<T>(handle: &Mutex<T>) -> MutexGuard<'_, T> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct FlightControllerStrategy {
    controller: SharedFlightController,
}

impl FlightControllerStrategy {
    pub fn new(controller: SharedFlightController) -> Self {
        Self { controller }
    }
}

impl LocationStrategy for FlightControllerStrategy {
    fn provenance(&self) -> Provenance {
        Provenance::FlightController
    }

    fn try_resolve(&mut self) -> Option<LocationResolution> {
        let telemetry = lock(&self.controller).get_telemetry()?;
        if !telemetry.has_position() {
            log::debug!(
                "flight controller position ({:.4}, {:.4}) not initialised",
                telemetry.latitude,
                telemetry.longitude
            );
            return None;
        }
        Some(LocationResolution {
            latitude: telemetry.latitude,
            longitude: telemetry.longitude,
            provenance: Provenance::FlightController,
            metadata: LocationMetadata {
                gps_quality: telemetry.fix_quality.ordinal(),
                gps_timestamp: Some(telemetry.timestamp),
                satellites: (telemetry.satellites > 0).then_some(telemetry.satellites),
                altitude_m: Some(telemetry.altitude_m),
                heading_deg: Some(telemetry.heading_deg),
            },
        })
    }
}

pub struct LocalGpsStrategy {
    gps: SharedGps,
    min_quality: FixQuality,
    min_satellites: u32,
}

impl LocalGpsStrategy {
    pub fn new(gps: SharedGps, min_quality: FixQuality, min_satellites: u32) -> Self {
        Self {
            gps,
            min_quality,
            min_satellites,
        }
    }
}

impl LocationStrategy for LocalGpsStrategy {
    fn provenance(&self) -> Provenance {
        Provenance::LocalGpsModule
    }

    fn try_resolve(&mut self) -> Option<LocationResolution> {
        let fix = lock(&self.gps).poll_fix()?;
        if fix.quality < self.min_quality || fix.satellites < self.min_satellites {
            log::debug!(
                "gps fix below minimum (quality {} < {} or sats {} < {})",
                fix.quality.ordinal(),
                self.min_quality.ordinal(),
                fix.satellites,
                self.min_satellites
            );
            return None;
        }
        Some(LocationResolution {
            latitude: fix.latitude,
            longitude: fix.longitude,
            provenance: Provenance::LocalGpsModule,
            metadata: LocationMetadata {
                gps_quality: fix.quality.ordinal(),
                gps_timestamp: Some(fix.timestamp),
                satellites: Some(fix.satellites),
                altitude_m: fix.altitude_m,
                heading_deg: None,
            },
        })
    }
}

/// Last known good GPS fix, reported with quality 0.
pub struct CachedGpsStrategy {
    gps: SharedGps,
}

impl CachedGpsStrategy {
    pub fn new(gps: SharedGps) -> Self {
        Self { gps }
    }
}

impl LocationStrategy for CachedGpsStrategy {
    fn provenance(&self) -> Provenance {
        Provenance::CachedGps
    }

    fn try_resolve(&mut self) -> Option<LocationResolution> {
        let fix = lock(&self.gps).get_cached_coordinates()?;
        Some(LocationResolution {
            latitude: fix.latitude,
            longitude: fix.longitude,
            provenance: Provenance::CachedGps,
            metadata: LocationMetadata {
                gps_quality: 0,
                gps_timestamp: Some(fix.timestamp),
                satellites: Some(fix.satellites),
                altitude_m: fix.altitude_m,
                heading_deg: None,
            },
        })
    }
}

pub struct IpGeolocationStrategy {
    geolocator: IpGeolocator,
}

impl IpGeolocationStrategy {
    pub fn new(geolocator: IpGeolocator) -> Self {
        Self { geolocator }
    }
}

impl LocationStrategy for IpGeolocationStrategy {
    fn provenance(&self) -> Provenance {
        Provenance::IpGeolocation
    }

    fn try_resolve(&mut self) -> Option<LocationResolution> {
        let point = self.geolocator.resolve()?;
        Some(LocationResolution {
            latitude: point.latitude,
            longitude: point.longitude,
            provenance: Provenance::IpGeolocation,
            metadata: LocationMetadata::default(),
        })
    }
}

/// Resolver knobs, usually built from `RoadwatchConfig`.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationSettings {
    pub priority: Vec<Provenance>,
    pub min_quality: FixQuality,
    pub min_satellites: u32,
    pub use_cached_if_no_fix: bool,
    pub ip_fallback: bool,
    pub default_point: GeoPoint,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            priority: Provenance::default_priority(),
            min_quality: FixQuality::Gps,
            min_satellites: crate::telemetry::gps::DEFAULT_GPS_MIN_SATELLITES,
            use_cached_if_no_fix: true,
            ip_fallback: true,
            default_point: GeoPoint::new(DEFAULT_LATITUDE, DEFAULT_LONGITUDE),
        }
    }
}

/// Source handles available to the resolver. Absent sources are skipped.
#[derive(Default)]
pub struct LocationSources {
    pub flight_controller: Option<SharedFlightController>,
    pub gps: Option<SharedGps>,
    pub ip_geolocator: Option<IpGeolocator>,
}

pub struct LocationResolver {
    strategies: Vec<Box<dyn LocationStrategy>>,
    default_point: GeoPoint,
    resolutions: BTreeMap<Provenance, u64>,
}

impl LocationResolver {
    /// Resolver that only knows the static default.
    pub fn new(default_point: GeoPoint) -> Self {
        Self {
            strategies: Vec::new(),
            default_point,
            resolutions: BTreeMap::new(),
        }
    }

    /// Build the chain in `settings.priority` order from whatever sources exist.
    pub fn from_settings(settings: &LocationSettings, mut sources: LocationSources) -> Result<Self> {
        if !settings.default_point.is_valid() {
            return Err(anyhow!(
                "default location ({}, {}) is not a valid coordinate",
                settings.default_point.latitude,
                settings.default_point.longitude
            ));
        }
        let mut resolver = Self::new(settings.default_point);
        for provenance in &settings.priority {
            match provenance {
                Provenance::FlightController => match sources.flight_controller.clone() {
                    Some(fc) => resolver.push(FlightControllerStrategy::new(fc)),
                    None => log::debug!("no flight controller configured; skipping"),
                },
                Provenance::LocalGpsModule => match sources.gps.clone() {
                    Some(gps) => resolver.push(LocalGpsStrategy::new(
                        gps,
                        settings.min_quality,
                        settings.min_satellites,
                    )),
                    None => log::debug!("no gps receiver configured; skipping"),
                },
                Provenance::CachedGps => match (&sources.gps, settings.use_cached_if_no_fix) {
                    (Some(gps), true) => resolver.push(CachedGpsStrategy::new(gps.clone())),
                    _ => log::debug!("cached gps fallback disabled; skipping"),
                },
                Provenance::IpGeolocation => {
                    match (sources.ip_geolocator.take(), settings.ip_fallback) {
                        (Some(geo), true) => resolver.push(IpGeolocationStrategy::new(geo)),
                        _ => log::debug!("ip geolocation disabled; skipping"),
                    }
                }
                Provenance::Default => {}
            }
        }
        Ok(resolver)
    }

    pub fn push<S: LocationStrategy + 'static>(&mut self, strategy: S) {
        self.strategies.push(Box::new(strategy));
    }

    /// Order in which sources are tried, ending with the default.
    pub fn chain(&self) -> Vec<Provenance> {
        self.strategies
            .iter()
            .map(|s| s.provenance())
            .chain(std::iter::once(Provenance::Default))
            .collect()
    }

    pub fn resolve(&mut self) -> LocationResolution {
        let resolution = self
            .strategies
            .iter_mut()
            .find_map(|strategy| strategy.try_resolve())
            .unwrap_or(LocationResolution {
                latitude: self.default_point.latitude,
                longitude: self.default_point.longitude,
                provenance: Provenance::Default,
                metadata: LocationMetadata::default(),
            });
        *self.resolutions.entry(resolution.provenance).or_insert(0) += 1;
        if resolution.provenance == Provenance::Default {
            log::warn!("no location source available; using static default");
        }
        resolution
    }

    /// How often each source won so far.
    pub fn resolution_counts(&self) -> &BTreeMap<Provenance, u64> {
        &self.resolutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::gps::GpsSettings;
    use crate::telemetry::nmea::with_checksum;
    use crate::telemetry::Telemetry;
    use std::io::Cursor;

    struct Scripted(Provenance, Option<GeoPoint>);

    impl LocationStrategy for Scripted {
        fn provenance(&self) -> Provenance {
            self.0
        }

        fn try_resolve(&mut self) -> Option<LocationResolution> {
            self.1.map(|p| LocationResolution {
                latitude: p.latitude,
                longitude: p.longitude,
                provenance: self.0,
                metadata: LocationMetadata::default(),
            })
        }
    }

    fn gps_with(lines: &[String]) -> SharedGps {
        let data = lines.join("\r\n") + "\r\n";
        Arc::new(Mutex::new(GpsReceiver::from_reader(
            GpsSettings::default(),
            Cursor::new(data.into_bytes()),
        )))
    }

    fn gga(quality: u8, sats: u32) -> String {
        with_checksum(&format!(
            "GPGGA,101500,1739.594,N,07554.384,E,{},{:02},1.1,480.0,M,-70.0,M,,",
            quality, sats
        ))
    }

    fn fc(lat: f64, lon: f64) -> SharedFlightController {
        Arc::new(Mutex::new(FlightController::fixed(Some(Telemetry {
            latitude: lat,
            longitude: lon,
            altitude_m: 40.0,
            heading_deg: 12.0,
            ..Telemetry::default()
        }))))
    }

    fn dead_ip() -> IpGeolocator {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        IpGeolocator::new(
            format!("http://127.0.0.1:{}/json", port),
            std::time::Duration::from_millis(200),
        )
    }

    #[test]
    fn all_sources_down_resolves_to_default() {
        let sources = LocationSources {
            flight_controller: Some(Arc::new(Mutex::new(FlightController::fixed(None)))),
            gps: Some(gps_with(&[])),
            ip_geolocator: Some(dead_ip()),
        };
        let mut resolver =
            LocationResolver::from_settings(&LocationSettings::default(), sources).unwrap();
        let r = resolver.resolve();
        assert_eq!(r.provenance, Provenance::Default);
        assert_eq!(r.point(), GeoPoint::new(DEFAULT_LATITUDE, DEFAULT_LONGITUDE));
        assert_eq!(resolver.resolution_counts()[&Provenance::Default], 1);
    }

    #[test]
    fn flight_controller_wins_over_gps_and_ip() {
        let mut resolver = LocationResolver::new(GeoPoint::new(0.0, 0.0));
        resolver.push(FlightControllerStrategy::new(fc(18.52, 73.85)));
        resolver.push(LocalGpsStrategy::new(gps_with(&[gga(4, 12)]), FixQuality::Gps, 4));
        resolver.push(Scripted(Provenance::IpGeolocation, Some(GeoPoint::new(1.5, 2.5))));
        let r = resolver.resolve();
        assert_eq!(r.provenance, Provenance::FlightController);
        assert_eq!(r.latitude, 18.52);
        assert_eq!(r.metadata.altitude_m, Some(40.0));
        assert_eq!(r.metadata.heading_deg, Some(12.0));
    }

    #[test]
    fn zero_coordinate_telemetry_is_skipped() {
        let mut resolver = LocationResolver::new(GeoPoint::new(5.0, 5.0));
        resolver.push(FlightControllerStrategy::new(fc(0.0, 0.0)));
        resolver.push(LocalGpsStrategy::new(gps_with(&[gga(1, 5)]), FixQuality::Gps, 4));
        assert_eq!(resolver.resolve().provenance, Provenance::LocalGpsModule);
    }

    #[test]
    fn gps_quality_one_with_five_satellites_is_local_gps() {
        let sources = LocationSources {
            flight_controller: Some(Arc::new(Mutex::new(FlightController::fixed(None)))),
            gps: Some(gps_with(&[gga(1, 5)])),
            ip_geolocator: None,
        };
        let mut resolver =
            LocationResolver::from_settings(&LocationSettings::default(), sources).unwrap();
        let r = resolver.resolve();
        assert_eq!(r.provenance, Provenance::LocalGpsModule);
        assert!((r.latitude - 17.6599).abs() < 1e-4);
        assert!((r.longitude - 75.9064).abs() < 1e-4);
        assert_eq!(r.metadata.gps_quality, 1);
        assert_eq!(r.metadata.satellites, Some(5));
    }

    #[test]
    fn cached_fix_is_reported_with_quality_zero() {
        let gps = gps_with(&[gga(2, 8)]);
        let mut resolver = LocationResolver::new(GeoPoint::new(5.0, 5.0));
        resolver.push(LocalGpsStrategy::new(gps.clone(), FixQuality::Gps, 4));
        resolver.push(CachedGpsStrategy::new(gps));
        assert_eq!(resolver.resolve().provenance, Provenance::LocalGpsModule);
        let second = resolver.resolve();
        assert_eq!(second.provenance, Provenance::CachedGps);
        assert_eq!(second.metadata.gps_quality, 0);
    }

    #[test]
    fn cached_step_is_omitted_when_disabled() {
        let settings = LocationSettings {
            use_cached_if_no_fix: false,
            ..LocationSettings::default()
        };
        let sources = LocationSources {
            gps: Some(gps_with(&[])),
            ..LocationSources::default()
        };
        let resolver = LocationResolver::from_settings(&settings, sources).unwrap();
        assert_eq!(
            resolver.chain(),
            vec![Provenance::LocalGpsModule, Provenance::Default]
        );
    }

    #[test]
    fn ip_coordinate_passes_through_unchanged() {
        let mut resolver = LocationResolver::new(GeoPoint::new(5.0, 5.0));
        resolver.push(FlightControllerStrategy::new(Arc::new(Mutex::new(
            FlightController::fixed(None),
        ))));
        resolver.push(LocalGpsStrategy::new(gps_with(&[]), FixQuality::Gps, 4));
        resolver.push(CachedGpsStrategy::new(gps_with(&[])));
        resolver.push(Scripted(Provenance::IpGeolocation, Some(GeoPoint::new(12.97, 77.59))));
        let r = resolver.resolve();
        assert_eq!(r.provenance, Provenance::IpGeolocation);
        assert_eq!((r.latitude, r.longitude), (12.97, 77.59));
    }

    #[test]
    fn priority_order_is_data() {
        let settings = LocationSettings {
            priority: vec![Provenance::LocalGpsModule, Provenance::FlightController],
            ..LocationSettings::default()
        };
        let sources = LocationSources {
            flight_controller: Some(fc(18.52, 73.85)),
            gps: Some(gps_with(&[gga(1, 6)])),
            ip_geolocator: None,
        };
        let mut resolver = LocationResolver::from_settings(&settings, sources).unwrap();
        assert_eq!(resolver.resolve().provenance, Provenance::LocalGpsModule);
    }

    #[test]
    fn provenance_names_round_trip() {
        for p in Provenance::default_priority() {
            assert_eq!(p.as_str().parse::<Provenance>().unwrap(), p);
        }
        assert!("gps".parse::<Provenance>().is_err());
    }
}
