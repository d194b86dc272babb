//! Position sources.
//!
//! - `gps`: NMEA receiver over a serial device, `tcp://host:port` or any `BufRead`
//! - `mavlink`: flight-controller `GLOBAL_POSITION_INT` over UDP
//! - `ipgeo`: coarse IP geolocation over HTTP
//!
//! Every source degrades to "no result" on I/O failure; callers decide what to fall
//! back to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod gps;
pub mod ipgeo;
pub mod mavlink;
pub mod nmea;
#[cfg(unix)]
mod serial;

pub use gps::{GpsDiagnostics, GpsReceiver, GpsSettings};
pub use ipgeo::IpGeolocator;
pub use mavlink::MavlinkLink;

/// GGA fix-quality indicator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum FixQuality {
    #[default]
    NoFix,
    Gps,
    Dgps,
    Pps,
    Rtk,
    FloatRtk,
    Estimated,
    Manual,
    Simulation,
}

impl FixQuality {
    pub fn ordinal(self) -> u8 {
        match self {
            FixQuality::NoFix => 0,
            FixQuality::Gps => 1,
            FixQuality::Dgps => 2,
            FixQuality::Pps => 3,
            FixQuality::Rtk => 4,
            FixQuality::FloatRtk => 5,
            FixQuality::Estimated => 6,
            FixQuality::Manual => 7,
            FixQuality::Simulation => 8,
        }
    }

    pub fn from_ordinal(value: u8) -> Self {
        match value {
            1 => FixQuality::Gps,
            2 => FixQuality::Dgps,
            3 => FixQuality::Pps,
            4 => FixQuality::Rtk,
            5 => FixQuality::FloatRtk,
            6 => FixQuality::Estimated,
            7 => FixQuality::Manual,
            8 => FixQuality::Simulation,
            _ => FixQuality::NoFix,
        }
    }
}

impl From<FixQuality> for u8 {
    fn from(value: FixQuality) -> Self {
        value.ordinal()
    }
}

impl From<u8> for FixQuality {
    fn from(value: u8) -> Self {
        FixQuality::from_ordinal(value)
    }
}

/// A position fix from the GPS receiver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: FixQuality,
    pub satellites: u32,
    pub altitude_m: Option<f64>,
    pub hdop: Option<f64>,
}

/// Vehicle state used for ground projection and the HUD.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub heading_deg: f64,
    pub speed_mps: f64,
    pub fix_quality: FixQuality,
    pub satellites: u32,
    pub timestamp: DateTime<Utc>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude_m: 0.0,
            heading_deg: 0.0,
            speed_mps: 0.0,
            fix_quality: FixQuality::NoFix,
            satellites: 0,
            timestamp: Utc::now(),
        }
    }
}

impl Telemetry {
    /// Flight-controller telemetry is trusted only away from the null island band.
    pub fn has_position(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite() && self.latitude.abs() > 1.0
    }

    pub fn can_project(&self) -> bool {
        self.has_position() && self.altitude_m > 0.0
    }
}

/// Flight-controller telemetry source.
pub struct FlightController {
    backend: FlightBackend,
}

enum FlightBackend {
    Mavlink(MavlinkLink),
    Static(Option<Telemetry>),
}

impl FlightController {
    pub fn mavlink(link: MavlinkLink) -> Self {
        Self {
            backend: FlightBackend::Mavlink(link),
        }
    }

    /// Manually set telemetry, for replays and tests.
    pub fn fixed(telemetry: Option<Telemetry>) -> Self {
        Self {
            backend: FlightBackend::Static(telemetry),
        }
    }

    /// Build from a connection string: `udp:host:port` / `udp://host:port` for MAVLink,
    /// `static:lat,lon,alt[,heading]` for a fixed position.
    pub fn from_connection(connection: &str) -> anyhow::Result<Self> {
        if let Some(rest) = connection.strip_prefix("static:") {
            let parts: Vec<f64> = rest
                .split(',')
                .map(|p| p.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| anyhow::anyhow!("invalid static telemetry '{}': {}", rest, e))?;
            if parts.len() < 3 {
                anyhow::bail!("static telemetry needs lat,lon,alt[,heading]");
            }
            return Ok(Self::fixed(Some(Telemetry {
                latitude: parts[0],
                longitude: parts[1],
                altitude_m: parts[2],
                heading_deg: parts.get(3).copied().unwrap_or(0.0),
                fix_quality: FixQuality::Simulation,
                ..Telemetry::default()
            })));
        }
        Ok(Self::mavlink(MavlinkLink::open(connection)?))
    }

    pub fn set_telemetry(&mut self, telemetry: Telemetry) {
        match &mut self.backend {
            FlightBackend::Static(slot) => *slot = Some(telemetry),
            FlightBackend::Mavlink(link) => link.override_telemetry(telemetry),
        }
    }

    /// Latest telemetry, or `None` when the link has produced nothing usable.
    pub fn get_telemetry(&mut self) -> Option<Telemetry> {
        match &mut self.backend {
            FlightBackend::Static(slot) => *slot,
            FlightBackend::Mavlink(link) => match link.poll() {
                Ok(t) => t,
                Err(err) => {
                    log::debug!("mavlink poll failed: {}", err);
                    link.last_telemetry()
                }
            },
        }
    }

    pub fn describe(&self) -> String {
        match &self.backend {
            FlightBackend::Static(_) => "static".to_string(),
            FlightBackend::Mavlink(link) => format!("mavlink {}", link.local_addr()),
        }
    }
}
