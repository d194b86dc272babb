//! Coarse IP geolocation.
//!
//! A single HTTP GET against a JSON endpoint. City-level accuracy at best; only
//! used when neither the flight controller nor the GPS receiver has a position.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::time::Duration;

use crate::GeoPoint;

pub const DEFAULT_IPGEO_URL: &str = "https://ipinfo.io/json";
pub const DEFAULT_IPGEO_TIMEOUT: Duration = Duration::from_secs(3);

pub struct IpGeolocator {
    url: String,
    agent: ureq::Agent,
    failures: u64,
}

impl IpGeolocator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.into(),
            agent,
            failures: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Coordinate reported by the service, or `None` on any network or format error.
    pub fn resolve(&mut self) -> Option<GeoPoint> {
        match self.fetch() {
            Ok(point) => {
                log::debug!(
                    "ip geolocation ({:.4}, {:.4}) from {}",
                    point.latitude,
                    point.longitude,
                    self.url
                );
                Some(point)
            }
            Err(err) => {
                self.failures += 1;
                log::warn!("ip geolocation via {} failed: {:#}", self.url, err);
                None
            }
        }
    }

    fn fetch(&self) -> Result<GeoPoint> {
        let body: Value = self
            .agent
            .get(&self.url)
            .call()
            .context("ip geolocation request")?
            .into_json()
            .context("ip geolocation response is not json")?;
        parse_location(&body)
    }
}

impl Default for IpGeolocator {
    fn default() -> Self {
        Self::new(DEFAULT_IPGEO_URL, DEFAULT_IPGEO_TIMEOUT)
    }
}

/// Accepts `{lat, lon}`, `{latitude, longitude}` or ipinfo-style `{loc: "lat,lon"}`.
pub fn parse_location(body: &Value) -> Result<GeoPoint> {
    let pair = |lat_key: &str, lon_key: &str| -> Option<(f64, f64)> {
        Some((body.get(lat_key)?.as_f64()?, body.get(lon_key)?.as_f64()?))
    };
    let (latitude, longitude) = if let Some(p) = pair("lat", "lon") {
        p
    } else if let Some(p) = pair("latitude", "longitude") {
        p
    } else if let Some(loc) = body.get("loc").and_then(Value::as_str) {
        let (lat, lon) = loc
            .split_once(',')
            .ok_or_else(|| anyhow!("loc field '{}' is not 'lat,lon'", loc))?;
        (
            lat.trim().parse::<f64>().context("loc latitude")?,
            lon.trim().parse::<f64>().context("loc longitude")?,
        )
    } else {
        return Err(anyhow!("response carries no coordinate pair"));
    };
    let point = GeoPoint::new(latitude, longitude);
    if !point.is_valid() {
        return Err(anyhow!(
            "coordinate ({}, {}) out of range",
            latitude,
            longitude
        ));
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn parses_all_supported_shapes() {
        let a = parse_location(&json!({"lat": 12.97, "lon": 77.59})).unwrap();
        let b = parse_location(&json!({"latitude": 12.97, "longitude": 77.59})).unwrap();
        let c = parse_location(&json!({"ip": "1.2.3.4", "loc": "12.9700,77.5900"})).unwrap();
        assert_eq!(a, GeoPoint::new(12.97, 77.59));
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn rejects_missing_or_out_of_range_coordinates() {
        assert!(parse_location(&json!({"city": "Solapur"})).is_err());
        assert!(parse_location(&json!({"lat": 95.0, "lon": 10.0})).is_err());
        assert!(parse_location(&json!({"loc": "12.9"})).is_err());
    }

    #[test]
    fn resolves_against_local_service() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            let body = r#"{"lat":12.97,"lon":77.59}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        let mut geo = IpGeolocator::new(format!("http://{}/json", addr), Duration::from_secs(2));
        assert_eq!(geo.resolve(), Some(GeoPoint::new(12.97, 77.59)));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_service_yields_none() {
        // bind then drop to get a port with nothing listening
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut geo = IpGeolocator::new(
            format!("http://127.0.0.1:{}/json", port),
            Duration::from_millis(300),
        );
        assert_eq!(geo.resolve(), None);
        assert_eq!(geo.failures(), 1);
    }
}
