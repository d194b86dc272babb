//! NMEA GPS receiver.
//!
//! The receiver reads GGA/RMC sentences from a line-oriented byte stream:
//! - a serial device path (`/dev/ttyACM0`, `/dev/serial0`), switched to raw mode
//!   at the configured baud rate
//! - `tcp://host:port` (gpsd raw NMEA, u-center TCP bridge, GNSS simulators)
//! - any `BufRead` handed to `GpsReceiver::from_reader` (tests, replays)
//!
//! Every read is bounded by `GpsSettings::timeout`; a silent receiver ends the
//! poll cycle instead of blocking it. Opening the port never fails the caller. A receiver that could not open its
//! port stays disconnected and only answers from its cache.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::TcpStream;
use std::time::Duration;

use super::nmea::{parse_sentence, NmeaSentence};
use super::{FixQuality, GpsFix};

pub const DEFAULT_GPS_PORT: &str = "/dev/serial0";
pub const DEFAULT_GPS_BAUD: u32 = 9600;
pub const DEFAULT_GPS_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_GPS_MAX_RETRIES: usize = 20;
pub const DEFAULT_GPS_MIN_SATELLITES: u32 = 4;
/// Consecutive empty polls before the receiver starts warning.
const NO_FIX_WARN_AFTER: u32 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct GpsSettings {
    pub port: String,
    /// Line speed applied when `port` is a tty.
    pub baud: u32,
    /// Longest wait for data on a single read.
    pub timeout: Duration,
    /// Lines read per `get_coordinates` call before giving up on this cycle.
    pub max_retries: usize,
    pub min_satellites: u32,
}

impl Default for GpsSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_GPS_PORT.to_string(),
            baud: DEFAULT_GPS_BAUD,
            timeout: DEFAULT_GPS_TIMEOUT,
            max_retries: DEFAULT_GPS_MAX_RETRIES,
            min_satellites: DEFAULT_GPS_MIN_SATELLITES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GpsDiagnostics {
    pub connected: bool,
    pub port: String,
    pub baud: u32,
    pub has_valid_fix: bool,
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_quality: u8,
    pub no_fix_cycles: u32,
    pub connection_attempts: u32,
    pub parse_errors: u64,
}

pub struct GpsReceiver {
    settings: GpsSettings,
    reader: Option<Box<dyn BufRead + Send>>,
    /// Bytes of a sentence cut off by a read timeout.
    partial: String,
    cached: Option<GpsFix>,
    no_fix_cycles: u32,
    connection_attempts: u32,
    parse_errors: u64,
}

impl GpsReceiver {
    /// Open the configured port. Failures are logged and leave the receiver disconnected.
    pub fn open(settings: GpsSettings) -> Self {
        let mut receiver = Self::disconnected(settings);
        receiver.reconnect();
        receiver
    }

    pub fn disconnected(settings: GpsSettings) -> Self {
        Self {
            settings,
            reader: None,
            partial: String::new(),
            cached: None,
            no_fix_cycles: 0,
            connection_attempts: 0,
            parse_errors: 0,
        }
    }

    pub fn from_reader(settings: GpsSettings, reader: impl BufRead + Send + 'static) -> Self {
        let mut receiver = Self::disconnected(settings);
        receiver.reader = Some(Box::new(reader));
        receiver.connection_attempts = 1;
        receiver
    }

    /// Drop any open stream and try the port again.
    pub fn reconnect(&mut self) -> bool {
        self.reader = None;
        self.partial.clear();
        self.connection_attempts += 1;
        match open_port(&self.settings) {
            Ok(reader) => {
                log::info!(
                    "gps connected on {} @ {} baud",
                    self.settings.port,
                    self.settings.baud
                );
                self.reader = Some(reader);
                true
            }
            Err(err) => {
                log::warn!("gps connection failed on {}: {:#}", self.settings.port, err);
                false
            }
        }
    }

    pub fn settings(&self) -> &GpsSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    /// True once any fix has passed the quality and satellite checks.
    pub fn has_valid_fix(&self) -> bool {
        self.cached.is_some()
    }

    /// Read up to `max_retries` lines and return a fresh fix, if one arrived.
    ///
    /// A fix is accepted when its quality is above `NoFix` and it reports at least
    /// `min_satellites`; accepted fixes replace the cache.
    pub fn poll_fix(&mut self) -> Option<GpsFix> {
        let Some(reader) = self.reader.as_mut() else {
            return None;
        };

        let mut line = std::mem::take(&mut self.partial);
        let mut stream_closed = false;
        for _ in 0..self.settings.max_retries.max(1) {
            match reader.read_line(&mut line) {
                Ok(0) => {
                    stream_closed = true;
                    break;
                }
                Ok(_) => {}
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    log::debug!("gps read timed out on {}", self.settings.port);
                    self.partial = std::mem::take(&mut line);
                    break;
                }
                Err(err) => {
                    log::debug!("gps read error on {}: {}", self.settings.port, err);
                    line.clear();
                    continue;
                }
            }
            let parsed = parse_sentence(&line);
            line.clear();
            let sentence = match parsed {
                Ok(Some(sentence)) => sentence,
                Ok(None) => continue,
                Err(err) => {
                    self.parse_errors += 1;
                    log::debug!("nmea parse error: {}", err);
                    continue;
                }
            };
            if let Some(fix) = accept_fix(sentence, self.settings.min_satellites) {
                self.cached = Some(fix);
                self.no_fix_cycles = 0;
                log::debug!(
                    "gps fix ({:.6}, {:.6}) quality={} sats={}",
                    fix.latitude,
                    fix.longitude,
                    fix.quality.ordinal(),
                    fix.satellites
                );
                return Some(fix);
            }
        }

        if stream_closed {
            log::warn!("gps stream on {} closed", self.settings.port);
            self.reader = None;
        }
        self.no_fix_cycles += 1;
        if self.no_fix_cycles > NO_FIX_WARN_AFTER {
            log::warn!("no gps fix for {} cycles", self.no_fix_cycles);
        }
        None
    }

    /// Fresh fix when available, otherwise the last known good fix.
    pub fn get_coordinates(&mut self) -> Option<GpsFix> {
        if let Some(fix) = self.poll_fix() {
            return Some(fix);
        }
        if self.cached.is_some() {
            log::debug!("no new gps fix; using cached coordinates");
        }
        self.cached
    }

    /// Last known good fix without touching the port.
    pub fn get_cached_coordinates(&self) -> Option<GpsFix> {
        self.cached
    }

    pub fn no_fix_cycles(&self) -> u32 {
        self.no_fix_cycles
    }

    pub fn get_diagnostics(&self) -> GpsDiagnostics {
        GpsDiagnostics {
            connected: self.is_connected(),
            port: self.settings.port.clone(),
            baud: self.settings.baud,
            has_valid_fix: self.has_valid_fix(),
            last_latitude: self.cached.map(|f| f.latitude),
            last_longitude: self.cached.map(|f| f.longitude),
            last_timestamp: self.cached.map(|f| f.timestamp),
            last_quality: self.cached.map(|f| f.quality.ordinal()).unwrap_or(0),
            no_fix_cycles: self.no_fix_cycles,
            connection_attempts: self.connection_attempts,
            parse_errors: self.parse_errors,
        }
    }

    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            log::info!("gps connection on {} closed", self.settings.port);
        }
    }
}

impl Drop for GpsReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_fix(sentence: NmeaSentence, min_satellites: u32) -> Option<GpsFix> {
    let (time, latitude, longitude, quality, satellites, altitude_m, hdop) = match sentence {
        NmeaSentence::Gga(gga) => (
            gga.time,
            gga.latitude?,
            gga.longitude?,
            gga.quality,
            gga.satellites,
            gga.altitude_m,
            gga.hdop,
        ),
        // RMC carries no satellite count; an active RMC fix counts as a plain GPS fix.
        NmeaSentence::Rmc(rmc) => (
            rmc.time,
            rmc.latitude?,
            rmc.longitude?,
            if rmc.active {
                FixQuality::Gps
            } else {
                FixQuality::NoFix
            },
            min_satellites,
            None,
            None,
        ),
    };
    if quality == FixQuality::NoFix || satellites < min_satellites {
        return None;
    }
    let now = Utc::now();
    let timestamp = time
        .map(|t| now.date_naive().and_time(t).and_utc())
        .unwrap_or(now);
    Some(GpsFix {
        latitude,
        longitude,
        timestamp,
        quality,
        satellites,
        altitude_m,
        hdop,
    })
}

fn open_port(settings: &GpsSettings) -> Result<Box<dyn BufRead + Send>> {
    if let Some(addr) = settings.port.strip_prefix("tcp://") {
        let socket_addr = std::net::ToSocketAddrs::to_socket_addrs(addr)
            .with_context(|| format!("resolve gps address {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("gps address {} did not resolve", addr))?;
        let stream = TcpStream::connect_timeout(&socket_addr, settings.timeout)
            .with_context(|| format!("connect to gps stream {}", addr))?;
        stream
            .set_read_timeout(Some(settings.timeout))
            .context("set gps read timeout")?;
        return Ok(Box::new(BufReader::new(stream)));
    }
    open_device(settings)
}

#[cfg(unix)]
fn open_device(settings: &GpsSettings) -> Result<Box<dyn BufRead + Send>> {
    let port = super::serial::SerialPort::open(&settings.port, settings.baud, settings.timeout)?;
    Ok(Box::new(BufReader::new(port)))
}

#[cfg(not(unix))]
fn open_device(settings: &GpsSettings) -> Result<Box<dyn BufRead + Send>> {
    let file = std::fs::File::open(&settings.port)
        .with_context(|| format!("open gps port {}", settings.port))?;
    Ok(Box::new(BufReader::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::nmea::with_checksum;
    use std::io::Cursor;

    fn receiver(lines: &[String]) -> GpsReceiver {
        let data = lines.join("\r\n") + "\r\n";
        GpsReceiver::from_reader(GpsSettings::default(), Cursor::new(data.into_bytes()))
    }

    fn gga(quality: u8, sats: u32) -> String {
        with_checksum(&format!(
            "GPGGA,101500,1739.594,N,07554.384,E,{},{:02},1.1,480.0,M,-70.0,M,,",
            quality, sats
        ))
    }

    #[test]
    fn accepts_fix_with_enough_satellites() {
        let mut gps = receiver(&[gga(1, 5)]);
        let fix = gps.get_coordinates().unwrap();
        assert_eq!(fix.quality, FixQuality::Gps);
        assert_eq!(fix.satellites, 5);
        assert!((fix.latitude - 17.6599).abs() < 1e-4);
        assert!(gps.has_valid_fix());
    }

    #[test]
    fn rejects_weak_fix_and_counts_no_fix_cycles() {
        let mut gps = receiver(&[gga(1, 3), gga(0, 9)]);
        assert!(gps.poll_fix().is_none());
        assert_eq!(gps.no_fix_cycles(), 1);
        assert!(!gps.has_valid_fix());
    }

    #[test]
    fn cached_fix_survives_lost_signal() {
        let mut gps = receiver(&[gga(2, 7)]);
        let first = gps.get_coordinates().unwrap();
        // stream is exhausted now: no fresh fix, cache answers
        assert!(gps.poll_fix().is_none());
        assert_eq!(gps.get_coordinates(), Some(first));
        assert_eq!(gps.get_cached_coordinates(), Some(first));
        assert!(!gps.is_connected());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let mut gps = receiver(&[
            "noise".to_string(),
            "$GPGGA,1,2*00".to_string(),
            with_checksum("GPGSV,3,1,11"),
            gga(1, 6),
        ]);
        assert!(gps.poll_fix().is_some());
        assert_eq!(gps.get_diagnostics().parse_errors, 2);
    }

    #[test]
    fn active_rmc_counts_as_gps_fix() {
        let rmc = with_checksum("GNRMC,101500,A,1739.594,N,07554.384,E,0.0,0.0,140526,,");
        let mut gps = receiver(&[rmc]);
        let fix = gps.poll_fix().unwrap();
        assert_eq!(fix.quality, FixQuality::Gps);
    }

    #[cfg(unix)]
    fn make_fifo(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::ffi::OsStrExt;
        let path = dir.join("gps.fifo");
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        // SAFETY: valid NUL-terminated path.
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
        path
    }

    #[cfg(unix)]
    fn fifo_settings(path: &std::path::Path) -> GpsSettings {
        GpsSettings {
            port: path.to_string_lossy().to_string(),
            timeout: Duration::from_millis(300),
            ..GpsSettings::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn silent_device_times_out_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = make_fifo(dir.path());
        let mut gps = GpsReceiver::open(fifo_settings(&fifo));
        assert!(gps.is_connected());
        // writer stays open and never writes
        let _writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();

        let started = std::time::Instant::now();
        assert!(gps.poll_fix().is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(gps.is_connected());
        assert_eq!(gps.no_fix_cycles(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn device_fix_arrives_across_a_timeout() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let fifo = make_fifo(dir.path());
        let mut gps = GpsReceiver::open(fifo_settings(&fifo));
        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();

        let sentence = gga(1, 6);
        let (head, tail) = sentence.split_at(10);
        writer.write_all(head.as_bytes()).unwrap();
        writer.flush().unwrap();
        assert!(gps.poll_fix().is_none());

        writer.write_all(format!("{tail}\r\n").as_bytes()).unwrap();
        writer.flush().unwrap();
        let fix = gps.poll_fix().expect("fix from the rest of the sentence");
        assert_eq!(fix.satellites, 6);
    }

    #[test]
    fn missing_port_stays_disconnected() {
        let gps = GpsReceiver::open(GpsSettings {
            port: "/nonexistent/roadwatch-gps".to_string(),
            ..GpsSettings::default()
        });
        assert!(!gps.is_connected());
        let diag = gps.get_diagnostics();
        assert_eq!(diag.connection_attempts, 1);
        assert!(!diag.has_valid_fix);
    }
}
