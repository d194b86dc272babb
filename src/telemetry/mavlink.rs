//! Minimal MAVLink reader for `GLOBAL_POSITION_INT`.
//!
//! Only the one message the pipeline needs is decoded. Both v1 (`0xFE`) and v2
//! (`0xFD`) framing are accepted; frames with a bad X.25 checksum are skipped.
//! v2 payloads may be truncated on the wire (trailing zero bytes removed) and are
//! zero-padded back to full length before decoding.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::net::{SocketAddr, UdpSocket};

use super::{FixQuality, Telemetry};

pub const DEFAULT_CONNECTION: &str = "udp:127.0.0.1:14550";

const STX_V1: u8 = 0xFE;
const STX_V2: u8 = 0xFD;
const MSG_GLOBAL_POSITION_INT: u32 = 33;
const CRC_EXTRA_GLOBAL_POSITION_INT: u8 = 104;
const GLOBAL_POSITION_INT_LEN: usize = 28;
const V2_SIGNATURE_LEN: usize = 13;
const MAX_DATAGRAMS_PER_POLL: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GlobalPositionInt {
    pub time_boot_ms: u32,
    /// Degrees * 1e7.
    pub lat: i32,
    pub lon: i32,
    /// Millimeters, MSL.
    pub alt: i32,
    /// Millimeters above home.
    pub relative_alt: i32,
    /// cm/s.
    pub vx: i16,
    pub vy: i16,
    pub vz: i16,
    /// Centidegrees; `u16::MAX` when unknown.
    pub hdg: u16,
}

impl GlobalPositionInt {
    fn decode(payload: &[u8]) -> Self {
        let mut p = [0u8; GLOBAL_POSITION_INT_LEN];
        let n = payload.len().min(GLOBAL_POSITION_INT_LEN);
        p[..n].copy_from_slice(&payload[..n]);
        let u32_at = |i: usize| u32::from_le_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);
        let i32_at = |i: usize| i32::from_le_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);
        let i16_at = |i: usize| i16::from_le_bytes([p[i], p[i + 1]]);
        Self {
            time_boot_ms: u32_at(0),
            lat: i32_at(4),
            lon: i32_at(8),
            alt: i32_at(12),
            relative_alt: i32_at(16),
            vx: i16_at(20),
            vy: i16_at(22),
            vz: i16_at(24),
            hdg: u16::from_le_bytes([p[26], p[27]]),
        }
    }

    pub fn to_telemetry(&self) -> Telemetry {
        let heading_deg = if self.hdg == u16::MAX {
            0.0
        } else {
            self.hdg as f64 / 100.0
        };
        let vx = self.vx as f64 / 100.0;
        let vy = self.vy as f64 / 100.0;
        Telemetry {
            latitude: self.lat as f64 / 1e7,
            longitude: self.lon as f64 / 1e7,
            altitude_m: self.relative_alt as f64 / 1000.0,
            heading_deg,
            speed_mps: (vx * vx + vy * vy).sqrt(),
            fix_quality: FixQuality::Gps,
            satellites: 0,
            timestamp: Utc::now(),
        }
    }
}

/// MCRF4XX / X.25 checksum as used by MAVLink.
pub fn x25_crc(bytes: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for byte in bytes {
        let mut tmp = byte ^ (crc & 0xFF) as u8;
        tmp ^= tmp << 4;
        crc = (crc >> 8) ^ ((tmp as u16) << 8) ^ ((tmp as u16) << 3) ^ ((tmp as u16) >> 4);
    }
    crc
}

fn frame_crc(header_and_payload: &[u8], crc_extra: u8) -> u16 {
    let crc = x25_crc(header_and_payload, 0xFFFF);
    x25_crc(&[crc_extra], crc)
}

/// Scan a datagram for `GLOBAL_POSITION_INT` frames. Returns the last valid one.
///
/// Other message ids cannot be checksummed without their CRC_EXTRA, so the scan
/// only skips ahead over frames it has verified.
pub fn parse_global_position_int(data: &[u8]) -> Option<GlobalPositionInt> {
    let mut found = None;
    let mut i = 0;
    while i < data.len() {
        let parsed = match data[i] {
            STX_V1 => parse_v1(&data[i..]),
            STX_V2 => parse_v2(&data[i..]),
            _ => None,
        };
        match parsed {
            Some((len, msg)) => {
                found = Some(msg);
                i += len;
            }
            None => i += 1,
        }
    }
    found
}

/// Returns `(frame_len, message)` for a verified frame starting at `buf[0]`.
fn parse_v1(buf: &[u8]) -> Option<(usize, GlobalPositionInt)> {
    let len = *buf.get(1)? as usize;
    let total = 6 + len + 2;
    if buf.len() < total || buf[5] as u32 != MSG_GLOBAL_POSITION_INT {
        return None;
    }
    let crc = u16::from_le_bytes([buf[6 + len], buf[7 + len]]);
    if frame_crc(&buf[1..6 + len], CRC_EXTRA_GLOBAL_POSITION_INT) != crc {
        return None;
    }
    Some((total, GlobalPositionInt::decode(&buf[6..6 + len])))
}

fn parse_v2(buf: &[u8]) -> Option<(usize, GlobalPositionInt)> {
    let len = *buf.get(1)? as usize;
    let signed = *buf.get(2)? & 0x01 != 0;
    let total = 10 + len + 2 + if signed { V2_SIGNATURE_LEN } else { 0 };
    if buf.len() < total {
        return None;
    }
    let msg_id = u32::from_le_bytes([buf[7], buf[8], buf[9], 0]);
    if msg_id != MSG_GLOBAL_POSITION_INT {
        return None;
    }
    let crc = u16::from_le_bytes([buf[10 + len], buf[11 + len]]);
    if frame_crc(&buf[1..10 + len], CRC_EXTRA_GLOBAL_POSITION_INT) != crc {
        return None;
    }
    Some((total, GlobalPositionInt::decode(&buf[10..10 + len])))
}

/// UDP listener for flight-controller telemetry.
pub struct MavlinkLink {
    socket: UdpSocket,
    local_addr: SocketAddr,
    last: Option<Telemetry>,
    frames_decoded: u64,
}

impl MavlinkLink {
    /// `udp:host:port` or `udp://host:port`; binds and listens on that address.
    pub fn open(connection: &str) -> Result<Self> {
        let addr = connection
            .strip_prefix("udp://")
            .or_else(|| connection.strip_prefix("udp:"))
            .or_else(|| connection.strip_prefix("udpin:"))
            .ok_or_else(|| anyhow!("unsupported mavlink connection '{}'; expected udp:host:port", connection))?;
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("bind mavlink udp socket on {}", addr))?;
        socket
            .set_nonblocking(true)
            .context("set mavlink socket nonblocking")?;
        let local_addr = socket.local_addr()?;
        log::info!("mavlink listening on {}", local_addr);
        Ok(Self {
            socket,
            local_addr,
            last: None,
            frames_decoded: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn last_telemetry(&self) -> Option<Telemetry> {
        self.last
    }

    pub fn override_telemetry(&mut self, telemetry: Telemetry) {
        self.last = Some(telemetry);
    }

    /// Drain pending datagrams and return the freshest telemetry seen so far.
    pub fn poll(&mut self) -> Result<Option<Telemetry>> {
        let mut buf = [0u8; 2048];
        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    if let Some(msg) = parse_global_position_int(&buf[..len]) {
                        self.frames_decoded += 1;
                        self.last = Some(msg.to_telemetry());
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err).context("recv mavlink datagram"),
            }
        }
        Ok(self.last)
    }
}
