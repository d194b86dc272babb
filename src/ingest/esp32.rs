//! ESP32-CAM / IP camera frame source.
//!
//! This module provides `Esp32Source` for cameras that stream MJPEG/JPEG over
//! HTTP or JPEG over RTP/UDP. The HTTP endpoint may answer with a
//! `multipart/x-mixed-replace` stream or with one JPEG per request (snapshot
//! mode, polled at the target frame rate).

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use url::Url;

use super::{frame_interval, health_grace, FrameSource, SourceStats};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const RTP_JPEG_PAYLOAD_TYPE: u8 = 26;
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 10;
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// ESP32 frame source.
///
/// Uses HTTP MJPEG/JPEG or UDP RTP/JPEG, depending on the URL scheme.
pub struct Esp32Source {
    url: String,
    target_fps: u32,
    backend: Esp32Backend,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
    decode_failures: u64,
    consecutive_failures: u32,
}

enum Esp32Backend {
    Http(Option<HttpStream>),
    Udp(UdpReceiver),
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg(ureq::Agent),
}

impl Esp32Source {
    pub fn new(url: &str, target_fps: u32) -> Result<Self> {
        let parsed = Url::parse(url).context("parse esp32 url")?;
        let backend = match parsed.scheme() {
            "http" | "https" => Esp32Backend::Http(None),
            "udp" => Esp32Backend::Udp(UdpReceiver::bind(&parsed)?),
            other => {
                return Err(anyhow!(
                    "unsupported esp32 scheme '{}'; expected http(s) or udp",
                    other
                ))
            }
        };
        Ok(Self {
            url: url.to_string(),
            target_fps,
            backend,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
            decode_failures: 0,
            consecutive_failures: 0,
        })
    }

    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.backend {
            Esp32Backend::Http(stream) => {
                let stream = stream
                    .as_mut()
                    .ok_or_else(|| anyhow!("esp32 http source not connected; call connect() first"))?;
                match stream {
                    HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
                    HttpStream::SingleJpeg(agent) => fetch_single_jpeg(agent, &self.url).map(Some),
                }
            }
            Esp32Backend::Udp(receiver) => receiver.next_jpeg().map(Some),
        }
    }
}

impl FrameSource for Esp32Source {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            Esp32Backend::Http(stream) => {
                let agent = ureq::AgentBuilder::new()
                    .timeout_connect(HTTP_CONNECT_TIMEOUT)
                    .build();
                let response = agent
                    .get(&self.url)
                    .call()
                    .with_context(|| format!("connect to camera stream {}", self.url))?;
                let content_type = response.header("Content-Type").unwrap_or("");
                if content_type.to_lowercase().contains("multipart") {
                    *stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
                } else {
                    *stream = Some(HttpStream::SingleJpeg(agent));
                }
            }
            Esp32Backend::Udp(receiver) => receiver.connect()?,
        }
        self.connected_at = Some(Instant::now());
        log::info!("Esp32Source: connected to {}", self.url);
        Ok(())
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>> {
        let min_interval = frame_interval(self.target_fps);
        loop {
            let Some(jpeg_bytes) = self.next_jpeg()? else {
                return Ok(None);
            };

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    continue;
                }
            }

            match decode_jpeg(&jpeg_bytes) {
                Ok(image) => {
                    self.frame_count += 1;
                    self.consecutive_failures = 0;
                    self.last_frame_at = Some(now);
                    return Ok(Some(image));
                }
                Err(err) => {
                    self.decode_failures += 1;
                    self.consecutive_failures += 1;
                    log::debug!("skipping undecodable frame: {:#}", err);
                    if self.consecutive_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                        return Err(anyhow!(
                            "{} consecutive undecodable frames from {}",
                            self.consecutive_failures,
                            self.url
                        ));
                    }
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= health_grace(self.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            decode_failures: self.decode_failures,
            source: self.url.clone(),
        }
    }
}

/// Splits a byte stream of concatenated (or multipart-wrapped) JPEGs.
pub(crate) struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` once the stream ends.
    pub(crate) fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

struct UdpReceiver {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpReceiver {
    fn bind(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("udp url missing host"))?;
        let port = url.port().ok_or_else(|| anyhow!("udp url missing port"))?;
        let bind_addr = format!("{}:{}", host, port);
        Ok(Self {
            socket: UdpSocket::bind(&bind_addr)
                .with_context(|| format!("bind udp socket on {}", bind_addr))?,
            buffer: Vec::with_capacity(128 * 1024),
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("set udp read timeout")
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        loop {
            let mut packet = vec![0u8; 64 * 1024];
            let (len, _) = self
                .socket
                .recv_from(&mut packet)
                .context("recv udp packet")?;
            packet.truncate(len);
            let (payload, marker) = match parse_rtp_payload(&packet) {
                Ok(parsed) => parsed,
                Err(err) => {
                    log::debug!("dropping rtp packet: {:#}", err);
                    continue;
                }
            };

            if payload.is_empty() {
                continue;
            }

            if self.buffer.len() + payload.len() > MAX_JPEG_BYTES {
                self.buffer.clear();
                return Err(anyhow!("rtp frame exceeded max jpeg size"));
            }

            self.buffer.extend_from_slice(payload);

            if marker {
                return Ok(std::mem::take(&mut self.buffer));
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(image.into_rgb8())
}

pub(crate) fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn parse_rtp_payload(packet: &[u8]) -> Result<(&[u8], bool)> {
    if packet.len() < 12 {
        return Err(anyhow!("rtp packet too small"));
    }
    let b0 = packet[0];
    let b1 = packet[1];
    let version = b0 >> 6;
    if version != 2 {
        return Err(anyhow!("unsupported rtp version {}", version));
    }
    let padding = (b0 & 0x20) != 0;
    let extension = (b0 & 0x10) != 0;
    let csrc_count = (b0 & 0x0F) as usize;
    let marker = (b1 & 0x80) != 0;
    let payload_type = b1 & 0x7F;
    if payload_type != RTP_JPEG_PAYLOAD_TYPE {
        return Err(anyhow!(
            "unsupported rtp payload type {}; expected {}",
            payload_type,
            RTP_JPEG_PAYLOAD_TYPE
        ));
    }

    let mut offset = 12 + csrc_count * 4;
    if packet.len() < offset {
        return Err(anyhow!("rtp packet missing csrc entries"));
    }

    if extension {
        if packet.len() < offset + 4 {
            return Err(anyhow!("rtp extension header truncated"));
        }
        let ext_len = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 + ext_len * 4;
    }

    if packet.len() < offset {
        return Err(anyhow!("rtp packet truncated"));
    }

    let mut payload_end = packet.len();
    if padding {
        let pad_len = *packet.last().unwrap_or(&0) as usize;
        if pad_len > payload_end - offset {
            return Err(anyhow!("invalid rtp padding"));
        }
        payload_end -= pad_len;
    }

    Ok((&packet[offset..payload_end], marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::encode_jpeg;
    use image::Rgb;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;

    fn jpeg(shade: u8) -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(32, 24, Rgb([shade; 3])), 80).unwrap()
    }

    #[test]
    fn jpeg_bounds_skip_multipart_headers() {
        let body = jpeg(100);
        let mut buf = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let start = buf.len();
        buf.extend_from_slice(&body);
        buf.extend_from_slice(b"\r\n--frame\r\n");
        assert_eq!(find_jpeg_bounds(&buf), Some((start, start + body.len())));
        assert_eq!(find_jpeg_bounds(&buf[..start + 10]), None);
    }

    #[test]
    fn mjpeg_stream_yields_each_frame_then_ends() {
        let mut data = Vec::new();
        for shade in [10u8, 200] {
            data.extend_from_slice(b"--frame\r\n\r\n");
            data.extend_from_slice(&jpeg(shade));
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(data)));
        let a = decode_jpeg(&stream.read_next_jpeg().unwrap().unwrap()).unwrap();
        let b = decode_jpeg(&stream.read_next_jpeg().unwrap().unwrap()).unwrap();
        assert!(a.get_pixel(0, 0)[0] < 50);
        assert!(b.get_pixel(0, 0)[0] > 150);
        assert!(stream.read_next_jpeg().unwrap().is_none());
    }

    #[test]
    fn rtp_header_is_stripped() {
        let mut packet = vec![0x80, 0x80 | RTP_JPEG_PAYLOAD_TYPE];
        packet.extend_from_slice(&[0u8; 10]);
        packet.extend_from_slice(b"payload");
        let (payload, marker) = parse_rtp_payload(&packet).unwrap();
        assert_eq!(payload, b"payload");
        assert!(marker);

        packet[1] = 96;
        assert!(parse_rtp_payload(&packet).is_err());
        assert!(parse_rtp_payload(&packet[..8]).is_err());
    }

    #[test]
    fn http_multipart_camera_is_decoded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n",
                )
                .unwrap();
            for shade in [40u8, 120, 220] {
                let body = jpeg(shade);
                let part = format!(
                    "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                );
                stream.write_all(part.as_bytes()).unwrap();
                stream.write_all(&body).unwrap();
                stream.write_all(b"\r\n").unwrap();
            }
        });

        let mut source = Esp32Source::new(&format!("http://{}/stream", addr), 0).unwrap();
        source.connect().unwrap();
        let mut frames = 0;
        while let Some(image) = source.next_image().unwrap() {
            assert_eq!(image.dimensions(), (32, 24));
            frames += 1;
        }
        server.join().unwrap();
        assert_eq!(frames, 3);
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(Esp32Source::new("ftp://camera/stream", 10).is_err());
    }
}
