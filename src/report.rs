//! Fire-and-forget upload of detections to a remote reporting endpoint.
//!
//! The frame loop hands payloads to a bounded queue and never waits on the
//! network. A worker thread POSTs them one at a time. A full queue drops the
//! payload; failed POSTs are logged and not retried.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::ReportSettings;
use crate::storage::DetectionRecord;

/// JSON body accepted by the reporting endpoint and by `POST /api/report`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: String,
    pub confidence: f32,
    #[serde(rename = "class", default = "default_class")]
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_quality: Option<u8>,
}

fn default_class() -> String {
    crate::detect::DEFAULT_CLASS_NAME.to_string()
}

impl ReportPayload {
    pub fn from_record(record: &DetectionRecord) -> Self {
        Self {
            timestamp: record.timestamp.to_rfc3339(),
            latitude: record.latitude,
            longitude: record.longitude,
            severity: record.severity.as_str().to_string(),
            confidence: record.confidence,
            class_name: record.class_name.clone(),
            image_path: record.image_path.clone(),
            image_base64: record.image_base64.clone(),
            location_source: Some(record.location_source.as_str().to_string()),
            gps_quality: Some(record.gps_quality),
        }
    }

    /// Replace `image_path` with the encoded file contents when the file exists.
    fn inline_image(&mut self) {
        if self.image_base64.is_some() {
            return;
        }
        let Some(path) = self.image_path.as_deref() else {
            return;
        };
        match std::fs::read(Path::new(path)) {
            Ok(bytes) => self.image_base64 = Some(BASE64.encode(bytes)),
            Err(err) => log::debug!("report image {} not attached: {}", path, err),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReporterStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct RemoteReporter {
    sender: Option<SyncSender<ReportPayload>>,
    join: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl RemoteReporter {
    pub fn spawn(settings: &ReportSettings) -> Result<Self> {
        let config = settings.clone();
        if config.queue_capacity == 0 {
            return Err(anyhow!("report queue capacity must be greater than zero"));
        }
        url::Url::parse(&config.url)
            .map_err(|e| anyhow!("invalid report url '{}': {}", config.url, e))?;
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();
        let join = std::thread::Builder::new()
            .name("roadwatch-report".to_string())
            .spawn(move || run_worker(receiver, config, worker_counters))?;
        Ok(Self {
            sender: Some(sender),
            join: Some(join),
            counters,
        })
    }

    /// Queue a payload. Returns false when it was dropped.
    pub fn submit(&self, payload: ReportPayload) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        match sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("report queue full; dropping detection report");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("report worker is gone; dropping detection report");
                false
            }
        }
    }

    pub fn stats(&self) -> ReporterStats {
        ReporterStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue, let the worker drain it, and join.
    pub fn shutdown(mut self) -> ReporterStats {
        self.close();
        self.stats()
    }

    fn close(&mut self) {
        self.sender.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("report worker panicked");
            }
        }
    }
}

impl Drop for RemoteReporter {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(receiver: Receiver<ReportPayload>, config: ReportSettings, counters: Arc<Counters>) {
    let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
    for mut payload in receiver {
        if config.include_image {
            payload.inline_image();
        }
        match post_report(&agent, &config.url, &payload) {
            Ok(status) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                log::info!("detection reported ({})", status);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("detection report to {} failed: {:#}", config.url, err);
            }
        }
    }
    log::debug!("report worker exiting");
}

fn post_report(agent: &ureq::Agent, url: &str, payload: &ReportPayload) -> Result<u16> {
    match agent.post(url).send_json(payload) {
        Ok(response) => match response.status() {
            status @ (200 | 201) => Ok(status),
            status => Err(anyhow!("unexpected status {}", status)),
        },
        Err(ureq::Error::Status(status, _)) => Err(anyhow!("endpoint answered {}", status)),
        Err(err) => Err(anyhow!(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Provenance;
    use crate::{RepairStatus, Severity};
    use chrono::Utc;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn record() -> DetectionRecord {
        DetectionRecord {
            id: 7,
            timestamp: Utc::now(),
            latitude: 17.66,
            longitude: 75.90,
            severity: Severity::High,
            confidence: 0.91,
            class_name: "pothole".to_string(),
            image_path: None,
            image_base64: None,
            camera_source: "main_camera".to_string(),
            gps_quality: 2,
            location_source: Provenance::LocalGpsModule,
            repair_status: RepairStatus::Pending,
            repair_date: None,
            notes: None,
        }
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let value = serde_json::to_value(ReportPayload::from_record(&record())).unwrap();
        assert_eq!(value["class"], "pothole");
        assert_eq!(value["severity"], "High");
        assert_eq!(value["location_source"], "local_gps_module");
        assert!(value.get("image_base64").is_none());
    }

    #[test]
    fn payload_accepts_minimal_citizen_json() {
        let p: ReportPayload = serde_json::from_str(
            r#"{"timestamp":"2026-01-01T00:00:00Z","latitude":1.0,"longitude":2.0,"severity":"Low","confidence":0.5}"#,
        )
        .unwrap();
        assert_eq!(p.class_name, "pothole");
        assert_eq!(p.image_base64, None);
    }

    #[test]
    fn image_file_is_inlined_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.jpg");
        std::fs::write(&path, b"jpegbytes").unwrap();
        let mut p = ReportPayload::from_record(&record());
        p.image_path = Some(path.to_string_lossy().to_string());
        p.inline_image();
        assert_eq!(p.image_base64.as_deref(), Some(BASE64.encode(b"jpegbytes").as_str()));
    }

    #[test]
    fn reporter_posts_to_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap_or(0);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&data);
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let len = head
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if body.len() >= len {
                        break;
                    }
                }
            }
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                .unwrap();
            String::from_utf8_lossy(&data).to_string()
        });

        let reporter = RemoteReporter::spawn(&ReportSettings {
            enabled: true,
            url: format!("http://{}/api/report", addr),
            timeout: Duration::from_secs(2),
            queue_capacity: 4,
            include_image: false,
        })
        .unwrap();
        assert!(reporter.submit(ReportPayload::from_record(&record())));
        let request = server.join().unwrap();
        let stats = reporter.shutdown();
        assert_eq!(stats.sent, 1);
        assert!(request.starts_with("POST /api/report"));
        assert!(request.contains("\"severity\":\"High\""));
    }

    #[test]
    fn unreachable_endpoint_counts_failure() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let reporter = RemoteReporter::spawn(&ReportSettings {
            enabled: true,
            url: format!("http://127.0.0.1:{}/api/report", port),
            timeout: Duration::from_millis(300),
            queue_capacity: 1,
            include_image: false,
        })
        .unwrap();
        reporter.submit(ReportPayload::from_record(&record()));
        let stats = reporter.shutdown();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.failed + stats.dropped, 1);
    }
}
