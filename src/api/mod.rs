//! HTTP surface for dashboards, repair crews and citizen reports.
//!
//! Plain `TcpListener` loop, one request per connection. Reads open their own
//! SQLite connection per request; the pipeline keeps the writer connection.
//! `/video_feed` connections are handed to a dedicated thread because they
//! stream until the client disconnects.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::RoadwatchConfig;
use crate::frame::LatestFrame;
use crate::location::{Provenance, DEFAULT_LATITUDE, DEFAULT_LONGITUDE};
use crate::output::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use crate::pipeline::SharedLocation;
use crate::report::ReportPayload;
use crate::storage::{DetectionStore, NewDetection, SqliteDetectionStore};
use crate::{now_s, GeoPoint, RepairStatus, Severity};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;
const DEFAULT_HEATMAP_LIMIT: usize = 1000;
const DEFAULT_STATS_DAYS: u32 = 30;
/// Look-back windows are capped at a century.
const MAX_LOOKBACK_DAYS: u32 = 36_500;
const MAX_LOOKBACK_HOURS: u32 = MAX_LOOKBACK_DAYS * 24;
const TOKEN_WINDOW_SECS: u64 = 600;
const MAX_VIDEO_CLIENTS: usize = 4;
const VIDEO_FRAME_WAIT: Duration = Duration::from_secs(1);
const FEED_BOUNDARY: &str = "frame";
pub const CITIZEN_CAMERA_SOURCE: &str = "citizen_app";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub db_path: String,
    pub token_path: Option<PathBuf>,
    /// Served by `/api/location` until the pipeline resolves a position.
    pub default_point: GeoPoint,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            db_path: "roadwatch.db".to_string(),
            token_path: None,
            default_point: GeoPoint::new(DEFAULT_LATITUDE, DEFAULT_LONGITUDE),
        }
    }
}

impl ApiConfig {
    pub fn from_config(cfg: &RoadwatchConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            db_path: cfg.db_path.clone(),
            token_path: cfg.api_token_path.clone(),
            default_point: cfg.location.default_point,
        }
    }
}

/// Live pipeline state the API reads from. Both are optional so the API can
/// run against a database alone.
#[derive(Clone, Default)]
pub struct ApiFeeds {
    pub video: Option<Arc<LatestFrame>>,
    pub location: Option<SharedLocation>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Random 32-byte bearer token for repair updates, replaced once per window.
#[derive(Clone, Debug)]
pub struct CapabilityTokenManager {
    current_window: Option<u64>,
    token: [u8; 32],
}

impl CapabilityTokenManager {
    pub fn new(window: u64) -> Self {
        Self {
            current_window: Some(window),
            token: random_token(),
        }
    }

    pub fn current_window() -> Result<u64> {
        Ok(now_s()? / TOKEN_WINDOW_SECS)
    }

    pub fn rotate_if_needed(&mut self, window: u64) -> bool {
        if self.current_window == Some(window) {
            return false;
        }
        self.current_window = Some(window);
        self.token = random_token();
        true
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str, window: u64) -> Result<()> {
        if self.current_window != Some(window) {
            return Err(anyhow!("capability token expired"));
        }
        let presented = parse_hex32(presented)?;
        if presented != self.token {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

fn random_token() -> [u8; 32] {
    let mut token = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

pub struct ApiServer {
    cfg: ApiConfig,
    feeds: ApiFeeds,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, feeds: ApiFeeds) -> Self {
        Self { cfg, feeds }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        // Fail early on an unusable database instead of on the first request.
        SqliteDetectionStore::open(&self.cfg.db_path)?;

        let mut token_mgr = CapabilityTokenManager::new(CapabilityTokenManager::current_window()?);
        let token = token_mgr.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let token_path = self.cfg.token_path.clone();
        let join = std::thread::Builder::new()
            .name("roadwatch-api".to_string())
            .spawn(move || {
                let mut ctx = ApiContext {
                    cfg: self.cfg,
                    feeds: self.feeds,
                    video_clients: Arc::new(AtomicUsize::new(0)),
                    shutdown: shutdown_thread,
                };
                if let Err(err) = run_api(listener, &mut ctx, &mut token_mgr) {
                    log::error!("api stopped: {:#}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

struct ApiContext {
    cfg: ApiConfig,
    feeds: ApiFeeds,
    video_clients: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

fn run_api(
    listener: TcpListener,
    ctx: &mut ApiContext,
    token_mgr: &mut CapabilityTokenManager,
) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, ctx, token_mgr) {
                    log::warn!("api request rejected: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    ctx: &ApiContext,
    token_mgr: &mut CapabilityTokenManager,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json(&mut stream, 403, &json!({"success": false, "error": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json(&mut stream, 400, &json!({"success": false, "error": "bad_request"}))?;
            return Err(err);
        }
    };
    log::debug!("{} {} from {}", request.method, request.raw_path, peer);

    if request.method == "GET" && request.path == "/video_feed" {
        return start_video_feed(stream, ctx);
    }

    let (status, body) = match route(&request, ctx, token_mgr) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("{} {} failed: {:#}", request.method, request.path, err);
            (500, json!({"success": false, "error": format!("{:#}", err)}))
        }
    };
    write_json(&mut stream, status, &body)
}

type Response = (u16, Value);

fn route(
    request: &HttpRequest,
    ctx: &ApiContext,
    token_mgr: &mut CapabilityTokenManager,
) -> Result<Response> {
    let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Ok(health(ctx)),
        ("GET", ["api", "detections"]) => list_detections(request, ctx),
        ("GET", ["api", "detections", id]) => get_detection(id, ctx),
        ("GET", ["api", "heatmap"]) => heatmap(request, ctx),
        ("GET", ["api", "stats"]) => stats(request, ctx),
        ("GET", ["api", "location"]) => Ok(location(ctx)),
        ("POST", ["api", "detections", id, "repair"]) => repair(request, id, ctx, token_mgr),
        ("POST", ["api", "report"]) => citizen_report(request, ctx),
        (
            _,
            ["health"]
            | ["video_feed"]
            | ["api", "detections"]
            | ["api", "detections", _]
            | ["api", "detections", _, "repair"]
            | ["api", "heatmap"]
            | ["api", "stats"]
            | ["api", "location"]
            | ["api", "report"],
        ) => Ok(error(405, "method_not_allowed")),
        _ => Ok(error(404, "not_found")),
    }
}

fn error(status: u16, message: &str) -> Response {
    (status, json!({"success": false, "error": message}))
}

fn open_store(ctx: &ApiContext) -> Result<SqliteDetectionStore> {
    SqliteDetectionStore::open(&ctx.cfg.db_path)
}

fn health(ctx: &ApiContext) -> Response {
    let streaming = ctx.feeds.video.as_ref().is_some_and(|feed| !feed.is_closed());
    let database = open_store(ctx).is_ok();
    (
        200,
        json!({
            "status": if database { "ok" } else { "degraded" },
            "timestamp": Utc::now().to_rfc3339(),
            "database": database,
            "streaming": streaming,
        }),
    )
}

fn list_detections(request: &HttpRequest, ctx: &ApiContext) -> Result<Response> {
    let limit = match request.query_parse::<usize>("limit") {
        Ok(limit) => limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT),
        Err(err) => return Ok(error(400, &err.to_string())),
    };
    let severity = match request.query_parse::<Severity>("severity") {
        Ok(severity) => severity,
        Err(err) => return Ok(error(400, &err.to_string())),
    };
    let hours = match request.query_parse::<u32>("hours") {
        Ok(hours) => hours.map(|h| h.min(MAX_LOOKBACK_HOURS)),
        Err(err) => return Ok(error(400, &err.to_string())),
    };

    let store = open_store(ctx)?;
    let detections = match (severity, hours) {
        (Some(severity), Some(hours)) => store
            .query_recent(hours, usize::MAX)?
            .into_iter()
            .filter(|d| d.severity == severity)
            .take(limit)
            .collect(),
        (Some(severity), None) => store.query_by_severity(severity, limit)?,
        (None, Some(hours)) => store.query_recent(hours, limit)?,
        (None, None) => store.query_all(limit)?,
    };
    Ok((
        200,
        json!({
            "success": true,
            "count": detections.len(),
            "detections": detections,
        }),
    ))
}

fn get_detection(id: &str, ctx: &ApiContext) -> Result<Response> {
    let Ok(id) = id.parse::<i64>() else {
        return Ok(error(400, "detection id must be an integer"));
    };
    match open_store(ctx)?.get_detection(id)? {
        Some(detection) => Ok((200, json!({"success": true, "detection": detection}))),
        None => Ok(error(404, "detection_not_found")),
    }
}

fn heatmap(request: &HttpRequest, ctx: &ApiContext) -> Result<Response> {
    let limit = match request.query_parse::<usize>("limit") {
        Ok(limit) => limit.unwrap_or(DEFAULT_HEATMAP_LIMIT),
        Err(err) => return Ok(error(400, &err.to_string())),
    };
    let points = open_store(ctx)?.get_heatmap(limit)?;
    Ok((
        200,
        json!({"success": true, "count": points.len(), "data": points}),
    ))
}

fn stats(request: &HttpRequest, ctx: &ApiContext) -> Result<Response> {
    let days = match request.query_parse::<u32>("days") {
        Ok(days) => days.unwrap_or(DEFAULT_STATS_DAYS).min(MAX_LOOKBACK_DAYS),
        Err(err) => return Ok(error(400, &err.to_string())),
    };
    let stats = open_store(ctx)?.get_statistics(days)?;
    Ok((200, json!({"success": true, "stats": stats})))
}

fn location(ctx: &ApiContext) -> Response {
    let resolved = ctx
        .feeds
        .location
        .as_ref()
        .and_then(|shared| shared.lock().ok().and_then(|last| *last));
    let (point, source) = match resolved {
        Some(resolution) => (resolution.point(), resolution.provenance),
        None => (ctx.cfg.default_point, Provenance::Default),
    };
    (
        200,
        json!({
            "success": true,
            "latitude": point.latitude,
            "longitude": point.longitude,
            "source": source,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn repair(
    request: &HttpRequest,
    id: &str,
    ctx: &ApiContext,
    token_mgr: &mut CapabilityTokenManager,
) -> Result<Response> {
    if request.has_query_token() {
        return Ok(error(400, "token_query_param_not_allowed"));
    }
    let Some(token) = request.bearer_token() else {
        return Ok(error(401, "missing_token"));
    };
    let window = CapabilityTokenManager::current_window()?;
    if token_mgr.rotate_if_needed(window) {
        if let Some(path) = &ctx.cfg.token_path {
            write_token_file(path, &token_mgr.token_hex())?;
        } else {
            log::warn!("api capability token rotated; configure ROADWATCH_API_TOKEN_PATH to persist");
            log::warn!(
                "api capability token (handle securely): {}",
                token_mgr.token_hex()
            );
        }
    }
    if let Err(err) = token_mgr.validate(&token, window) {
        log::warn!("repair update refused: {:#}", err);
        return Ok(error(401, "invalid_token"));
    }

    let Ok(id) = id.parse::<i64>() else {
        return Ok(error(400, "detection id must be an integer"));
    };
    let body: Value = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(err) => return Ok(error(400, &format!("invalid json: {}", err))),
    };
    let Some(status) = body.get("status").and_then(Value::as_str) else {
        return Ok(error(400, "missing status"));
    };
    let status = match status.parse::<RepairStatus>() {
        Ok(status) => status,
        Err(err) => return Ok(error(400, &err.to_string())),
    };
    let notes = body.get("notes").and_then(Value::as_str);

    let mut store = open_store(ctx)?;
    if !store.update_repair_status(id, status, notes)? {
        return Ok(error(404, "detection_not_found"));
    }
    log::info!("detection {} marked {}", id, status);
    Ok((200, json!({"success": true, "id": id, "repair_status": status})))
}

fn citizen_report(request: &HttpRequest, ctx: &ApiContext) -> Result<Response> {
    let payload: ReportPayload = match serde_json::from_slice(&request.body) {
        Ok(payload) => payload,
        Err(err) => return Ok(error(400, &format!("invalid report: {}", err))),
    };
    let new = match citizen_detection(payload) {
        Ok(new) => new,
        Err(err) => return Ok(error(400, &format!("{:#}", err))),
    };
    let id = open_store(ctx)?.add_detection(&new)?;
    log::info!(
        "citizen report #{} {} at ({:.6}, {:.6})",
        id,
        new.severity,
        new.latitude,
        new.longitude
    );
    Ok((
        201,
        json!({
            "success": true,
            "detection_id": id,
            "message": "report stored",
        }),
    ))
}

/// Validate a submitted report and turn it into a store row.
pub fn citizen_detection(payload: ReportPayload) -> Result<NewDetection> {
    let point = GeoPoint::new(payload.latitude, payload.longitude);
    if !point.is_valid() {
        return Err(anyhow!(
            "coordinates ({}, {}) out of range",
            payload.latitude,
            payload.longitude
        ));
    }
    if !(0.0..=1.0).contains(&payload.confidence) {
        return Err(anyhow!("confidence must be within [0, 1]"));
    }
    let severity: Severity = payload.severity.parse()?;
    let timestamp = DateTime::parse_from_rfc3339(&payload.timestamp)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let image_base64 = match payload.image_base64 {
        Some(encoded) => {
            // Data URLs carry a `data:image/jpeg;base64,` prefix.
            let data = encoded
                .split_once(',')
                .map(|(_, data)| data.to_string())
                .unwrap_or(encoded);
            BASE64
                .decode(data.as_bytes())
                .context("image_base64 is not valid base64")?;
            Some(data)
        }
        None => None,
    };
    let location_source = payload
        .location_source
        .as_deref()
        .and_then(|source| source.parse::<Provenance>().ok())
        .unwrap_or(Provenance::Default);
    Ok(NewDetection {
        timestamp,
        latitude: payload.latitude,
        longitude: payload.longitude,
        severity,
        confidence: payload.confidence,
        class_name: payload.class_name,
        image_path: None,
        image_base64,
        camera_source: CITIZEN_CAMERA_SOURCE.to_string(),
        gps_quality: payload.gps_quality.unwrap_or(0),
        location_source,
    })
}

fn start_video_feed(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    let Some(feed) = ctx.feeds.video.clone() else {
        return write_json(&mut stream, 503, &json!({"success": false, "error": "no_video_feed"}));
    };
    let clients = ctx.video_clients.clone();
    if clients.fetch_add(1, Ordering::SeqCst) >= MAX_VIDEO_CLIENTS {
        clients.fetch_sub(1, Ordering::SeqCst);
        return write_json(&mut stream, 503, &json!({"success": false, "error": "too_many_clients"}));
    }
    let shutdown = ctx.shutdown.clone();
    let spawned = std::thread::Builder::new()
        .name("roadwatch-video".to_string())
        .spawn(move || {
            match stream_video(&mut stream, &feed, &shutdown) {
                Ok(frames) => log::debug!("video client left after {} frames", frames),
                Err(err) => log::debug!("video client dropped: {:#}", err),
            }
            clients.fetch_sub(1, Ordering::SeqCst);
        });
    if let Err(err) = spawned {
        ctx.video_clients.fetch_sub(1, Ordering::SeqCst);
        return Err(err).context("spawn video thread");
    }
    Ok(())
}

/// Push the latest annotated frame as multipart JPEG parts until the client
/// disconnects, the feed closes or the server stops.
fn stream_video(stream: &mut TcpStream, feed: &LatestFrame, shutdown: &AtomicBool) -> Result<u64> {
    stream.write_all(
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            FEED_BOUNDARY
        )
        .as_bytes(),
    )?;
    let mut last = 0u64;
    let mut sent = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        let Some(frame) = feed.wait_newer(last, VIDEO_FRAME_WAIT) else {
            if feed.is_closed() {
                break;
            }
            continue;
        };
        last = frame.number;
        let jpeg = encode_jpeg(&frame.image, DEFAULT_JPEG_QUALITY)?;
        stream.write_all(
            format!(
                "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                FEED_BOUNDARY,
                jpeg.len()
            )
            .as_bytes(),
        )?;
        stream.write_all(&jpeg)?;
        stream.write_all(b"\r\n")?;
        sent += 1;
    }
    Ok(sent)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large ({} bytes)", content_length));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body,
        raw_path: raw_path.to_string(),
    })
}

fn write_json(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    raw_path: String,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        self.query.iter().any(|(k, _)| k == "token")
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn query_parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
    {
        match self.query_param(name) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| anyhow!("invalid value '{}' for '{}'", raw, name)),
            None => Ok(None),
        }
    }
}

pub fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))
        .with_context(|| format!("write api token file {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
