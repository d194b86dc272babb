use anyhow::Result;
use image::{Rgb, RgbImage};
use std::io::{Read, Write};
use std::net::TcpStream;
use tempfile::tempdir;

use roadwatch::api::{ApiConfig, ApiFeeds, ApiServer};
use roadwatch::config::RoadwatchConfig;
use roadwatch::detect::StubBackend;
use roadwatch::ingest::{open_source, FileSource};
use roadwatch::pipeline::PipelineOptions;
use roadwatch::storage::{DetectionStore, SqliteDetectionStore};
use roadwatch::{
    BoundingBox, Detection, DetectionPipeline, GeoPoint, LocationResolver, PipelineState,
    Provenance, SeverityEstimator, SeverityThresholds,
};

fn survey_config(dir: &std::path::Path, frames: u32) -> Result<RoadwatchConfig> {
    let mut cfg = RoadwatchConfig::defaults()?;
    cfg.db_path = dir.join("roadwatch.db").to_string_lossy().to_string();
    cfg.detections_dir = dir.join("detections");
    cfg.source.url = format!("stub://road?frames={frames}&potholes=1&seed=7");
    cfg.source.target_fps = 30;
    cfg.detection.backend = "cpu".to_string();
    cfg.detection.frame_skip = 1;
    cfg.location.ip_fallback = false;
    cfg.output.video_path = Some(dir.join("survey.mjpeg"));
    Ok(cfg)
}

#[test]
fn synthetic_survey_persists_detections() -> Result<()> {
    let dir = tempdir()?;
    let cfg = survey_config(dir.path(), 60)?;

    let mut pipeline = DetectionPipeline::from_config(&cfg)?;
    let stats = pipeline.run(open_source(&cfg.source)?)?;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(stats.frames_seen + stats.frames_dropped, 60);
    assert!(stats.detections > 0, "no potholes found: {:?}", stats);
    assert_eq!(stats.persisted, stats.detections);
    assert_eq!(stats.location_sources.get("default"), Some(&stats.detections));

    let store = SqliteDetectionStore::open(&cfg.db_path)?;
    let records = store.query_all(1000)?;
    assert_eq!(records.len() as u64, stats.persisted);
    for record in &records {
        assert_eq!(record.location_source, Provenance::Default);
        assert_eq!(record.camera_source, "main_camera");
        assert!(record.confidence >= 0.6);
        let image = record.image_path.as_deref().expect("snapshot path");
        assert!(std::path::Path::new(image).is_file());
    }
    assert!(dir.path().join("survey.mjpeg").is_file());

    let mut replay = FileSource::new(dir.path().join("survey.mjpeg"), 0)?;
    roadwatch::ingest::FrameSource::connect(&mut replay)?;
    let mut replayed = 0;
    while roadwatch::ingest::FrameSource::next_image(&mut replay)?.is_some() {
        replayed += 1;
    }
    assert_eq!(replayed, stats.frames_seen);
    Ok(())
}

#[test]
fn missing_model_fails_before_streaming() -> Result<()> {
    let dir = tempdir()?;
    let mut cfg = survey_config(dir.path(), 1)?;
    cfg.detection.model_path = Some(dir.path().join("absent.onnx"));
    let err = DetectionPipeline::from_config(&cfg).err().expect("construction must fail");
    assert!(format!("{:#}", err).contains("absent.onnx"));
    Ok(())
}

#[test]
fn image_directory_replay_with_scripted_detector() -> Result<()> {
    let dir = tempdir()?;
    let frames_dir = dir.path().join("frames");
    std::fs::create_dir_all(&frames_dir)?;
    for i in 0..4 {
        RgbImage::from_pixel(500, 500, Rgb([120, 120, 120]))
            .save(frames_dir.join(format!("frame_{i:03}.png")))?;
    }
    let db_path = dir.path().join("replay.db").to_string_lossy().to_string();

    let detector = StubBackend::with_script(vec![
        vec![Detection::new(BoundingBox::new(10, 10, 20, 20), 0.95)],
        vec![Detection::new(BoundingBox::new(100, 100, 150, 150), 0.9)],
        vec![Detection::new(BoundingBox::new(0, 0, 30, 30), 0.55)],
        vec![],
    ]);
    let resolver = LocationResolver::new(GeoPoint::new(12.97, 77.59));
    let mut pipeline = DetectionPipeline::new(
        PipelineOptions::default(),
        Box::new(detector),
        SeverityEstimator::new(SeverityThresholds::default()),
        resolver,
        Box::new(SqliteDetectionStore::open(&db_path)?),
    )?;
    let source = open_source(&roadwatch::config::SourceSettings {
        url: frames_dir.to_string_lossy().to_string(),
        target_fps: 20,
        width: 500,
        height: 500,
    })?;
    let stats = pipeline.run(source)?;
    assert_eq!(stats.frames_seen + stats.frames_dropped, 4);

    let store = SqliteDetectionStore::open(&db_path)?;
    let all = store.query_all(10)?;
    assert!(all.iter().all(|r| r.latitude == 12.97 && r.longitude == 77.59));
    assert!(all.iter().all(|r| r.confidence >= 0.6));
    Ok(())
}

#[test]
fn api_serves_pipeline_results() -> Result<()> {
    let dir = tempdir()?;
    let mut cfg = survey_config(dir.path(), 40)?;
    cfg.output.video_path = None;
    cfg.api_addr = "127.0.0.1:0".to_string();

    let mut pipeline = DetectionPipeline::from_config(&cfg)?;
    let api = ApiServer::new(
        ApiConfig::from_config(&cfg),
        ApiFeeds {
            video: Some(pipeline.annotated_feed()),
            location: Some(pipeline.last_location()),
        },
    )
    .spawn()?;
    let stats = pipeline.run(open_source(&cfg.source)?)?;

    let mut stream = TcpStream::connect(api.addr)?;
    stream.write_all(b"GET /api/stats?days=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let body = response.splitn(2, "\r\n\r\n").nth(1).unwrap_or("");
    let value: serde_json::Value = serde_json::from_str(body)?;
    assert_eq!(value["stats"]["total"], stats.persisted);

    let mut stream = TcpStream::connect(api.addr)?;
    stream.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let body = response.splitn(2, "\r\n\r\n").nth(1).unwrap_or("");
    let value: serde_json::Value = serde_json::from_str(body)?;
    assert_eq!(value["streaming"], false);

    api.stop()?;
    Ok(())
}
