//! roadwatchd - pothole detection daemon
//!
//! This daemon:
//! 1. Loads configuration (`ROADWATCH_CONFIG` file, then `ROADWATCH_*` overrides)
//! 2. Builds the detection pipeline (detector, severity, location chain, store, reporter)
//! 3. Serves the HTTP API with the live video feed and last resolved location
//! 4. Captures from the configured source until end of stream or Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc;

use roadwatch::api::{ApiConfig, ApiFeeds, ApiHandle, ApiServer};
use roadwatch::config::RoadwatchConfig;
use roadwatch::ingest::open_source;
use roadwatch::DetectionPipeline;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Serve the API over the existing database without capturing.
    #[arg(long, env = "ROADWATCH_API_ONLY", conflicts_with = "no_api")]
    api_only: bool,
    /// Capture without starting the HTTP API.
    #[arg(long, env = "ROADWATCH_NO_API")]
    no_api: bool,
    /// Exit when the stream ends instead of serving the API until Ctrl-C.
    #[arg(long)]
    exit_on_eos: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = RoadwatchConfig::load()?;
    log::info!(
        "roadwatchd {} starting. db={} source={} camera={}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path,
        cfg.source.url,
        cfg.camera_tag
    );

    let (tx, rx) = mpsc::channel();

    if args.api_only {
        let api = spawn_api(&cfg, ApiFeeds::default())?;
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .context("error setting Ctrl-C handler")?;
        log::info!("roadwatchd serving API only; waiting for shutdown signal (Ctrl-C)...");
        let _ = rx.recv();
        log::info!("shutdown signal received, stopping API server...");
        return api.stop();
    }

    let mut pipeline = DetectionPipeline::from_config(&cfg)?;
    let api = if args.no_api {
        None
    } else {
        Some(spawn_api(
            &cfg,
            ApiFeeds {
                video: Some(pipeline.annotated_feed()),
                location: Some(pipeline.last_location()),
            },
        )?)
    };

    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        stop.stop();
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let outcome = match open_source(&cfg.source) {
        Ok(source) => pipeline.run(source),
        Err(err) => {
            pipeline.shutdown();
            Err(err.context("open capture source"))
        }
    };
    match &outcome {
        Ok(stats) => log::info!("survey summary: {}", serde_json::to_string(stats)?),
        Err(err) => log::error!("pipeline failed: {:#}", err),
    }

    if let Some(api) = api {
        if outcome.is_ok() && !args.exit_on_eos && !pipeline.stop_handle().is_stopped() {
            log::info!("capture finished; API still serving until Ctrl-C");
            let _ = rx.recv();
        }
        log::info!("stopping API server...");
        api.stop()?;
    }
    outcome.map(|_| ())
}

fn spawn_api(cfg: &RoadwatchConfig, feeds: ApiFeeds) -> Result<ApiHandle> {
    let handle = ApiServer::new(ApiConfig::from_config(cfg), feeds).spawn()?;
    if let Some(path) = &handle.token_path {
        log::info!("api capability token written to {}", path.display());
    } else {
        log::warn!(
            "api capability token (handle securely): {}",
            handle.token
        );
    }
    Ok(handle)
}
