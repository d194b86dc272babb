//! survey_plan - lawnmower waypoint grid for an aerial road survey

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use roadwatch::geo::{
    ground_coverage, DEFAULT_FOV_HORIZONTAL_DEG, DEFAULT_FOV_VERTICAL_DEG,
    DEFAULT_SURVEY_ALTITUDE_M, DEFAULT_SURVEY_OVERLAP_PCT,
};
use roadwatch::{plan_survey, CameraFov, GeoPoint, Waypoint};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Latitude of the south-west corner.
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    /// Longitude of the south-west corner.
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,
    /// East-west extent in meters.
    #[arg(long)]
    width: f64,
    /// North-south extent in meters.
    #[arg(long)]
    length: f64,
    #[arg(long, default_value_t = DEFAULT_SURVEY_ALTITUDE_M)]
    altitude: f64,
    /// Image overlap between adjacent passes, percent.
    #[arg(long, default_value_t = DEFAULT_SURVEY_OVERLAP_PCT)]
    overlap: f64,
    #[arg(long, default_value_t = DEFAULT_FOV_HORIZONTAL_DEG)]
    fov_h: f64,
    #[arg(long, default_value_t = DEFAULT_FOV_VERTICAL_DEG)]
    fov_v: f64,
    /// Write the plan to this file instead of stdout.
    #[arg(long)]
    output: Option<String>,
}

#[derive(Serialize)]
struct SurveyPlan {
    start: GeoPoint,
    area_width_m: f64,
    area_length_m: f64,
    altitude_m: f64,
    overlap_pct: f64,
    footprint_m: [f64; 2],
    waypoints: Vec<Waypoint>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let start = GeoPoint::new(args.lat, args.lon);
    if !start.is_valid() {
        anyhow::bail!("start coordinate ({}, {}) out of range", args.lat, args.lon);
    }
    let fov = CameraFov::new(args.fov_h, args.fov_v)?;
    let waypoints = plan_survey(start, args.width, args.length, args.altitude, args.overlap, fov)?;
    let (cover_w, cover_h) = ground_coverage(args.altitude, fov);
    log::info!(
        "{} waypoints, footprint {:.1} x {:.1} m at {:.0} m",
        waypoints.len(),
        cover_w,
        cover_h,
        args.altitude
    );

    let plan = SurveyPlan {
        start,
        area_width_m: args.width,
        area_length_m: args.length,
        altitude_m: args.altitude,
        overlap_pct: args.overlap,
        footprint_m: [cover_w, cover_h],
        waypoints,
    };
    let json = serde_json::to_string_pretty(&plan)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("write survey plan {}", path))?;
            log::info!("survey plan written to {}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
