//! detections - query and maintain the detection database

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;

use roadwatch::storage::{DetectionStore, SqliteDetectionStore};
use roadwatch::{DetectionRecord, GeoBounds, RepairStatus, Severity};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection database.
    #[arg(long, env = "ROADWATCH_DB_PATH", default_value = "roadwatch.db")]
    db_path: String,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List detections, newest first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only this severity (Low, Medium, High).
        #[arg(long)]
        severity: Option<Severity>,
        /// Only detections from the last N hours.
        #[arg(long)]
        hours: Option<u32>,
        /// Bounding box as lat_min,lat_max,lon_min,lon_max.
        #[arg(long, value_name = "BOUNDS")]
        area: Option<String>,
    },
    /// Show one detection.
    Show { id: i64 },
    /// Summary counts over the last N days.
    Stats {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Weighted points for heatmap rendering.
    Heatmap {
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
    /// Update the repair status of a detection.
    Repair {
        id: i64,
        /// pending, in_progress, completed or rejected
        status: RepairStatus,
        #[arg(long)]
        notes: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(&args.ui, is_tty, !stdout_is_tty);

    let mut store = {
        let _stage = ui.stage("Open detection database");
        SqliteDetectionStore::open(&args.db_path)?
    };

    match args.command {
        Command::List {
            limit,
            severity,
            hours,
            area,
        } => {
            let records = {
                let _stage = ui.stage("Query detections");
                list(&store, limit, severity, hours, area.as_deref())?
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_table(&records);
            }
        }
        Command::Show { id } => {
            let record = store
                .get_detection(id)?
                .ok_or_else(|| anyhow!("no detection with id {}", id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Stats { days } => {
            let stats = store.get_statistics(days)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("last {} days: {} detections", stats.period_days, stats.total);
                for (severity, n) in &stats.by_severity {
                    println!("  {:<8} {}", severity, n);
                }
                println!("  avg confidence   {:.2}", stats.avg_confidence);
                println!("  repairs done     {}", stats.repairs_completed);
                println!("  pending repairs  {}", stats.pending_repairs);
            }
        }
        Command::Heatmap { limit } => {
            let points = store.get_heatmap(limit)?;
            println!("{}", serde_json::to_string_pretty(&points)?);
        }
        Command::Repair { id, status, notes } => {
            if !store.update_repair_status(id, status, notes.as_deref())? {
                return Err(anyhow!("no detection with id {}", id));
            }
            println!("detection {} marked {}", id, status);
        }
    }
    Ok(())
}

fn list(
    store: &SqliteDetectionStore,
    limit: usize,
    severity: Option<Severity>,
    hours: Option<u32>,
    area: Option<&str>,
) -> Result<Vec<DetectionRecord>> {
    let mut records = match (area, hours, severity) {
        (Some(area), _, _) => store.query_by_area(&parse_bounds(area)?, usize::MAX)?,
        (None, Some(hours), _) => store.query_recent(hours, usize::MAX)?,
        (None, None, Some(severity)) => store.query_by_severity(severity, limit)?,
        (None, None, None) => store.query_all(limit)?,
    };
    if let Some(hours) = hours.filter(|_| area.is_some()) {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(i64::from(hours));
        records.retain(|r| r.timestamp >= cutoff);
    }
    if let Some(severity) = severity {
        records.retain(|r| r.severity == severity);
    }
    records.truncate(limit);
    Ok(records)
}

fn parse_bounds(raw: &str) -> Result<GeoBounds> {
    let values = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("area must be four numbers: lat_min,lat_max,lon_min,lon_max"))?;
    let [lat_min, lat_max, lon_min, lon_max] = values.as_slice() else {
        return Err(anyhow!("area must be four numbers: lat_min,lat_max,lon_min,lon_max"));
    };
    GeoBounds::new(*lat_min, *lat_max, *lon_min, *lon_max)
}

fn print_table(records: &[DetectionRecord]) {
    if records.is_empty() {
        println!("no detections");
        return;
    }
    println!(
        "{:>6}  {:<20}  {:<7}  {:>5}  {:>11}  {:>11}  {:<18}  {:<12}  {}",
        "id", "time (utc)", "sev", "conf", "lat", "lon", "location", "repair", "camera"
    );
    for r in records {
        println!(
            "{:>6}  {:<20}  {:<7}  {:>5.2}  {:>11.6}  {:>11.6}  {:<18}  {:<12}  {}",
            r.id,
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.severity,
            r.confidence,
            r.latitude,
            r.longitude,
            r.location_source,
            r.repair_status,
            r.camera_source
        );
    }
}
