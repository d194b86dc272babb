//! gps_check - check that a GPS receiver is wired up and producing fixes

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::time::Duration;

use roadwatch::telemetry::gps::{
    DEFAULT_GPS_BAUD, DEFAULT_GPS_MAX_RETRIES, DEFAULT_GPS_MIN_SATELLITES, DEFAULT_GPS_PORT,
};
use roadwatch::telemetry::{GpsReceiver, GpsSettings};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Serial device or tcp://host:port NMEA stream.
    #[arg(long, env = "ROADWATCH_GPS_PORT", default_value = DEFAULT_GPS_PORT)]
    port: String,
    #[arg(long, default_value_t = DEFAULT_GPS_BAUD)]
    baud: u32,
    /// Poll cycles before giving up.
    #[arg(long, default_value_t = 30)]
    attempts: u64,
    /// Pause between poll cycles, milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    #[arg(long, default_value_t = DEFAULT_GPS_MIN_SATELLITES)]
    min_satellites: u32,
    /// Keep polling after the first fix and report every one.
    #[arg(long)]
    follow: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(&args.ui, is_tty, !stdout_is_tty);

    let settings = GpsSettings {
        port: args.port.clone(),
        baud: args.baud,
        max_retries: DEFAULT_GPS_MAX_RETRIES,
        min_satellites: args.min_satellites,
        ..GpsSettings::default()
    };
    let mut gps = {
        let mut stage = ui.stage(&format!("Open GPS on {}", args.port));
        let gps = GpsReceiver::open(settings);
        if !gps.is_connected() {
            stage.fail("not connected");
        }
        gps
    };
    if !gps.is_connected() {
        println!("{}", serde_json::to_string_pretty(&gps.get_diagnostics())?);
        return Err(anyhow!("could not open GPS on {}", args.port));
    }

    let bar = ui.counter("Waiting for fix", args.attempts);
    let mut fixes = 0u64;
    for _ in 0..args.attempts {
        bar.inc(1);
        if let Some(fix) = gps.poll_fix() {
            fixes += 1;
            bar.println(format!(
                "fix ({:.6}, {:.6}) quality={} sats={} hdop={}",
                fix.latitude,
                fix.longitude,
                fix.quality.ordinal(),
                fix.satellites,
                fix.hdop.map(|h| format!("{:.1}", h)).unwrap_or_else(|| "-".to_string())
            ));
            if !args.follow {
                break;
            }
        }
        if !gps.is_connected() {
            break;
        }
        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }
    bar.finish_and_clear();

    let diagnostics = gps.get_diagnostics();
    gps.close();
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    if fixes == 0 {
        return Err(anyhow!(
            "no valid fix after {} polls ({} parse errors)",
            args.attempts,
            diagnostics.parse_errors
        ));
    }
    Ok(())
}
