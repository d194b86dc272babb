use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use roadwatch::config::RoadwatchConfig;
use roadwatch::Provenance;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ROADWATCH_CONFIG",
        "ROADWATCH_DB_PATH",
        "ROADWATCH_SOURCE_URL",
        "ROADWATCH_API_ADDR",
        "ROADWATCH_API_TOKEN_PATH",
        "ROADWATCH_REPORT_URL",
        "ROADWATCH_GPS_PORT",
        "ROADWATCH_FRAME_SKIP",
        "ROADWATCH_AERIAL",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let token_path = file.path().with_extension("token");
    let json = format!(
        r#"{{
            "db_path": "roads_prod.db",
            "camera_tag": "drone:survey-1",
            "api": {{
                "addr": "0.0.0.0:9000",
                "token_path": "{}"
            }},
            "source": {{
                "url": "rtsp://drone-1/live",
                "target_fps": 12,
                "width": 1280,
                "height": 720
            }},
            "detection": {{
                "frame_skip": 3,
                "confidence_threshold": 0.45,
                "severity_low": 0.02,
                "severity_medium": 0.08
            }},
            "location": {{
                "priority": ["local_gps_module", "ip_geolocation"],
                "default_latitude": 12.97,
                "default_longitude": 77.59
            }},
            "output": {{
                "max_duration_secs": 600
            }}
        }}"#,
        token_path.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("ROADWATCH_CONFIG", file.path());
    std::env::set_var("ROADWATCH_FRAME_SKIP", "5");
    std::env::set_var("ROADWATCH_REPORT_URL", "http://reports.example/api/report");

    let cfg = RoadwatchConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "roads_prod.db");
    assert_eq!(cfg.camera_tag, "drone:survey-1");
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.api_token_path.unwrap(), token_path);
    assert_eq!(cfg.source.url, "rtsp://drone-1/live");
    assert_eq!(cfg.source.target_fps, 12);
    assert_eq!(cfg.source.width, 1280);
    assert_eq!(cfg.source.height, 720);
    assert_eq!(cfg.detection.frame_skip, 5);
    assert!((cfg.detection.confidence_threshold - 0.45).abs() < 1e-6);
    assert_eq!(cfg.detection.severity.low, 0.02);
    assert_eq!(cfg.detection.severity.medium, 0.08);
    assert_eq!(
        cfg.location.priority,
        vec![Provenance::LocalGpsModule, Provenance::IpGeolocation]
    );
    assert_eq!(cfg.location.default_point.latitude, 12.97);
    assert!(cfg.report.enabled);
    assert_eq!(cfg.report.url, "http://reports.example/api/report");
    assert_eq!(cfg.output.max_duration, Some(Duration::from_secs(600)));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
db_path = "roads.db"

[drone]
aerial = true
fov_horizontal = 84.0
fov_vertical = 53.0

[gps]
enabled = true
port = "tcp://127.0.0.1:10110"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("ROADWATCH_CONFIG", file.path());

    let cfg = RoadwatchConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "roads.db");
    assert!(cfg.drone.aerial);
    assert!(cfg.drone.telemetry.is_some());
    assert_eq!(cfg.drone.fov.horizontal_deg, 84.0);
    assert!(cfg.gps.enabled);
    assert_eq!(cfg.gps.settings.port, "tcp://127.0.0.1:10110");

    clear_env();
}

#[test]
fn env_only_configuration_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROADWATCH_DB_PATH", "env.db");
    std::env::set_var("ROADWATCH_SOURCE_URL", "stub://road?frames=5");
    std::env::set_var("ROADWATCH_AERIAL", "0");

    let cfg = RoadwatchConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "env.db");
    assert_eq!(cfg.source.url, "stub://road?frames=5");
    assert!(!cfg.drone.aerial);
    assert!(!cfg.report.enabled);
    assert_eq!(cfg.detection.acceptance_confidence, 0.6);

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROADWATCH_FRAME_SKIP", "0");
    assert!(RoadwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("ROADWATCH_AERIAL", "sometimes");
    assert!(RoadwatchConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"{"location": {"priority": ["default"]}}"#,
    )
    .expect("write config");
    std::env::set_var("ROADWATCH_CONFIG", file.path());
    assert!(RoadwatchConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"camera_tag": "Front Camera"}"#)
        .expect("write config");
    std::env::set_var("ROADWATCH_CONFIG", file.path());
    assert!(RoadwatchConfig::load().is_err());

    clear_env();
}
