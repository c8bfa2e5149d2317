use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use conduct_witness::config::MonitorConfig;
use conduct_witness::{open_identity_matcher, IdentityMatcher};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CONDUCT_CONFIG",
        "CONDUCT_OUTPUT_DIR",
        "CONDUCT_SOURCE",
        "CONDUCT_SCHEDULE_PATH",
        "CONDUCT_FRAME_SKIP",
        "CONDUCT_BUFFER_SECS",
        "CONDUCT_SLEEP_DEBOUNCE_SECS",
        "CONDUCT_SIMILARITY_THRESHOLD",
        "CONDUCT_MAX_FRAMES",
        "CONDUCT_ROSTER_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");
    assert_eq!(cfg, MonitorConfig::default());
    let settings = cfg.pipeline_settings().unwrap();
    assert_eq!(settings.frame_skip, 2);
    assert_eq!(settings.buffer, Duration::from_secs(10));
    assert_eq!(settings.sleep_debounce, Duration::from_secs(10));
    assert_eq!(settings.similarity_threshold, 0.5);
    assert_eq!(settings.max_frames, Some(9000));
    assert_eq!(cfg.source.path, "stub://classroom");
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "output_dir": "/var/lib/conduct/room12",
        "source": {
            "path": "/srv/lessons/room12.y4m",
            "fps": 25
        },
        "detection": {
            "frame_skip": 3,
            "sleep_debounce_secs": 4.5,
            "schedule_path": "/srv/lessons/room12.schedule.json"
        },
        "recording": { "buffer_secs": 8 },
        "identity": { "similarity_threshold": 0.6 },
        "limits": { "max_frames": 3000, "max_duration_secs": 2700 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CONDUCT_CONFIG", file.path());
    std::env::set_var("CONDUCT_FRAME_SKIP", "1");
    std::env::set_var("CONDUCT_OUTPUT_DIR", "/tmp/conduct_out");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.output_dir.to_str(), Some("/tmp/conduct_out"));
    assert_eq!(cfg.source.path, "/srv/lessons/room12.y4m");
    assert_eq!(cfg.source.fps, 25);
    assert_eq!(cfg.source.width, 640);
    assert_eq!(cfg.detection.frame_skip, 1);
    assert_eq!(
        cfg.detection.schedule_path.as_deref().and_then(|p| p.to_str()),
        Some("/srv/lessons/room12.schedule.json")
    );
    let settings = cfg.pipeline_settings().unwrap();
    assert_eq!(settings.sleep_debounce, Duration::from_millis(4500));
    assert_eq!(settings.buffer, Duration::from_secs(8));
    assert_eq!(settings.similarity_threshold, 0.6);
    assert_eq!(settings.max_frames, Some(3000));
    assert_eq!(settings.max_duration, Some(Duration::from_secs(2700)));

    clear_env();
}

#[test]
fn toml_config_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
output_dir = "out"

[recording]
buffer_secs = 15

[identity]
similarity_threshold = 0.7
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = MonitorConfig::load_from(file.path()).expect("load toml");
    assert_eq!(cfg.recording.buffer_secs, 15.0);
    assert_eq!(cfg.identity.similarity_threshold, 0.7);
    assert_eq!(cfg.detection.frame_skip, 2);
}

#[test]
fn rejects_invalid_values_before_running() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for (key, value) in [
        ("CONDUCT_FRAME_SKIP", "0"),
        ("CONDUCT_BUFFER_SECS", "0"),
        ("CONDUCT_BUFFER_SECS", "-3"),
        ("CONDUCT_SLEEP_DEBOUNCE_SECS", "-1"),
        ("CONDUCT_SIMILARITY_THRESHOLD", "1.2"),
        ("CONDUCT_MAX_FRAMES", "0"),
        ("CONDUCT_FRAME_SKIP", "two"),
    ] {
        std::env::set_var(key, value);
        assert!(MonitorConfig::load().is_err(), "{key}={value} accepted");
        std::env::remove_var(key);
    }

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"recording": {"buffer": 5}}"#).expect("write");
    std::env::set_var("CONDUCT_CONFIG", file.path());
    let err = MonitorConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}

#[test]
fn roster_path_enables_attribution_when_present() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let roster = dir.path().join("roster.json");
    std::fs::write(
        &roster,
        r#"{"students": [{"name": "Ivanov", "embedding": [0.6, 0.8]}]}"#,
    )
    .expect("write roster");

    let mut file = NamedTempFile::new().expect("temp config");
    let json = format!(
        r#"{{"identity": {{"roster_path": {}}}}}"#,
        serde_json::to_string(&roster).expect("path json")
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("CONDUCT_CONFIG", file.path());

    let cfg = MonitorConfig::load().expect("load config");
    assert_eq!(cfg.identity.roster_path.as_deref(), Some(roster.as_path()));
    let matcher = open_identity_matcher(cfg.identity.roster_path.as_deref(), dir.path())
        .expect("open roster");
    assert!(matcher.is_available());

    clear_env();
}

#[test]
fn unset_or_missing_roster_falls_back_to_no_database() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");
    assert_eq!(cfg.identity.roster_path, None);
    let dir = tempfile::tempdir().expect("temp dir");
    let matcher = open_identity_matcher(cfg.identity.roster_path.as_deref(), dir.path())
        .expect("no roster");
    assert!(!matcher.is_available());

    let missing = dir.path().join("missing_roster.json");
    std::env::set_var("CONDUCT_ROSTER_PATH", &missing);
    let cfg = MonitorConfig::load().expect("load with roster override");
    assert_eq!(cfg.identity.roster_path.as_deref(), Some(missing.as_path()));
    let matcher = open_identity_matcher(cfg.identity.roster_path.as_deref(), dir.path())
        .expect("missing roster");
    assert!(!matcher.is_available());

    clear_env();
}
