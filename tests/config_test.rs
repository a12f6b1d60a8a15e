//! Configuration loading from TOML files and the environment.

use std::fs;

use rust_microscan::config::{ArrivalPolicy, ConfigError, LogFormat, ObjectPolicy, ScopeConfig};
use rust_microscan::ScopeError;
use serial_test::serial;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("microscan.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
#[serial]
fn missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = ScopeConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, ScopeConfig::default());
}

#[test]
#[serial]
fn partial_file_overrides_only_what_it_names() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[application]
log_format = "json"

[run]
arrival_timeout_ms = 2500
arrival_policy = "abort"
object_policy = "primary"

[run.autofocus]
z_fine_step = 0.5
secondary_offset = 12.0
"#,
    );

    let config = ScopeConfig::load_from(&path).unwrap();
    assert_eq!(config.application.log_format, LogFormat::Json);
    assert_eq!(config.run.arrival_timeout_ms, 2500);
    assert_eq!(config.run.arrival_policy, ArrivalPolicy::Abort);
    assert_eq!(config.run.object_policy, ObjectPolicy::Primary);
    assert_eq!(config.run.autofocus.z_fine_step, 0.5);
    assert_eq!(config.run.autofocus.secondary_offset, Some(12.0));
    // Untouched keys keep their defaults
    assert_eq!(config.run.settle_time_ms, 200);
    assert_eq!(config.run.autofocus.z_coarse_step, 5.0);
    assert_eq!(config.run.autofocus.weights.gradient, 0.5);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[run]\nsettle_time_ms = 150\n");

    std::env::set_var("MICROSCAN_RUN__SETTLE_TIME_MS", "75");
    std::env::set_var("MICROSCAN_RUN__AUTOFOCUS__MIN_FOCUS_SCORE", "12.5");
    let loaded = ScopeConfig::load_from(&path);
    std::env::remove_var("MICROSCAN_RUN__SETTLE_TIME_MS");
    std::env::remove_var("MICROSCAN_RUN__AUTOFOCUS__MIN_FOCUS_SCORE");

    let config = loaded.unwrap();
    assert_eq!(config.run.settle_time_ms, 75);
    assert_eq!(config.run.autofocus.min_focus_score, 12.5);
}

#[test]
#[serial]
fn invalid_values_are_rejected_at_load() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "[run.detection]\nmin_area = 900.0\nmax_area = 100.0\n",
    );

    let err = ScopeConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
    assert!(matches!(ScopeError::from(err), ScopeError::Configuration(_)));
}

#[test]
#[serial]
fn malformed_toml_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[run\nsettle_time_ms = ");

    let err = ScopeConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::LoadError(_)));
}

#[test]
#[serial]
fn shipped_config_file_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/microscan.toml");
    let config = ScopeConfig::load_from(path).unwrap();
    assert_eq!(config.application.name, "microscan");
    assert!(config.run.autofocus_enabled);
}
