//! Configuration loading from TOML files and environment overrides.

use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

use beamline_align::config::AlignConfig;
use beamline_align::error::AlignError;
use beamline_align::procedures::alignment::StatPosition;
use beamline_align::procedures::motions::MotorTable;
use beamline_align::tracing_setup::OutputFormat;

fn write_toml(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let config = AlignConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/beamline_align.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config, AlignConfig::default());
}

#[test]
#[serial]
fn test_partial_file_keeps_defaults() {
    let file = write_toml(
        r#"
[application]
log_level = "debug"
log_format = "json"

[devices]
detector = "d11"

[centring]
mirror_diff_acceptance = 0.05

[centring.pin_scan]
sy_num = 31
"#,
    );

    let config = AlignConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.application.log_format, OutputFormat::Json);
    assert_eq!(config.devices.detector, "d11");
    assert_eq!(config.devices.detector_field, "value");
    assert_eq!(config.devices.sample_y, "sample_stage_y");
    assert_eq!(config.centring.mirror_diff_acceptance, 0.05);
    assert_eq!(config.centring.mirror_height_adjust, 0.01);
    assert_eq!(config.centring.pin_scan.sy_num, 31);
    assert_eq!(config.centring.pin_scan.mirror_num, 51);
    assert_eq!(config.settle.poll_delay, 1.0);
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AlignConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, AlignConfig::default());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_toml("[centring]\nmax_iterations = 3\n");
    std::env::set_var("BEAMLINE_ALIGN_CENTRING__MAX_ITERATIONS", "8");
    std::env::set_var("BEAMLINE_ALIGN_SETTLE__POLL_DELAY", "0.25");

    let loaded = AlignConfig::load_from(file.path());

    std::env::remove_var("BEAMLINE_ALIGN_CENTRING__MAX_ITERATIONS");
    std::env::remove_var("BEAMLINE_ALIGN_SETTLE__POLL_DELAY");

    let config = loaded.unwrap();
    assert_eq!(config.centring.max_iterations, 8);
    assert_eq!(config.settle.poll_delay, 0.25);
}

#[test]
#[serial]
fn test_malformed_value_is_a_config_error() {
    let file = write_toml("[centring]\nmax_iterations = \"many\"\n");
    let err = AlignConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, AlignError::Config(_)));
}

#[test]
#[serial]
fn test_validation_rejects_unusable_scan() {
    let file = write_toml("[centring.tth_scan]\nstart = -1.0\nend = 1.0\nnum = 1\n");
    let config = AlignConfig::load_from(file.path()).unwrap();
    assert!(matches!(config.validate(), Err(AlignError::Configuration(_))));
}

#[test]
fn test_motor_table_file() {
    let file = write_toml("50 = 0.182\n100 = 0.405\n500 = 1.23\n");
    let table = MotorTable::from_toml_file(file.path()).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.lookup(100.0).unwrap(), 0.405);
}

#[test]
fn test_stat_position_names_in_config() {
    #[derive(serde::Deserialize)]
    struct Alignment {
        centre_type: StatPosition,
    }
    let parsed: Alignment = toml::from_str("centre_type = \"d_max\"").unwrap();
    assert_eq!(parsed.centre_type, StatPosition::DMax);
}
