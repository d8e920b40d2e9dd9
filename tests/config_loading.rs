//! Layered configuration: defaults, TOML file, then `PROPSTAND_` variables.

use propstand_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use propstand_daq::error::DaqError;
use serial_test::serial;
use std::io::Write;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn shipped_config_matches_defaults() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.rig.x_center_steps(), 8099);
}

#[test]
#[serial]
fn file_values_override_defaults() {
    let file = write_config(
        r#"
[serial]
port = "/dev/ttyACM0"

[air]
rho = 1.19

[propeller]
diameter_inch = 10.0
"#,
    );
    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.serial.port, "/dev/ttyACM0");
    assert_eq!(settings.air.rho, 1.19);
    assert!((settings.propeller.radius_mm() - 127.0).abs() < 1e-9);
    assert_eq!(settings.require_serial_port().unwrap(), "/dev/ttyACM0");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config("[application]\nlog_level = \"warn\"\n");
    std::env::set_var("PROPSTAND_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("PROPSTAND_PROBE__X_DELTA_MM", "1.5");
    let loaded = Settings::load_from(file.path());
    std::env::remove_var("PROPSTAND_APPLICATION__LOG_LEVEL");
    std::env::remove_var("PROPSTAND_PROBE__X_DELTA_MM");

    let settings = loaded.unwrap();
    assert_eq!(settings.application.log_level, "debug");
    assert_eq!(settings.probe.x_delta_mm, 1.5);
}

#[test]
#[serial]
fn invalid_values_are_rejected() {
    let file = write_config("[probe]\nrotation_dir = 2\n");
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(DaqError::Configuration(_))
    ));

    let file = write_config("[rig]\nsteps_per_mm = \"many\"\n");
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(DaqError::Config(_))
    ));
}

#[test]
#[serial]
fn effective_config_round_trips_through_toml() {
    let mut settings = Settings::default();
    settings.rig.tandem = true;
    settings.timing.overall_timeout_ms = Some(60_000);
    let file = write_config(&settings.to_toml().unwrap());
    assert_eq!(Settings::load_from(file.path()).unwrap(), settings);
}
