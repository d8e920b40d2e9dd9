//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the values the stand ships with)
//! 2. An optional TOML file (`config/propstand.toml` by default)
//! 3. Environment variables prefixed with `PROPSTAND_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore so that snake_case field
//! names survive the split:
//!
//! ```text
//! PROPSTAND_APPLICATION__LOG_LEVEL=debug
//! PROPSTAND_SERIAL__PORT=/dev/ttyACM0
//! PROPSTAND_AIR__RHO=1.19
//! ```
//!
//! # Example
//!
//! ```no_run
//! use propstand_daq::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_from("config/propstand.toml")?;
//!     println!("Probe center: {} mm", settings.rig.x_center_mm);
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/propstand.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PROPSTAND_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link to the rig microcontroller
    pub serial: SerialConfig,
    /// Axis geometry and motion parameters
    pub rig: RigConfig,
    /// Sequencer delays and timeouts
    pub timing: TimingConfig,
    /// Probe binning and angle corrections
    pub probe: ProbeConfig,
    /// Motor throttle for sweeps
    pub motors: MotorConfig,
    /// Air properties
    pub air: AirConfig,
    /// Propeller under test
    pub propeller: PropellerConfig,
    /// Load cell arms and factors sent with `init`
    pub calibration: CalibrationConfig,
    /// Trace output
    pub storage: StorageConfig,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Default tracing filter directive (trace, debug, info, warn, error)
    pub log_level: String,
    /// Capacity of the session event broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "propstand".to_string(),
            log_level: "info".to_string(),
            broadcast_capacity: 1024,
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Terminator appended to every outbound command
    pub line_terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            line_terminator: "\n".to_string(),
        }
    }
}

/// Axis geometry and motion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Stepper drive ratio, encoder steps per mm of travel
    pub steps_per_mm: f64,
    /// Probe X position over the hub, mm from home
    pub x_center_mm: f64,
    /// Maximum Y travel from home, mm
    pub y_max_mm: f64,
    /// XY feed used for measurement moves; Y feed is a third of it
    pub feed_xy: u32,
    /// Feed used for jog moves (return home)
    pub jog_feed: u32,
    /// Axis limits sent with the `l|...` command
    pub x_max_speed: u32,
    pub y_max_speed: u32,
    pub x_max_accel: u32,
    pub y_max_accel: u32,
    /// Position error accepted as "arrived", in steps
    pub arrival_tolerance_steps: i64,
    /// Frames collected at each waypoint after arrival
    pub samples_per_point: usize,
    /// Two co-measured rotors (13-field frames)
    pub tandem: bool,
    /// Corner the probe jogs back to after a sweep, mm from the limit switches
    pub home_x_mm: f64,
    pub home_y_mm: f64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            steps_per_mm: 24.9955,
            x_center_mm: 324.0,
            y_max_mm: 107.0,
            feed_xy: 200,
            jog_feed: 1800,
            x_max_speed: 1800,
            y_max_speed: 1800,
            x_max_accel: 1000,
            y_max_accel: 800,
            arrival_tolerance_steps: 2,
            samples_per_point: 1,
            tandem: false,
            home_x_mm: 0.0,
            home_y_mm: 0.0,
        }
    }
}

impl RigConfig {
    /// Probe center in encoder steps.
    pub fn x_center_steps(&self) -> i64 {
        (self.x_center_mm * self.steps_per_mm).round() as i64
    }

    /// Y axis travel limit in encoder steps.
    pub fn y_max_steps(&self) -> i64 {
        (self.y_max_mm * self.steps_per_mm).round() as i64
    }

    /// Return-home corner in encoder steps.
    pub fn home_steps(&self) -> (i64, i64) {
        (
            (self.home_x_mm * self.steps_per_mm).round() as i64,
            (self.home_y_mm * self.steps_per_mm).round() as i64,
        )
    }

    /// Y feed paired with `feed_xy` on move commands.
    pub fn feed_y(&self) -> u32 {
        (self.feed_xy / 3).max(1)
    }

    /// Frame arity the rig streams.
    pub fn frame_arity(&self) -> usize {
        if self.tandem {
            13
        } else {
            10
        }
    }
}

/// Sequencer delays and timeouts, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between `BeaconON` and `tare`
    pub beacon_ms: u64,
    /// Wait for `tare done` before proceeding anyway
    pub tare_timeout_ms: u64,
    /// ESC spin-up time after `startMotor`
    pub motor_spin_ms: u64,
    /// Per-waypoint (and per dither leg) settle timeout
    pub settle_timeout_ms: u64,
    /// Wait for `jog done` after the return-home jog
    pub return_home_timeout_ms: u64,
    /// Abort the sweep if it runs longer than this
    pub overall_timeout_ms: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            beacon_ms: 3_000,
            tare_timeout_ms: 10_000,
            motor_spin_ms: 3_000,
            settle_timeout_ms: 15_000,
            return_home_timeout_ms: 60_000,
            overall_timeout_ms: None,
        }
    }
}

impl TimingConfig {
    pub fn beacon(&self) -> Duration {
        Duration::from_millis(self.beacon_ms)
    }

    pub fn tare_timeout(&self) -> Duration {
        Duration::from_millis(self.tare_timeout_ms)
    }

    pub fn motor_spin(&self) -> Duration {
        Duration::from_millis(self.motor_spin_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn return_home_timeout(&self) -> Duration {
        Duration::from_millis(self.return_home_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.overall_timeout_ms.map(Duration::from_millis)
    }
}

/// Probe binning and angle sign conventions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Radial bin width, mm
    pub x_delta_mm: f64,
    /// Dither distance before the first waypoint, mm (0 disables)
    pub pre_settle_mm: f64,
    /// +1 for clockwise rotors, -1 for counter-clockwise
    pub rotation_dir: i32,
    /// +1 or -1 depending on which way the AoA vane is mounted
    pub mount_sign: i32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            x_delta_mm: 3.0,
            pre_settle_mm: 5.0,
            rotation_dir: 1,
            mount_sign: 1,
        }
    }
}

impl ProbeConfig {
    /// Dither distance limited to the 0..=10 mm the axis tolerates.
    pub fn clamped_pre_settle_mm(&self) -> f64 {
        self.pre_settle_mm.clamp(0.0, 10.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub pwm1: u32,
    pub pwm2: u32,
    /// Minimum/maximum ESC pulse widths
    pub min_pwm: u32,
    pub max_pwm: u32,
    /// Throttle ramp time
    pub ramp_ms: u32,
    /// Logging waits until rotor 1 spins at least this fast
    pub rpm_min: f64,
    /// Largest frame-to-frame RPM change still counted as stable
    pub rpm_stable_delta: f64,
    /// Consecutive stable frames required; 0 disables the gate
    pub rpm_stable_frames: usize,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            pwm1: 1000,
            pwm2: 1000,
            min_pwm: 1000,
            max_pwm: 2000,
            ramp_ms: 1000,
            rpm_min: 500.0,
            rpm_stable_delta: 50.0,
            rpm_stable_frames: 5,
        }
    }
}

/// Air properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AirConfig {
    /// Density, kg/m³
    pub rho: f64,
    /// Kinematic viscosity in units of 1e-5 m²/s
    pub kin_visc: f64,
}

impl Default for AirConfig {
    fn default() -> Self {
        Self {
            rho: 1.225,
            kin_visc: 1.48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropellerConfig {
    /// Diameter, inches
    pub diameter_inch: f64,
    /// Rotor spacing ratio recorded alongside every row (tandem rigs)
    pub dr_ratio: f64,
    /// Extra travel past the tip, percent of diameter
    pub safety_over_prop_pct: f64,
}

impl Default for PropellerConfig {
    fn default() -> Self {
        Self {
            diameter_inch: 10.0,
            dr_ratio: 0.0,
            safety_over_prop_pct: 2.0,
        }
    }
}

impl PropellerConfig {
    /// Blade tip radius, mm.
    pub fn radius_mm(&self) -> f64 {
        self.diameter_inch * 25.4 / 2.0
    }

    /// Margin factor fed into the reduction band limit. Takes the
    /// percentage directly so command-line overrides go through it too.
    pub fn margin_factor(safety_over_prop_pct: f64) -> f64 {
        1.0 - safety_over_prop_pct / 100.0
    }
}

/// Load cell arm lengths (mm) and calibration factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub first_trq_arm_mm: f64,
    pub first_trq_factor: f64,
    pub first_thr_arm_mm: f64,
    pub first_thr_factor: f64,
    pub second_trq_arm_mm: f64,
    pub second_trq_factor: f64,
    pub second_thr_arm_mm: f64,
    pub second_thr_factor: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            first_trq_arm_mm: 72.0,
            first_trq_factor: 1.0,
            first_thr_arm_mm: 72.0,
            first_thr_factor: 1.0,
            second_trq_arm_mm: 72.0,
            second_trq_factor: 1.0,
            second_thr_arm_mm: 72.0,
            second_thr_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory new traces are created in
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl Settings {
    /// Load configuration from the default location.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }

    /// Validate the loaded configuration.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.broadcast_capacity == 0 {
            return Err(DaqError::Configuration(
                "application.broadcast_capacity must be greater than 0".to_string(),
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }

        if !(self.rig.steps_per_mm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "rig.steps_per_mm must be positive, got {}",
                self.rig.steps_per_mm
            )));
        }

        if self.rig.arrival_tolerance_steps < 0 {
            return Err(DaqError::Configuration(
                "rig.arrival_tolerance_steps cannot be negative".to_string(),
            ));
        }

        if self.motors.min_pwm > self.motors.max_pwm {
            return Err(DaqError::Configuration(format!(
                "motors.min_pwm ({}) exceeds motors.max_pwm ({})",
                self.motors.min_pwm, self.motors.max_pwm
            )));
        }

        if !(self.motors.rpm_stable_delta >= 0.0) {
            return Err(DaqError::Configuration(
                "motors.rpm_stable_delta cannot be negative".to_string(),
            ));
        }

        if !(self.probe.x_delta_mm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "probe.x_delta_mm must be positive, got {}",
                self.probe.x_delta_mm
            )));
        }

        for (name, value) in [
            ("probe.rotation_dir", self.probe.rotation_dir),
            ("probe.mount_sign", self.probe.mount_sign),
        ] {
            if value != 1 && value != -1 {
                return Err(DaqError::Configuration(format!(
                    "{} must be +1 or -1, got {}",
                    name, value
                )));
            }
        }

        if !(self.air.rho > 0.0) || !(self.air.kin_visc > 0.0) {
            return Err(DaqError::Configuration(
                "air.rho and air.kin_visc must be positive".to_string(),
            ));
        }

        if !(self.propeller.diameter_inch > 0.0) {
            return Err(DaqError::Configuration(
                "propeller.diameter_inch must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure a real serial port has been named before opening it.
    pub fn require_serial_port(&self) -> AppResult<&str> {
        let port = self.serial.port.trim();
        if port.is_empty() {
            return Err(DaqError::Configuration(
                "serial.port is empty; set it in the config file or PROPSTAND_SERIAL__PORT"
                    .to_string(),
            ));
        }
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rig.x_center_steps(), 8099);
        assert_eq!(settings.rig.feed_y(), 66);
        assert_eq!(settings.rig.frame_arity(), 10);
        assert_eq!(settings.rig.home_steps(), (0, 0));
    }

    #[test]
    fn home_corner_converts_to_steps() {
        let rig = RigConfig {
            steps_per_mm: 10.0,
            home_x_mm: 2.5,
            home_y_mm: 100.0,
            ..RigConfig::default()
        };
        assert_eq!(rig.home_steps(), (25, 1000));
    }

    #[test]
    fn margin_factor_shrinks_with_safety() {
        let pct = PropellerConfig::default().safety_over_prop_pct;
        assert!((PropellerConfig::margin_factor(pct) - 0.98).abs() < 1e-12);
        assert_eq!(PropellerConfig::margin_factor(0.0), 1.0);
    }

    #[test]
    fn rejects_inverted_pwm_range() {
        let mut settings = Settings::default();
        settings.motors.min_pwm = 2100;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("motors.min_pwm"));
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("/nonexistent/propstand.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn toml_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[rig]
tandem = true
samples_per_point = 4

[air]
rho = 1.18
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.rig.tandem);
        assert_eq!(settings.rig.samples_per_point, 4);
        assert_eq!(settings.air.rho, 1.18);
        assert_eq!(settings.air.kin_visc, 1.48);
    }

    #[test]
    #[serial]
    fn env_overrides_nested_snake_case_keys() {
        std::env::set_var("PROPSTAND_PROBE__X_DELTA_MM", "5");
        let result = Settings::load_from("/nonexistent/propstand.toml");
        std::env::remove_var("PROPSTAND_PROBE__X_DELTA_MM");

        assert_eq!(result.unwrap().probe.x_delta_mm, 5.0);
    }

    #[test]
    fn rejects_bad_sign_convention() {
        let mut settings = Settings::default();
        settings.probe.rotation_dir = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("probe.rotation_dir"));
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn pre_settle_is_clamped() {
        let probe = ProbeConfig {
            pre_settle_mm: 25.0,
            ..ProbeConfig::default()
        };
        assert_eq!(probe.clamped_pre_settle_mm(), 10.0);
    }

    #[test]
    fn rendered_toml_round_trips() {
        let rendered = Settings::default().to_toml().unwrap();
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, Settings::default());
    }
}
