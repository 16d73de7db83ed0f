//! Configuration types
//!
//! The on-disk format is JSON. Every entity (fan, curve, sensor) carries
//! exactly one sub-configuration selecting its back end; the optional fields
//! here are checked by [`validation`] before anything is constructed from
//! them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use af_error::{AerofluxError, Result};

pub mod validation;

pub const FUNCTION_MINIMUM: &str = "minimum";
pub const FUNCTION_AVERAGE: &str = "average";
pub const FUNCTION_MAXIMUM: &str = "maximum";
pub const FUNCTION_DELTA: &str = "delta";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub fans: Vec<FanConfig>,
    #[serde(default)]
    pub curves: Vec<CurveConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    /// How often sensor inputs are polled, in milliseconds.
    #[serde(default = "default_temp_sensor_polling_rate_ms")]
    pub temp_sensor_polling_rate_ms: u64,
    /// Window size for the sensor moving average.
    #[serde(default = "default_rolling_window_size")]
    pub temp_rolling_window_size: usize,
    /// Window size for RPM measurements (one window per PWM step).
    #[serde(default = "default_rolling_window_size")]
    pub rpm_rolling_window_size: usize,
    /// How often each fan controller re-evaluates its curve, in milliseconds.
    #[serde(default = "default_fan_controller_update_rate_ms")]
    pub fan_controller_update_rate_ms: u64,
    /// RPM delta below which a fan counts as settled during initialization.
    #[serde(default = "default_max_rpm_diff_for_settled_fan")]
    pub max_rpm_diff_for_settled_fan: f64,
    /// Run the initialization sequence of all fans at the same time.
    ///
    /// Off by default: measuring fans one at a time avoids thermal spikes
    /// and keeps shared-bus chips readable.
    #[serde(default)]
    pub run_fan_initialization_in_parallel: bool,
    /// Directory the per-fan PWM→RPM measurements are persisted under.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Config {
    pub fn temp_sensor_polling_rate(&self) -> Duration {
        Duration::from_millis(self.temp_sensor_polling_rate_ms)
    }

    pub fn fan_controller_update_rate(&self) -> Duration {
        Duration::from_millis(self.fan_controller_update_rate_ms)
    }
}

fn default_temp_sensor_polling_rate_ms() -> u64 {
    1000
}

fn default_rolling_window_size() -> usize {
    10
}

fn default_fan_controller_update_rate_ms() -> u64 {
    200
}

fn default_max_rpm_diff_for_settled_fan() -> f64 {
    10.0
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/aeroflux")
}

// ============================================================================
// Fans
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanConfig {
    pub id: String,
    /// Id of the curve driving this fan.
    pub curve: String,
    /// Raise the minimum PWM whenever the fan is observed stalled.
    #[serde(default)]
    pub never_stop: bool,
    #[serde(default)]
    pub hwmon: Option<HwmonFanConfig>,
    #[serde(default)]
    pub file: Option<FileFanConfig>,
    #[serde(default)]
    pub cmd: Option<CmdFanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwmonFanConfig {
    /// Chip identifier, matched against the hwmon `name` file.
    pub platform: String,
    /// 1-based index of the pwmN/fanN_input pair on the chip.
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFanConfig {
    /// File the PWM value is written to (and read back from).
    pub path: PathBuf,
    /// Optional file the current RPM can be read from.
    #[serde(default)]
    pub rpm_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdFanConfig {
    /// Command to set the PWM; the target value is appended as last argument.
    pub set_pwm: String,
    /// Command printing the current PWM on stdout.
    pub get_pwm: String,
    /// Command printing the current RPM on stdout.
    #[serde(default)]
    pub get_rpm: Option<String>,
}

// ============================================================================
// Curves
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveConfig {
    pub id: String,
    #[serde(default)]
    pub linear: Option<LinearCurveConfig>,
    #[serde(default)]
    pub pid: Option<PidCurveConfig>,
    #[serde(default)]
    pub function: Option<FunctionCurveConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearCurveConfig {
    /// Id of the sensor this curve evaluates.
    pub sensor: String,
    /// Sensor value mapped to PWM 0.
    #[serde(default)]
    pub min: f64,
    /// Sensor value mapped to PWM 255.
    #[serde(default)]
    pub max: f64,
    /// Optional explicit mapping from sensor value to PWM, interpolated
    /// piecewise-linearly. Takes precedence over min/max when present.
    #[serde(default)]
    pub steps: Option<BTreeMap<i64, u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidCurveConfig {
    /// Id of the sensor this curve evaluates.
    pub sensor: String,
    /// Target sensor value, in the unit the sensor reports.
    pub set_point: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCurveConfig {
    /// One of: minimum | average | maximum | delta.
    #[serde(rename = "type")]
    pub function: String,
    /// Ids of the curves this function aggregates.
    pub curves: Vec<String>,
}

// ============================================================================
// Sensors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    #[serde(default)]
    pub hwmon: Option<HwmonSensorConfig>,
    #[serde(default)]
    pub file: Option<FileSensorConfig>,
    #[serde(default)]
    pub cmd: Option<CmdSensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwmonSensorConfig {
    /// Chip identifier, matched against the hwmon `name` file.
    pub platform: String,
    /// 1-based index of the tempN_input on the chip.
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSensorConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdSensorConfig {
    /// Command printing the sensor value on stdout.
    pub exec: String,
}

// ============================================================================
// Loading
// ============================================================================

pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/aeroflux/config.json")
}

/// Load a configuration file. Validation is a separate step, see
/// [`validation::validate_config`].
pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .map_err(|e| AerofluxError::device_read(path, e))?;
    let config: Config = serde_json::from_str(&data)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_applied() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.temp_sensor_polling_rate(), Duration::from_secs(1));
        assert_eq!(config.temp_rolling_window_size, 10);
        assert_eq!(config.rpm_rolling_window_size, 10);
        assert_eq!(config.fan_controller_update_rate_ms, 200);
        assert!(!config.run_fan_initialization_in_parallel);
        assert!(config.fans.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"{
            "fans": [
                {"id": "cpu_fan", "curve": "cpu_curve", "never_stop": true,
                 "hwmon": {"platform": "nct6798", "index": 1}}
            ],
            "curves": [
                {"id": "cpu_curve",
                 "linear": {"sensor": "cpu_temp", "min": 40000, "max": 80000}}
            ],
            "sensors": [
                {"id": "cpu_temp", "hwmon": {"platform": "nct6798", "index": 1}}
            ],
            "temp_sensor_polling_rate_ms": 500
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.fans.len(), 1);
        assert!(config.fans[0].never_stop);
        assert_eq!(config.curves[0].linear.as_ref().unwrap().max, 80000.0);
        assert_eq!(config.temp_sensor_polling_rate(), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_steps_integer_keys() {
        let raw = r#"{"sensor": "s", "steps": {"40000": 0, "80000": 255}}"#;
        let linear: LinearCurveConfig = serde_json::from_str(raw).unwrap();
        let steps = linear.steps.unwrap();
        assert_eq!(steps.get(&40000), Some(&0));
        assert_eq!(steps.get(&80000), Some(&255));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/aeroflux.json")).unwrap_err();
        assert!(matches!(err, AerofluxError::DeviceRead { .. }));
    }

    #[test]
    fn test_load_config_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sensors": [{{"id": "s", "file": {{"path": "/tmp/t"}}}}]}}"#).unwrap();
        file.flush().unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.sensors[0].id, "s");
    }
}
