//! Device back ends
//!
//! Fans and sensors speak to hardware through two tiny traits
//! ([`FanDevice`](crate::fan::FanDevice), [`SensorDevice`]). The back ends
//! here cover the three sub-configuration kinds: hwmon sysfs files, plain
//! files, and external commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use af_error::{AerofluxError, Result};

use crate::config::{FanConfig, SensorConfig};
use crate::fan::FanDevice;
use crate::hwmon;
use crate::sensor::SensorDevice;

/// Read a file containing a single integer (sysfs convention).
pub fn read_int(path: &Path) -> Result<i64> {
    let raw = fs::read_to_string(path).map_err(|e| AerofluxError::device_read(path, e))?;
    let trimmed = raw.trim();
    trimmed.parse::<i64>().map_err(|_| AerofluxError::DeviceParse {
        path: path.to_path_buf(),
        raw: trimmed.to_string(),
    })
}

/// Write a single integer to a file (sysfs convention).
pub fn write_int(path: &Path, value: i64) -> Result<()> {
    fs::write(path, value.to_string()).map_err(|e| AerofluxError::device_write(path, value, e))
}

/// Resolve the device back end for a fan's sub-configuration.
///
/// The configuration is validated to carry exactly one sub-config before
/// this runs.
pub fn fan_device(config: &FanConfig) -> Result<Box<dyn FanDevice>> {
    if let Some(hwmon_config) = &config.hwmon {
        let paths = hwmon::resolve_fan_paths(hwmon_config)?;
        return Ok(Box::new(SysfsFanDevice {
            pwm_path: paths.pwm,
            rpm_path: paths.rpm,
            enable_path: paths.enable,
        }));
    }
    if let Some(file_config) = &config.file {
        return Ok(Box::new(SysfsFanDevice {
            pwm_path: file_config.path.clone(),
            rpm_path: file_config.rpm_path.clone(),
            enable_path: None,
        }));
    }
    if let Some(cmd_config) = &config.cmd {
        return Ok(Box::new(CmdFanDevice {
            set_pwm: cmd_config.set_pwm.clone(),
            get_pwm: cmd_config.get_pwm.clone(),
            get_rpm: cmd_config.get_rpm.clone(),
        }));
    }
    Err(AerofluxError::config(format!(
        "Fan {}: sub-configuration for fan is missing, use one of: hwmon | file | cmd",
        config.id
    )))
}

/// Resolve the device back end for a sensor's sub-configuration.
pub fn sensor_device(config: &SensorConfig) -> Result<Box<dyn SensorDevice>> {
    if let Some(hwmon_config) = &config.hwmon {
        let path = hwmon::resolve_sensor_path(hwmon_config)?;
        return Ok(Box::new(FileSensorDevice { path }));
    }
    if let Some(file_config) = &config.file {
        return Ok(Box::new(FileSensorDevice {
            path: file_config.path.clone(),
        }));
    }
    if let Some(cmd_config) = &config.cmd {
        return Ok(Box::new(CmdSensorDevice {
            exec: cmd_config.exec.clone(),
        }));
    }
    Err(AerofluxError::config(format!(
        "Sensor {}: sub-configuration for sensor is missing, use one of: hwmon | file | cmd",
        config.id
    )))
}

// ============================================================================
// File-backed devices
// ============================================================================

/// Fan driven through integer files. Covers both hwmon chips and the plain
/// `file` sub-configuration; the latter simply has no enable or RPM file.
pub struct SysfsFanDevice {
    pub pwm_path: PathBuf,
    pub rpm_path: Option<PathBuf>,
    pub enable_path: Option<PathBuf>,
}

impl FanDevice for SysfsFanDevice {
    fn read_pwm(&self) -> Result<u8> {
        Ok(read_int(&self.pwm_path)?.clamp(0, 255) as u8)
    }

    fn write_pwm(&self, pwm: u8) -> Result<()> {
        write_int(&self.pwm_path, pwm as i64)
    }

    fn read_rpm(&self) -> Result<f64> {
        match &self.rpm_path {
            Some(path) => Ok(read_int(path)? as f64),
            None => Ok(0.0),
        }
    }

    fn read_pwm_enable(&self) -> Result<u8> {
        match &self.enable_path {
            Some(path) => Ok(read_int(path)?.clamp(0, u8::MAX as i64) as u8),
            // no enable knob means the fan is always under manual control
            None => Ok(1),
        }
    }

    fn write_pwm_enable(&self, mode: u8) -> Result<()> {
        match &self.enable_path {
            Some(path) => write_int(path, mode as i64),
            None => Ok(()),
        }
    }
}

pub struct FileSensorDevice {
    pub path: PathBuf,
}

impl SensorDevice for FileSensorDevice {
    fn read_value(&self) -> Result<f64> {
        Ok(read_int(&self.path)? as f64)
    }
}

// ============================================================================
// Command-backed devices
// ============================================================================

fn run_command(cmdline: &str, extra_arg: Option<String>) -> Result<String> {
    let mut parts = cmdline.split_whitespace();
    let program = parts.next().ok_or_else(|| AerofluxError::Command {
        command: cmdline.to_string(),
        reason: "empty command".to_string(),
    })?;

    let mut command = Command::new(program);
    command.args(parts);
    if let Some(arg) = extra_arg {
        command.arg(arg);
    }

    let output = command.output().map_err(|e| AerofluxError::Command {
        command: cmdline.to_string(),
        reason: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(AerofluxError::Command {
            command: cmdline.to_string(),
            reason: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn parse_command_number(cmdline: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>().map_err(|_| AerofluxError::Command {
        command: cmdline.to_string(),
        reason: format!("unparseable output '{raw}'"),
    })
}

/// Fan controlled through external commands; the PWM value is appended as the
/// last argument of `set_pwm`.
pub struct CmdFanDevice {
    pub set_pwm: String,
    pub get_pwm: String,
    pub get_rpm: Option<String>,
}

impl FanDevice for CmdFanDevice {
    fn read_pwm(&self) -> Result<u8> {
        let raw = run_command(&self.get_pwm, None)?;
        Ok(parse_command_number(&self.get_pwm, &raw)?.clamp(0.0, 255.0) as u8)
    }

    fn write_pwm(&self, pwm: u8) -> Result<()> {
        run_command(&self.set_pwm, Some(pwm.to_string())).map(|_| ())
    }

    fn read_rpm(&self) -> Result<f64> {
        match &self.get_rpm {
            Some(cmdline) => {
                let raw = run_command(cmdline, None)?;
                parse_command_number(cmdline, &raw)
            }
            None => Ok(0.0),
        }
    }

    fn read_pwm_enable(&self) -> Result<u8> {
        Ok(1)
    }

    fn write_pwm_enable(&self, _mode: u8) -> Result<()> {
        Ok(())
    }
}

pub struct CmdSensorDevice {
    pub exec: String,
}

impl SensorDevice for CmdSensorDevice {
    fn read_value(&self) -> Result<f64> {
        let raw = run_command(&self.exec, None)?;
        parse_command_number(&self.exec, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_int_trims_whitespace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  1500 ").unwrap();
        file.flush().unwrap();
        assert_eq!(read_int(file.path()).unwrap(), 1500);
    }

    #[test]
    fn test_read_int_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not-a-number").unwrap();
        file.flush().unwrap();
        let err = read_int(file.path()).unwrap_err();
        assert!(matches!(err, AerofluxError::DeviceParse { .. }));
    }

    #[test]
    fn test_write_then_read_int() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwm1");
        write_int(&path, 128).unwrap();
        assert_eq!(read_int(&path).unwrap(), 128);
    }

    #[test]
    fn test_file_fan_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pwm_path = dir.path().join("pwm1");
        let rpm_path = dir.path().join("fan1_input");
        fs::write(&rpm_path, "900").unwrap();

        let device = SysfsFanDevice {
            pwm_path,
            rpm_path: Some(rpm_path.clone()),
            enable_path: None,
        };
        device.write_pwm(200).unwrap();
        assert_eq!(device.read_pwm().unwrap(), 200);
        assert_eq!(device.read_rpm().unwrap(), 900.0);
        // no enable file: manual control reported, writes accepted
        assert_eq!(device.read_pwm_enable().unwrap(), 1);
        device.write_pwm_enable(2).unwrap();
    }

    #[test]
    fn test_cmd_sensor_device() {
        let device = CmdSensorDevice {
            exec: "echo 47000".to_string(),
        };
        assert_eq!(device.read_value().unwrap(), 47000.0);
    }

    #[test]
    fn test_cmd_device_failure() {
        let device = CmdSensorDevice {
            exec: "false".to_string(),
        };
        assert!(device.read_value().is_err());
    }
}
