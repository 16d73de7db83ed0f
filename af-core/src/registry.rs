//! Entity registry
//!
//! Fans, curves and sensors are constructed exactly once from a validated
//! configuration and looked up by id afterwards. The registry is handed
//! around explicitly instead of living in process-wide statics; its structure
//! never changes after startup, only the entities' internal state does.

use std::collections::HashMap;
use std::sync::Arc;

use af_error::{AerofluxError, Result};

use crate::config::Config;
use crate::curve::SpeedCurve;
use crate::devices;
use crate::fan::Fan;
use crate::sensor::Sensor;

#[derive(Default)]
pub struct Registry {
    pub fans: HashMap<String, Arc<Fan>>,
    pub curves: HashMap<String, Arc<SpeedCurve>>,
    pub sensors: HashMap<String, Arc<Sensor>>,
}

impl Registry {
    /// Build all entities from a validated configuration, resolving each
    /// hwmon/file/cmd sub-configuration to its device back end.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Registry::default();

        for sensor_config in &config.sensors {
            let device = devices::sensor_device(sensor_config)?;
            let sensor = Sensor::new(
                sensor_config.clone(),
                device,
                config.temp_rolling_window_size,
            );
            registry
                .sensors
                .insert(sensor_config.id.clone(), Arc::new(sensor));
        }

        for curve_config in &config.curves {
            let curve = SpeedCurve::from_config(curve_config)?;
            registry
                .curves
                .insert(curve_config.id.clone(), Arc::new(curve));
        }

        for fan_config in &config.fans {
            let device = devices::fan_device(fan_config)?;
            let fan = Fan::new(fan_config.clone(), device, config.rpm_rolling_window_size);
            registry.fans.insert(fan_config.id.clone(), Arc::new(fan));
        }

        Ok(registry)
    }

    pub fn curve(&self, id: &str) -> Result<&Arc<SpeedCurve>> {
        self.curves
            .get(id)
            .ok_or_else(|| AerofluxError::UnknownCurve(id.to_string()))
    }

    pub fn sensor(&self, id: &str) -> Result<&Arc<Sensor>> {
        self.sensors
            .get(id)
            .ok_or_else(|| AerofluxError::UnknownSensor(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileSensorConfig, LinearCurveConfig};
    use std::io::Write;

    #[test]
    fn test_lookup_errors() {
        let registry = Registry::default();
        assert!(matches!(
            registry.curve("nope").unwrap_err(),
            AerofluxError::UnknownCurve(_)
        ));
        assert!(matches!(
            registry.sensor("nope").unwrap_err(),
            AerofluxError::UnknownSensor(_)
        ));
    }

    #[test]
    fn test_from_config_builds_file_entities() {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        write!(temp, "42000").unwrap();
        temp.flush().unwrap();

        let mut config: Config = serde_json::from_str("{}").unwrap();
        config.sensors = vec![crate::config::SensorConfig {
            id: "t".to_string(),
            hwmon: None,
            file: Some(FileSensorConfig {
                path: temp.path().to_path_buf(),
            }),
            cmd: None,
        }];
        config.curves = vec![crate::config::CurveConfig {
            id: "c".to_string(),
            linear: Some(LinearCurveConfig {
                sensor: "t".to_string(),
                min: 0.0,
                max: 84000.0,
                steps: None,
            }),
            pid: None,
            function: None,
        }];

        let registry = Registry::from_config(&config).unwrap();
        let sensor = registry.sensor("t").unwrap();
        sensor.poll().unwrap();
        assert_eq!(sensor.value(), 42000.0);
        assert_eq!(registry.curve("c").unwrap().evaluate(&registry).unwrap(), 128);
    }
}
