//! Sensor abstraction
//!
//! A sensor is any source yielding a scalar; hwmon temperature inputs report
//! milli-degrees but the value is treated as opaque. The daemon polls each
//! sensor at the configured rate; curves consume the windowed moving average
//! so a single noisy reading cannot kick a fan around.

use std::sync::RwLock;

use af_error::Result;

use crate::config::SensorConfig;
use crate::util::RollingWindow;

/// Raw access to a sensor value.
pub trait SensorDevice: Send + Sync {
    fn read_value(&self) -> Result<f64>;
}

struct SensorState {
    value: f64,
    window: RollingWindow,
}

pub struct Sensor {
    config: SensorConfig,
    device: Box<dyn SensorDevice>,
    state: RwLock<SensorState>,
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor").field("config", &self.config).finish()
    }
}

impl Sensor {
    pub fn new(config: SensorConfig, device: Box<dyn SensorDevice>, window_size: usize) -> Self {
        Self {
            config,
            device,
            state: RwLock::new(SensorState {
                value: 0.0,
                window: RollingWindow::new(window_size),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Read the device and fold the reading into the moving average.
    pub fn poll(&self) -> Result<f64> {
        let value = self.device.read_value()?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.value = value;
        state.window.append(value);
        Ok(value)
    }

    /// Latest raw reading.
    pub fn value(&self) -> f64 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).value
    }

    /// Moving average over the polling window; the latest raw reading until
    /// at least one poll has happened.
    pub fn moving_avg(&self) -> f64 {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.window.is_empty() {
            state.value
        } else {
            state.window.avg()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SequenceDevice {
        values: Vec<f64>,
        cursor: AtomicUsize,
    }

    impl SensorDevice for SequenceDevice {
        fn read_value(&self) -> Result<f64> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            Ok(self.values[i.min(self.values.len() - 1)])
        }
    }

    fn sensor_with(values: Vec<f64>, window_size: usize) -> Sensor {
        let config = SensorConfig {
            id: "test".to_string(),
            hwmon: None,
            file: None,
            cmd: None,
        };
        Sensor::new(
            config,
            Box::new(SequenceDevice {
                values,
                cursor: AtomicUsize::new(0),
            }),
            window_size,
        )
    }

    #[test]
    fn test_poll_updates_value_and_average() {
        let sensor = sensor_with(vec![10.0, 20.0, 30.0], 10);
        sensor.poll().unwrap();
        sensor.poll().unwrap();
        sensor.poll().unwrap();

        assert_eq!(sensor.value(), 30.0);
        assert_eq!(sensor.moving_avg(), 20.0);
    }

    #[test]
    fn test_moving_avg_window_evicts() {
        let sensor = sensor_with(vec![100.0, 0.0, 0.0], 2);
        sensor.poll().unwrap();
        sensor.poll().unwrap();
        sensor.poll().unwrap();

        // the 100.0 reading has been evicted
        assert_eq!(sensor.moving_avg(), 0.0);
    }

    #[test]
    fn test_moving_avg_before_first_poll() {
        let sensor = sensor_with(vec![42.0], 10);
        assert_eq!(sensor.moving_avg(), 0.0);
    }
}
