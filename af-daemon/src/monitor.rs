//! Sensor polling tasks
//!
//! One task per sensor, ticking at the configured polling rate. A failed
//! read is logged and skipped; the moving average simply keeps its previous
//! shape until the sensor answers again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use af_core::Sensor;

use crate::shutdown;

pub async fn run_sensor_monitor(
    sensor: Arc<Sensor>,
    polling_rate: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(sensor = %sensor.id(), "Starting sensor monitor");
    let mut tick = tokio::time::interval(polling_rate);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown::cancelled(&mut shutdown) => {
                debug!(sensor = %sensor.id(), "Sensor monitor stopped");
                return;
            }
            _ = tick.tick() => {
                match sensor.poll() {
                    Ok(value) => {
                        debug!(sensor = %sensor.id(), value, "Sensor reading");
                    }
                    Err(e) => {
                        warn!(sensor = %sensor.id(), error = %e, "Failed to read sensor");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::config::SensorConfig;
    use af_core::sensor::SensorDevice;
    use af_error::Result;

    struct CountingDevice(std::sync::atomic::AtomicU64);

    impl SensorDevice for CountingDevice {
        fn read_value(&self) -> Result<f64> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(n as f64)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_polls_until_cancelled() {
        let sensor = Arc::new(Sensor::new(
            SensorConfig {
                id: "t".to_string(),
                hwmon: None,
                file: None,
                cmd: None,
            },
            Box::new(CountingDevice(std::sync::atomic::AtomicU64::new(1))),
            10,
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sensor_monitor(
            sensor.clone(),
            Duration::from_secs(1),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(sensor.value() >= 4.0);
        assert!(sensor.moving_avg() > 0.0);
    }
}
