//! Aeroflux core library
//!
//! Everything the daemon needs short of the control loop itself: configuration
//! types and validation, the speed-curve evaluator, fan and sensor abstractions
//! with their hwmon/file/cmd device back ends, and the PWM→RPM persistence
//! store.

pub mod config;
pub mod curve;
pub mod devices;
pub mod fan;
pub mod hwmon;
pub mod persistence;
pub mod registry;
pub mod sensor;
pub mod util;

pub use af_error::{AerofluxError, Result};
pub use config::Config;
pub use curve::SpeedCurve;
pub use fan::{Fan, FanDevice, MAX_PWM_VALUE, MIN_PWM_VALUE};
pub use persistence::Persistence;
pub use registry::Registry;
pub use sensor::{Sensor, SensorDevice};
