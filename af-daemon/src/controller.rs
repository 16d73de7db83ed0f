//! Per-fan control loop
//!
//! One [`FanController`] runs per fan, through these states:
//!
//! 1. *Gathering*: sleep while the sensor monitors warm up their averages.
//! 2. *Initializing*: only when no persisted PWM→RPM data exists. Sweeps the
//!    whole PWM range, measures the RPM response, persists it.
//! 3. *Running*: on every tick, read the current PWM, evaluate the fan's
//!    curve, map the result into the fan's measured range, write it.
//! 4. *Recovering*: on any device error, hand control back to the hardware
//!    (or force full speed) and terminate with the original error.
//!
//! Cancellation is observed at every suspension point; a cancelled loop
//! returns cleanly without touching the hardware again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use af_core::config::Config;
use af_core::fan::{Fan, MAX_PWM_VALUE, MIN_PWM_VALUE};
use af_core::util::RollingWindow;
use af_core::{AerofluxError, Persistence, Registry, Result};

use crate::shutdown;

/// Rolling window of RPM deltas consulted by the settle-wait.
const SETTLE_WINDOW_SIZE: usize = 10;

/// Serializes initialization sequences across fans. Sweeping several fans at
/// once heats the machine and confuses chips behind a shared bus, so this is
/// only bypassed when the configuration explicitly asks for parallel
/// initialization.
static INIT_SEQUENCE_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub update_rate: Duration,
    pub sensor_polling_rate: Duration,
    pub rpm_rolling_window_size: usize,
    pub max_rpm_diff_for_settled_fan: f64,
    pub parallel_initialization: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            update_rate: config.fan_controller_update_rate(),
            sensor_polling_rate: config.temp_sensor_polling_rate(),
            rpm_rolling_window_size: config.rpm_rolling_window_size,
            max_rpm_diff_for_settled_fan: config.max_rpm_diff_for_settled_fan,
            parallel_initialization: config.run_fan_initialization_in_parallel,
        }
    }
}

pub struct FanController {
    fan: Arc<Fan>,
    registry: Arc<Registry>,
    persistence: Arc<Persistence>,
    settings: ControllerSettings,
}

impl FanController {
    pub fn new(
        fan: Arc<Fan>,
        registry: Arc<Registry>,
        persistence: Arc<Persistence>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            fan,
            registry,
            persistence,
            settings,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let fan_id = self.fan.id().to_string();

        info!(fan = %fan_id, "Gathering sensor data...");
        let warmup = Duration::from_secs(2) + self.settings.sensor_polling_rate * 2;
        if sleep_or_cancel(warmup, &mut shutdown).await {
            return Ok(());
        }

        info!(fan = %fan_id, "Loading fan curve data...");
        let data = match self.persistence.load_fan_pwm_data(&fan_id) {
            Ok(data) => data,
            Err(AerofluxError::PwmDataMissing(_)) => {
                warn!(
                    fan = %fan_id,
                    "No fan curve data found, starting initialization sequence..."
                );
                self.run_initialization_sequence(&mut shutdown).await?;
                if *shutdown.borrow() {
                    return Ok(());
                }
                self.persistence.load_fan_pwm_data(&fan_id)?
            }
            Err(e) => return Err(e),
        };

        self.fan.attach_pwm_rpm_data(&data)?;
        info!(
            fan = %fan_id,
            start_pwm = self.fan.start_pwm(),
            max_pwm = self.fan.max_pwm(),
            "Fan PWM range discovered"
        );

        if let Err(e) = try_set_manual_pwm(&self.fan) {
            error!(fan = %fan_id, "Could not enable fan control");
            return Err(e);
        }

        info!(fan = %fan_id, "Starting controller loop");
        let mut tick = tokio::time::interval(self.settings.update_rate);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown::cancelled(&mut shutdown) => {
                    info!(fan = %fan_id, "Controller loop stopped");
                    return Ok(());
                }
                _ = tick.tick() => {
                    if let Err(e) = self.update_fan_speed() {
                        error!(fan = %fan_id, error = %e, "Error in fan controller");
                        self.try_restore_fan_settings();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One Running-state tick: measure RPM, evaluate the curve, write the
    /// target PWM if it differs from the current one.
    fn update_fan_speed(&self) -> Result<()> {
        self.fan.measure_rpm()?;

        let current = self.fan.pwm()?;
        let curve = self.registry.curve(self.fan.curve_id())?;
        let optimal = curve.evaluate(&self.registry)?;

        match calculate_target_pwm(&self.fan, current, optimal) {
            Some(target) if target != current => self.fan.set_pwm(target),
            Some(_) => Ok(()),
            None => Err(AerofluxError::FanDead(self.fan.id().to_string())),
        }
    }

    /// Best-effort hardware restoration before the loop exits on an error.
    fn try_restore_fan_settings(&self) {
        info!(fan = %self.fan.id(), "Trying to restore fan settings...");

        // hand control back to whatever was driving the fan before us
        if let Some(original) = self.fan.original_pwm_enable() {
            if original != 1 && self.fan.set_pwm_enable(original).is_ok() {
                return;
            }
        }
        // no automatic mode to fall back to: keep the fan spinning
        if self.fan.set_pwm(MAX_PWM_VALUE).is_err() {
            warn!(fan = %self.fan.id(), "Unable to restore fan, make sure it is running!");
        }
    }

    /// Sweep the PWM range 0..=255 and record the fan's RPM response.
    ///
    /// At PWM 0 the sweep waits until the fan has settled (successive RPM
    /// deltas below the configured threshold); every other step sleeps twice
    /// the typical sensor update interval before measuring.
    async fn run_initialization_sequence(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let _guard = if !self.settings.parallel_initialization {
            Some(INIT_SEQUENCE_MUTEX.lock().await)
        } else {
            None
        };
        if *shutdown.borrow() {
            return Ok(());
        }

        if let Err(e) = try_set_manual_pwm(&self.fan) {
            error!(fan = %self.fan.id(), "Could not enable fan control");
            return Err(e);
        }

        for pwm in MIN_PWM_VALUE..=MAX_PWM_VALUE {
            self.fan.set_pwm(pwm)?;

            if pwm == MIN_PWM_VALUE {
                if self.wait_for_settle(shutdown).await? {
                    return Ok(());
                }
            } else {
                // most sensors update once per second, wait double that to
                // be sure the measurement is fresh
                if sleep_or_cancel(Duration::from_secs(2), shutdown).await {
                    return Ok(());
                }
            }

            debug!(fan = %self.fan.id(), pwm, "Measuring RPM");
            for _ in 0..self.settings.rpm_rolling_window_size {
                self.fan.measure_rpm()?;
            }
        }

        self.persistence
            .save_fan_pwm_data(self.fan.id(), &self.fan.pwm_rpm_samples())?;
        Ok(())
    }

    /// Wait until successive RPM readings differ by less than the configured
    /// threshold. Returns true when cancelled.
    async fn wait_for_settle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let threshold = self.settings.max_rpm_diff_for_settled_fan;
        let mut diff_window = RollingWindow::new(SETTLE_WINDOW_SIZE);
        diff_window.fill(2.0 * threshold);

        let mut max_diff = 2.0 * threshold;
        let mut last_rpm = 0.0;
        while max_diff >= threshold {
            debug!(fan = %self.fan.id(), max_diff, "Waiting for fan to settle...");
            let rpm = self.fan.rpm()?;
            diff_window.append((rpm - last_rpm).abs());
            last_rpm = rpm;
            max_diff = diff_window.max().ceil();

            if sleep_or_cancel(Duration::from_secs(1), shutdown).await {
                return Ok(true);
            }
        }
        debug!(fan = %self.fan.id(), max_diff, "Fan settled");
        Ok(false)
    }
}

/// Enable manual PWM control, trying enable-value 1 first and 0 as fallback.
/// The previous enable value is captured beforehand so recovery can restore
/// it.
fn try_set_manual_pwm(fan: &Fan) -> Result<()> {
    if fan.original_pwm_enable().is_none() {
        fan.capture_original_pwm_enable()?;
    }
    fan.set_pwm_enable(1).or_else(|_| fan.set_pwm_enable(0))
}

/// Map a curve output onto the fan's measured PWM range and enforce the
/// never-stop policy.
///
/// Returns `None` when a never-stop fan reports zero RPM even at its maximum
/// PWM; the fan appears dead and the loop must give up.
pub fn calculate_target_pwm(fan: &Fan, current_pwm: u8, optimal: u8) -> Option<u8> {
    let min_pwm = fan.min_pwm();
    let max_pwm = fan.max_pwm();
    let span = (max_pwm - min_pwm) as f64;
    let mut target =
        min_pwm + ((optimal as f64 / MAX_PWM_VALUE as f64) * span).round() as u8;

    if let Some(last_set) = fan.last_set_pwm() {
        if last_set != current_pwm {
            warn!(
                fan = %fan.id(),
                last_set,
                current = current_pwm,
                "PWM was changed by a third party"
            );
        }
    }

    // a never-stop fan with zero RPM at the PWM we already set gets its
    // minimum nudged up until it spins again
    if fan.never_stop() && fan.last_set_pwm() == Some(target) && fan.rpm_avg() <= 0.0 {
        if target >= max_pwm {
            error!(
                fan = %fan.id(),
                rpm_avg = fan.rpm_avg(),
                pwm = target,
                "CRITICAL: fan reports no RPM even at maximum PWM"
            );
            return None;
        }
        warn!(
            fan = %fan.id(),
            from = fan.min_pwm(),
            to = fan.min_pwm() + 1,
            "Fan is supposed to never stop but reports no RPM, increasing minimum PWM"
        );
        fan.set_min_pwm(fan.min_pwm() + 1);
        target += 1;
        // keep the next ticks from escalating immediately
        fan.set_rpm_avg(1.0);
    }

    Some(target)
}

async fn sleep_or_cancel(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown::cancelled(shutdown) => true,
    }
}
