//! Fan abstraction
//!
//! A [`Fan`] couples a raw PWM/RPM device with the state the controller learns
//! about it: the PWM→RPM response map, the discovered start/min/max PWM
//! bounds, the pwm_enable value found on startup, and the last PWM this
//! process wrote.
//!
//! Invariant on the learned bounds: `0 <= min_pwm <= start_pwm <= max_pwm <= 255`.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use std::sync::Mutex;

use af_error::{AerofluxError, Result};
use tracing::debug;

use crate::config::FanConfig;
use crate::util::{self, RollingWindow};

pub const MIN_PWM_VALUE: u8 = 0;
pub const MAX_PWM_VALUE: u8 = 255;

/// Raw access to a fan's PWM output, RPM input and control mode.
///
/// `pwm_enable` follows the hwmon convention: 0 = no control, 1 = manual,
/// 2 = automatic. Back ends without an enable knob report manual and accept
/// writes as no-ops.
pub trait FanDevice: Send + Sync {
    fn read_pwm(&self) -> Result<u8>;
    fn write_pwm(&self, pwm: u8) -> Result<()>;
    fn read_rpm(&self) -> Result<f64>;
    fn read_pwm_enable(&self) -> Result<u8>;
    fn write_pwm_enable(&self, mode: u8) -> Result<()>;
}

struct FanState {
    start_pwm: u8,
    min_pwm: u8,
    max_pwm: u8,
    original_pwm_enable: Option<u8>,
    last_set_pwm: Option<u8>,
    rpm_avg: f64,
    pwm_map: BTreeMap<u8, RollingWindow>,
}

pub struct Fan {
    config: FanConfig,
    device: Box<dyn FanDevice>,
    rpm_window_size: usize,
    state: Mutex<FanState>,
}

impl Fan {
    pub fn new(config: FanConfig, device: Box<dyn FanDevice>, rpm_window_size: usize) -> Self {
        Self {
            config,
            device,
            rpm_window_size: rpm_window_size.max(1),
            state: Mutex::new(FanState {
                start_pwm: MIN_PWM_VALUE,
                min_pwm: MIN_PWM_VALUE,
                max_pwm: MAX_PWM_VALUE,
                original_pwm_enable: None,
                last_set_pwm: None,
                rpm_avg: 0.0,
                pwm_map: BTreeMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    pub fn curve_id(&self) -> &str {
        &self.config.curve
    }

    pub fn never_stop(&self) -> bool {
        self.config.never_stop
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FanState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Device access
    // ========================================================================

    pub fn pwm(&self) -> Result<u8> {
        self.device.read_pwm()
    }

    /// Write a PWM value and remember it for interference detection.
    pub fn set_pwm(&self, pwm: u8) -> Result<()> {
        self.device.write_pwm(pwm)?;
        self.state().last_set_pwm = Some(pwm);
        Ok(())
    }

    pub fn rpm(&self) -> Result<f64> {
        self.device.read_rpm()
    }

    pub fn pwm_enable(&self) -> Result<u8> {
        self.device.read_pwm_enable()
    }

    pub fn set_pwm_enable(&self, mode: u8) -> Result<()> {
        self.device.write_pwm_enable(mode)
    }

    /// Read and remember the pwm_enable value so it can be restored on exit.
    pub fn capture_original_pwm_enable(&self) -> Result<u8> {
        let mode = self.device.read_pwm_enable()?;
        self.state().original_pwm_enable = Some(mode);
        Ok(mode)
    }

    pub fn original_pwm_enable(&self) -> Option<u8> {
        self.state().original_pwm_enable
    }

    /// Read the current RPM, fold it into the moving average, and record it
    /// in the response map under the PWM the fan is currently driven at.
    pub fn measure_rpm(&self) -> Result<()> {
        let rpm = self.device.read_rpm()?;
        let pwm = self.device.read_pwm()?;

        let mut state = self.state();
        let n = self.rpm_window_size as f64;
        state.rpm_avg += (rpm - state.rpm_avg) / n;

        let window_size = self.rpm_window_size;
        state
            .pwm_map
            .entry(pwm)
            .or_insert_with(|| RollingWindow::new(window_size))
            .append(rpm);
        Ok(())
    }

    // ========================================================================
    // Learned state
    // ========================================================================

    pub fn start_pwm(&self) -> u8 {
        self.state().start_pwm
    }

    pub fn set_start_pwm(&self, pwm: u8) {
        self.state().start_pwm = pwm;
    }

    pub fn min_pwm(&self) -> u8 {
        self.state().min_pwm
    }

    pub fn set_min_pwm(&self, pwm: u8) {
        self.state().min_pwm = pwm;
    }

    pub fn max_pwm(&self) -> u8 {
        self.state().max_pwm
    }

    pub fn set_max_pwm(&self, pwm: u8) {
        self.state().max_pwm = pwm;
    }

    pub fn last_set_pwm(&self) -> Option<u8> {
        self.state().last_set_pwm
    }

    pub fn rpm_avg(&self) -> f64 {
        self.state().rpm_avg
    }

    pub fn set_rpm_avg(&self, avg: f64) {
        self.state().rpm_avg = avg;
    }

    /// Snapshot of the response map as plain sample lists, for persistence.
    pub fn pwm_rpm_samples(&self) -> BTreeMap<u8, Vec<f64>> {
        self.state()
            .pwm_map
            .iter()
            .map(|(&pwm, window)| (pwm, window.values().collect()))
            .collect()
    }

    // ========================================================================
    // Boundary discovery
    // ========================================================================

    /// Compute `(start_pwm, max_pwm)` from the response map.
    ///
    /// `start_pwm` is the smallest PWM with strictly positive window-averaged
    /// RPM; `max_pwm` the smallest PWM at which the averaged RPM reaches its
    /// observed maximum (stepping above it gains nothing). With no positive
    /// sample at all the full range `(0, 255)` is assumed.
    pub fn compute_pwm_boundaries(&self) -> (u8, u8) {
        let state = self.state();
        compute_pwm_boundaries(&state.pwm_map)
    }

    /// Expand possibly-gappy persisted PWM→RPM data into a full 0..=255
    /// response map and derive the PWM bounds from it.
    ///
    /// Recorded keys keep their samples. A gap is seeded with a single value
    /// interpolated linearly between the surrounding recorded averages; a gap
    /// past the last recorded key copies the last known average. Every window
    /// is then topped up to capacity with the running average of its contents
    /// so reductions are well-defined from the first real measurement on.
    pub fn attach_pwm_rpm_data(&self, data: &BTreeMap<u8, Vec<f64>>) -> Result<()> {
        if data.values().all(|samples| samples.is_empty()) {
            return Err(AerofluxError::InvalidCurveData(self.config.id.clone()));
        }

        let mut state = self.state();
        state.pwm_map.clear();

        let mut last_idx: u8 = 0;
        let mut last_avg: f64 = 0.0;
        for i in MIN_PWM_VALUE..=MAX_PWM_VALUE {
            let mut window = RollingWindow::new(self.rpm_window_size);

            match data.get(&i).filter(|samples| !samples.is_empty()) {
                Some(samples) => {
                    for &sample in samples {
                        window.append(sample);
                    }
                    last_idx = i;
                    last_avg = util::avg(samples);
                }
                None => {
                    // seed with a value interpolated towards the next
                    // recorded key, or carry the last known average forward
                    let next = data
                        .range((Excluded(i), Included(MAX_PWM_VALUE)))
                        .find(|(_, samples)| !samples.is_empty());
                    let seed = match next {
                        Some((&next_idx, samples)) => {
                            let next_avg = util::avg(samples);
                            let t = util::ratio(i as f64, last_idx as f64, next_idx as f64);
                            last_avg + t * (next_avg - last_avg)
                        }
                        None => last_avg,
                    };
                    window.append(seed);
                }
            }

            while !window.is_full() {
                window.append(window.avg());
            }
            state.pwm_map.insert(i, window);
        }

        let (start_pwm, max_pwm) = compute_pwm_boundaries(&state.pwm_map);
        state.start_pwm = start_pwm;
        state.max_pwm = max_pwm;
        // runtime never-stop enforcement may push this up later
        state.min_pwm = start_pwm;

        debug!(
            fan = %self.config.id,
            start_pwm,
            max_pwm,
            "Attached PWM curve data"
        );
        Ok(())
    }
}

fn compute_pwm_boundaries(pwm_map: &BTreeMap<u8, RollingWindow>) -> (u8, u8) {
    let mut start_pwm: Option<u8> = None;
    let mut max_pwm = MAX_PWM_VALUE;
    let mut max_rpm = 0.0;

    for (&pwm, window) in pwm_map {
        let avg_rpm = window.avg();
        if avg_rpm > max_rpm {
            max_rpm = avg_rpm;
            max_pwm = pwm;
        }
        if avg_rpm > 0.0 && start_pwm.is_none() {
            start_pwm = Some(pwm);
        }
    }

    match start_pwm {
        Some(start) => (start, max_pwm),
        // no sample ever produced RPM, assume the full range
        None => (MIN_PWM_VALUE, MAX_PWM_VALUE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory device backed by plain cells.
    struct MockFanDevice {
        pwm: StdMutex<u8>,
        rpm: StdMutex<f64>,
        pwm_enable: StdMutex<u8>,
    }

    impl MockFanDevice {
        fn new() -> Self {
            Self {
                pwm: StdMutex::new(0),
                rpm: StdMutex::new(0.0),
                pwm_enable: StdMutex::new(2),
            }
        }
    }

    impl FanDevice for MockFanDevice {
        fn read_pwm(&self) -> Result<u8> {
            Ok(*self.pwm.lock().unwrap())
        }

        fn write_pwm(&self, pwm: u8) -> Result<()> {
            *self.pwm.lock().unwrap() = pwm;
            Ok(())
        }

        fn read_rpm(&self) -> Result<f64> {
            Ok(*self.rpm.lock().unwrap())
        }

        fn read_pwm_enable(&self) -> Result<u8> {
            Ok(*self.pwm_enable.lock().unwrap())
        }

        fn write_pwm_enable(&self, mode: u8) -> Result<()> {
            *self.pwm_enable.lock().unwrap() = mode;
            Ok(())
        }
    }

    fn test_fan() -> Fan {
        let config = FanConfig {
            id: "fan1".to_string(),
            curve: "curve".to_string(),
            never_stop: false,
            hwmon: None,
            file: None,
            cmd: None,
        };
        Fan::new(config, Box::new(MockFanDevice::new()), 10)
    }

    fn curve_data(points: &[(u8, f64)]) -> BTreeMap<u8, Vec<f64>> {
        points.iter().map(|&(pwm, rpm)| (pwm, vec![rpm])).collect()
    }

    #[test]
    fn test_linear_fan_boundaries() {
        let fan = test_fan();
        fan.attach_pwm_rpm_data(&curve_data(&[(0, 0.0), (255, 255.0)]))
            .unwrap();

        assert_eq!(fan.start_pwm(), 1);
        assert_eq!(fan.max_pwm(), 255);
    }

    #[test]
    fn test_never_stopping_fan_boundaries() {
        let fan = test_fan();
        fan.attach_pwm_rpm_data(&curve_data(&[(0, 50.0), (50, 50.0), (255, 255.0)]))
            .unwrap();

        assert_eq!(fan.start_pwm(), 0);
        assert_eq!(fan.max_pwm(), 255);
    }

    #[test]
    fn test_capped_fan_boundaries() {
        let fan = test_fan();
        let mut data = curve_data(&[(6, 20.0), (200, 200.0)]);
        for pwm in 0..=5u8 {
            data.insert(pwm, vec![0.0]);
        }
        fan.attach_pwm_rpm_data(&data).unwrap();

        assert_eq!(fan.start_pwm(), 6);
        assert_eq!(fan.max_pwm(), 200);
    }

    #[test]
    fn test_capped_never_stopping_fan_boundaries() {
        let fan = test_fan();
        fan.attach_pwm_rpm_data(&curve_data(&[(0, 50.0), (50, 50.0), (200, 200.0)]))
            .unwrap();

        assert_eq!(fan.start_pwm(), 0);
        assert_eq!(fan.max_pwm(), 200);
    }

    #[test]
    fn test_boundaries_on_strictly_increasing_map() {
        let fan = test_fan();
        let data: BTreeMap<u8, Vec<f64>> =
            (0..=255u8).map(|pwm| (pwm, vec![pwm as f64 * 4.0])).collect();
        fan.attach_pwm_rpm_data(&data).unwrap();

        assert_eq!(fan.start_pwm(), 1);
        assert_eq!(fan.max_pwm(), 255);
    }

    #[test]
    fn test_boundaries_without_any_rpm() {
        let fan = test_fan();
        let data: BTreeMap<u8, Vec<f64>> = (0..=255u8).map(|pwm| (pwm, vec![0.0])).collect();
        fan.attach_pwm_rpm_data(&data).unwrap();

        assert_eq!(fan.start_pwm(), 0);
        assert_eq!(fan.max_pwm(), 255);
    }

    #[test]
    fn test_attach_interpolates_gaps() {
        let fan = test_fan();
        fan.attach_pwm_rpm_data(&curve_data(&[(0, 0.0), (100, 1000.0)]))
            .unwrap();

        let samples = fan.pwm_rpm_samples();
        // midway between the two recorded keys
        let window_avg = util::avg(&samples[&50]);
        assert!((window_avg - 500.0).abs() < 1.0);
        // past the last recorded key the last value carries forward
        let window_avg = util::avg(&samples[&200]);
        assert!((window_avg - 1000.0).abs() < 1.0);
    }

    #[test]
    fn test_attach_fills_windows_to_capacity() {
        let fan = test_fan();
        fan.attach_pwm_rpm_data(&curve_data(&[(0, 0.0), (255, 255.0)]))
            .unwrap();

        let samples = fan.pwm_rpm_samples();
        for pwm in [0u8, 1, 128, 255] {
            assert_eq!(samples[&pwm].len(), 10, "window for pwm {pwm} not full");
        }
    }

    #[test]
    fn test_attach_empty_data_is_rejected() {
        let fan = test_fan();
        let err = fan.attach_pwm_rpm_data(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, AerofluxError::InvalidCurveData(_)));

        let err = fan
            .attach_pwm_rpm_data(&curve_data(&[]))
            .unwrap_err();
        assert!(matches!(err, AerofluxError::InvalidCurveData(_)));
    }

    #[test]
    fn test_attach_resets_min_pwm_to_start_pwm() {
        let fan = test_fan();
        fan.set_min_pwm(42);
        fan.attach_pwm_rpm_data(&curve_data(&[(6, 20.0), (200, 200.0)]))
            .unwrap();
        assert_eq!(fan.min_pwm(), 6);
    }

    #[test]
    fn test_measure_rpm_updates_average_and_map() {
        let config = FanConfig {
            id: "fan1".to_string(),
            curve: "curve".to_string(),
            never_stop: false,
            hwmon: None,
            file: None,
            cmd: None,
        };
        let device = MockFanDevice::new();
        *device.rpm.lock().unwrap() = 1000.0;
        *device.pwm.lock().unwrap() = 128;
        let fan = Fan::new(config, Box::new(device), 10);

        fan.measure_rpm().unwrap();
        assert!(fan.rpm_avg() > 0.0);
        let samples = fan.pwm_rpm_samples();
        assert_eq!(samples[&128], vec![1000.0]);
    }

    #[test]
    fn test_set_pwm_records_last_set() {
        let fan = test_fan();
        assert_eq!(fan.last_set_pwm(), None);
        fan.set_pwm(99).unwrap();
        assert_eq!(fan.last_set_pwm(), Some(99));
    }
}
