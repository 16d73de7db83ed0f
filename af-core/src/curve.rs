//! Speed-curve evaluator
//!
//! A curve maps sensor readings to a PWM value in 0..=255. Three variants:
//! linear over one sensor (optionally through an explicit step table), PID
//! over one sensor, and functions (minimum | average | maximum | delta) over
//! other curves. The validator rejects cycles before anything is constructed,
//! so the curve graph is a DAG and recursive evaluation is well-founded.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use af_error::{AerofluxError, Result};
use tracing::warn;

use crate::config::{
    CurveConfig, FUNCTION_AVERAGE, FUNCTION_DELTA, FUNCTION_MAXIMUM, FUNCTION_MINIMUM,
};
use crate::fan::MAX_PWM_VALUE;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveFunction {
    Minimum,
    Average,
    Maximum,
    /// Spread between the largest and smallest input.
    Delta,
}

impl CurveFunction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            FUNCTION_MINIMUM => Some(Self::Minimum),
            FUNCTION_AVERAGE => Some(Self::Average),
            FUNCTION_MAXIMUM => Some(Self::Maximum),
            FUNCTION_DELTA => Some(Self::Delta),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum CurveKind {
    Linear {
        sensor_id: String,
        min: f64,
        max: f64,
        steps: Option<BTreeMap<i64, u8>>,
    },
    Pid {
        sensor_id: String,
        set_point: f64,
        loop_state: Mutex<PidLoop>,
    },
    Function {
        function: CurveFunction,
        curve_ids: Vec<String>,
    },
}

#[derive(Debug)]
pub struct SpeedCurve {
    id: String,
    kind: CurveKind,
}

impl SpeedCurve {
    /// Build a curve from its (validated) configuration.
    pub fn from_config(config: &CurveConfig) -> Result<Self> {
        let kind = if let Some(linear) = &config.linear {
            CurveKind::Linear {
                sensor_id: linear.sensor.clone(),
                min: linear.min,
                max: linear.max,
                steps: linear.steps.clone(),
            }
        } else if let Some(pid) = &config.pid {
            CurveKind::Pid {
                sensor_id: pid.sensor.clone(),
                set_point: pid.set_point,
                loop_state: Mutex::new(PidLoop::new(pid.kp, pid.ki, pid.kd)),
            }
        } else if let Some(function) = &config.function {
            let parsed = CurveFunction::parse(&function.function).ok_or_else(|| {
                AerofluxError::config(format!(
                    "Curve {}: unsupported function type '{}', use one of: minimum | average | maximum | delta",
                    config.id, function.function
                ))
            })?;
            CurveKind::Function {
                function: parsed,
                curve_ids: function.curves.clone(),
            }
        } else {
            return Err(AerofluxError::config(format!(
                "Curve {}: sub-configuration for curve is missing, use one of: linear | pid | function",
                config.id
            )));
        };

        Ok(Self {
            id: config.id.clone(),
            kind,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Evaluate the curve against the current sensor readings.
    ///
    /// Pure except for the PID variant's internal state update, which is
    /// serialized behind a mutex so a curve shared between fan loops stays
    /// consistent.
    pub fn evaluate(&self, registry: &Registry) -> Result<u8> {
        match &self.kind {
            CurveKind::Linear {
                sensor_id,
                min,
                max,
                steps,
            } => {
                let value = registry.sensor(sensor_id)?.moving_avg();
                match steps {
                    Some(steps) => Ok(interpolate_steps(steps, value)),
                    None => {
                        let t = crate::util::ratio(value, *min, *max).clamp(0.0, 1.0);
                        Ok((t * MAX_PWM_VALUE as f64).round() as u8)
                    }
                }
            }
            CurveKind::Pid {
                sensor_id,
                set_point,
                loop_state,
            } => {
                let value = registry.sensor(sensor_id)?.moving_avg();
                let mut pid = loop_state.lock().unwrap_or_else(|e| e.into_inner());
                let output = pid.update(*set_point, value);
                Ok((output * MAX_PWM_VALUE as f64).round() as u8)
            }
            CurveKind::Function {
                function,
                curve_ids,
            } => {
                let mut values = Vec::with_capacity(curve_ids.len());
                for curve_id in curve_ids {
                    let curve = registry.curve(curve_id)?;
                    values.push(curve.evaluate(registry)? as i64);
                }
                Ok(apply_function(&self.id, *function, &values))
            }
        }
    }
}

/// Piecewise-linear interpolation over an explicit step table.
///
/// Outside the key range the nearest endpoint's value applies.
fn interpolate_steps(steps: &BTreeMap<i64, u8>, value: f64) -> u8 {
    let mut iter = steps.iter();
    let (first_key, first_value) = match iter.next() {
        Some((&k, &v)) => (k, v),
        None => return 0,
    };
    if value <= first_key as f64 {
        return first_value;
    }

    let mut lower = (first_key, first_value);
    for (&key, &step_value) in steps.iter() {
        if value >= key as f64 {
            lower = (key, step_value);
            continue;
        }
        // first key above the value: interpolate between the neighbors
        let t = crate::util::ratio(value, lower.0 as f64, key as f64);
        let span = step_value as f64 - lower.1 as f64;
        return (lower.1 as f64 + t * span).round() as u8;
    }

    // above the last key
    lower.1
}

fn apply_function(curve_id: &str, function: CurveFunction, values: &[i64]) -> u8 {
    if values.is_empty() {
        warn!(curve = %curve_id, "Function curve has no inputs, falling back to 0");
        return 0;
    }

    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    let result = match function {
        CurveFunction::Minimum => min,
        CurveFunction::Maximum => max,
        CurveFunction::Average => values.iter().sum::<i64>() / values.len() as i64,
        CurveFunction::Delta => max - min,
    };
    result.clamp(0, MAX_PWM_VALUE as i64) as u8
}

// ============================================================================
// PID loop
// ============================================================================

/// Textbook PID with conditional integration.
///
/// The output is interpreted as a 0..=1 ratio of full fan speed. While the
/// output is saturated and the error would push it further out of range, the
/// integral holds (no windup).
#[derive(Debug)]
pub struct PidLoop {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: Option<f64>,
    last_update: Option<Instant>,
}

impl PidLoop {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: None,
            last_update: None,
        }
    }

    pub fn update(&mut self, set_point: f64, measured: f64) -> f64 {
        let now = Instant::now();
        let dt = match self.last_update {
            Some(last) => now.duration_since(last).as_secs_f64(),
            None => 0.0,
        };

        let error = set_point - measured;
        let derivative = match self.last_error {
            Some(last_error) if dt > 0.0 => (error - last_error) / dt,
            _ => 0.0,
        };

        let unclamped = self.kp * error + self.ki * self.integral + self.kd * derivative;
        let saturated = !(0.0..=1.0).contains(&unclamped);
        // the integral term moves in the direction of ki * error; only let it
        // accumulate when that direction leads back into range
        let pushes_further = (unclamped > 1.0 && self.ki * error > 0.0)
            || (unclamped < 0.0 && self.ki * error < 0.0);
        if !saturated || !pushes_further {
            self.integral += error * dt;
        }

        let output = self.kp * error + self.ki * self.integral + self.kd * derivative;

        self.last_error = Some(error);
        self.last_update = Some(now);
        output.clamp(0.0, 1.0)
    }
}
