//! Configuration validation
//!
//! Runs once before any fan loop starts. Check order: id uniqueness for all
//! entity kinds first, then per-entity sub-configuration presence, then
//! reference integrity, and finally cycle detection over the curve graph.

use std::collections::{HashMap, HashSet};

use af_error::{AerofluxError, Result};

use super::{
    Config, CurveConfig, FanConfig, SensorConfig, FUNCTION_AVERAGE, FUNCTION_DELTA,
    FUNCTION_MAXIMUM, FUNCTION_MINIMUM,
};

/// Validate a whole configuration. The first violation is returned; a passing
/// configuration is safe to build a [`crate::registry::Registry`] from.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_unique_ids(config)?;

    for fan in &config.fans {
        validate_fan_sub_config(fan)?;
    }
    for curve in &config.curves {
        validate_curve_sub_config(curve)?;
    }
    for sensor in &config.sensors {
        validate_sensor_sub_config(sensor)?;
    }

    for fan in &config.fans {
        validate_fan_references(fan, config)?;
    }
    for curve in &config.curves {
        validate_curve_references(curve, config)?;
    }

    validate_no_dependency_cycles(config)
}

fn config_error(msg: String) -> AerofluxError {
    AerofluxError::config(msg)
}

fn validate_unique_ids(config: &Config) -> Result<()> {
    fn check<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                return Err(config_error(format!("Duplicate {kind} id detected: {id}")));
            }
        }
        Ok(())
    }

    check("fan", config.fans.iter().map(|f| f.id.as_str()))?;
    check("curve", config.curves.iter().map(|c| c.id.as_str()))?;
    check("sensor", config.sensors.iter().map(|s| s.id.as_str()))
}

fn validate_fan_sub_config(fan: &FanConfig) -> Result<()> {
    let count = [fan.hwmon.is_some(), fan.file.is_some(), fan.cmd.is_some()]
        .iter()
        .filter(|&&set| set)
        .count();
    match count {
        0 => Err(config_error(format!(
            "Fan {}: sub-configuration for fan is missing, use one of: hwmon | file | cmd",
            fan.id
        ))),
        1 => Ok(()),
        _ => Err(config_error(format!(
            "Fan {}: multiple sub-configurations for fan, use only one of: hwmon | file | cmd",
            fan.id
        ))),
    }
}

fn validate_curve_sub_config(curve: &CurveConfig) -> Result<()> {
    let count = [
        curve.linear.is_some(),
        curve.pid.is_some(),
        curve.function.is_some(),
    ]
    .iter()
    .filter(|&&set| set)
    .count();
    match count {
        0 => Err(config_error(format!(
            "Curve {}: sub-configuration for curve is missing, use one of: linear | pid | function",
            curve.id
        ))),
        1 => Ok(()),
        _ => Err(config_error(format!(
            "Curve {}: multiple sub-configurations for curve, use only one of: linear | pid | function",
            curve.id
        ))),
    }
}

fn validate_sensor_sub_config(sensor: &SensorConfig) -> Result<()> {
    let count = [
        sensor.hwmon.is_some(),
        sensor.file.is_some(),
        sensor.cmd.is_some(),
    ]
    .iter()
    .filter(|&&set| set)
    .count();
    match count {
        0 => Err(config_error(format!(
            "Sensor {}: sub-configuration for sensor is missing, use one of: hwmon | file | cmd",
            sensor.id
        ))),
        1 => Ok(()),
        _ => Err(config_error(format!(
            "Sensor {}: multiple sub-configurations for sensor, use only one of: hwmon | file | cmd",
            sensor.id
        ))),
    }
}

fn validate_fan_references(fan: &FanConfig, config: &Config) -> Result<()> {
    if !config.curves.iter().any(|c| c.id == fan.curve) {
        return Err(config_error(format!(
            "Fan {}: no curve definition with id '{}' found",
            fan.id, fan.curve
        )));
    }
    Ok(())
}

fn validate_curve_references(curve: &CurveConfig, config: &Config) -> Result<()> {
    let sensor_id = match (&curve.linear, &curve.pid) {
        (Some(linear), _) => Some(&linear.sensor),
        (_, Some(pid)) => Some(&pid.sensor),
        _ => None,
    };
    if let Some(sensor_id) = sensor_id {
        if sensor_id.is_empty() {
            return Err(config_error(format!("Curve {}: missing sensor id", curve.id)));
        }
        if !config.sensors.iter().any(|s| &s.id == sensor_id) {
            return Err(config_error(format!(
                "Curve {}: no sensor definition with id '{}' found",
                curve.id, sensor_id
            )));
        }
    }

    if let Some(function) = &curve.function {
        if function.curves.iter().any(|dep| dep == &curve.id) {
            return Err(config_error(format!(
                "Curve {}: a curve cannot reference itself",
                curve.id
            )));
        }
        match function.function.as_str() {
            FUNCTION_MINIMUM | FUNCTION_AVERAGE | FUNCTION_MAXIMUM | FUNCTION_DELTA => {}
            other => {
                return Err(config_error(format!(
                    "Curve {}: unsupported function type '{}', use one of: minimum | average | maximum | delta",
                    curve.id, other
                )))
            }
        }
        for dep in &function.curves {
            if !config.curves.iter().any(|c| &c.id == dep) {
                return Err(config_error(format!(
                    "Curve {}: no curve definition with id '{}' found",
                    curve.id, dep
                )));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Cycle detection
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// DFS with three-coloring over the directed curve graph (function curve →
/// its inputs). A grey-reaching-grey edge is a cycle; the reported message
/// carries the node ids along the offending path.
fn validate_no_dependency_cycles(config: &Config) -> Result<()> {
    let graph: HashMap<&str, &[String]> = config
        .curves
        .iter()
        .filter_map(|c| {
            c.function
                .as_ref()
                .map(|f| (c.id.as_str(), f.curves.as_slice()))
        })
        .collect();

    let mut colors: HashMap<&str, Color> = config
        .curves
        .iter()
        .map(|c| (c.id.as_str(), Color::White))
        .collect();

    for curve in &config.curves {
        if colors[curve.id.as_str()] == Color::White {
            let mut path = Vec::new();
            visit(curve.id.as_str(), &graph, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    id: &'a str,
    graph: &HashMap<&str, &'a [String]>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    colors.insert(id, Color::Grey);
    path.push(id);

    if let Some(deps) = graph.get(id) {
        for dep in deps.iter() {
            match colors.get(dep.as_str()).copied() {
                Some(Color::White) => visit(dep, graph, colors, path)?,
                Some(Color::Grey) => {
                    let start = path.iter().position(|&p| p == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(dep.as_str());
                    return Err(config_error(format!(
                        "You have created a curve dependency cycle: {}",
                        cycle.join(" -> ")
                    )));
                }
                // Black nodes are already known cycle-free; ids that do not
                // resolve were rejected by the reference checks.
                _ => {}
            }
        }
    }

    path.pop();
    colors.insert(id, Color::Black);
    Ok(())
}
