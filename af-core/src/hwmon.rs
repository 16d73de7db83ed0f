//! hwmon sysfs helpers
//!
//! Enumerates `/sys/class/hwmon` chips and resolves the `platform` + `index`
//! pairs from hwmon sub-configurations to concrete sysfs file paths. The
//! device-enumeration layer runs once at startup; everything afterwards goes
//! through the resolved paths.

use std::fs;
use std::path::{Path, PathBuf};

use af_error::{AerofluxError, Result};
use tracing::debug;

use crate::config::{HwmonFanConfig, HwmonSensorConfig};

const HWMON_ROOT: &str = "/sys/class/hwmon";

#[derive(Debug, Clone)]
pub struct HwmonChip {
    /// Content of the chip's `name` file.
    pub name: String,
    /// The hwmonX tag of the chip directory.
    pub tag: String,
    pub path: PathBuf,
    /// Indices of pwmN control files.
    pub pwms: Vec<usize>,
    /// Indices of fanN_input files.
    pub fans: Vec<usize>,
    /// Indices of tempN_input files.
    pub temps: Vec<usize>,
}

/// Resolved sysfs paths for one hwmon fan.
#[derive(Debug, Clone)]
pub struct FanPaths {
    pub pwm: PathBuf,
    pub rpm: Option<PathBuf>,
    pub enable: Option<PathBuf>,
}

/// Enumerate all hwmon chips with their fan, PWM and temperature features.
pub fn scan_chips() -> Vec<HwmonChip> {
    scan_chips_at(Path::new(HWMON_ROOT))
}

pub fn scan_chips_at(root: &Path) -> Vec<HwmonChip> {
    let mut chips = Vec::new();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return chips,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let dir = fs::canonicalize(&path).unwrap_or(path);
        let name = read_trimmed(&dir.join("name")).unwrap_or_else(|| "unknown".to_string());
        let tag = dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("hwmon?")
            .to_string();

        let mut chip = HwmonChip {
            name,
            tag,
            path: dir.clone(),
            pwms: Vec::new(),
            fans: Vec::new(),
            temps: Vec::new(),
        };

        if let Ok(dir_iter) = fs::read_dir(&dir) {
            for file in dir_iter.flatten() {
                let fname = file.file_name();
                let fname = fname.to_string_lossy();
                if fname.starts_with("pwm") && !fname.contains('_') {
                    if let Some(idx) = extract_index(&fname, "pwm", "") {
                        chip.pwms.push(idx);
                    }
                } else if fname.starts_with("fan") && fname.ends_with("_input") {
                    if let Some(idx) = extract_index(&fname, "fan", "_input") {
                        chip.fans.push(idx);
                    }
                } else if fname.starts_with("temp") && fname.ends_with("_input") {
                    if let Some(idx) = extract_index(&fname, "temp", "_input") {
                        chip.temps.push(idx);
                    }
                }
            }
        }

        chip.pwms.sort_unstable();
        chip.fans.sort_unstable();
        chip.temps.sort_unstable();

        if chip.pwms.is_empty() && chip.fans.is_empty() && chip.temps.is_empty() {
            continue;
        }
        debug!(
            chip = %chip.name,
            tag = %chip.tag,
            pwms = chip.pwms.len(),
            fans = chip.fans.len(),
            temps = chip.temps.len(),
            "Found hwmon chip"
        );
        chips.push(chip);
    }

    chips
}

/// Resolve a fan's hwmon sub-configuration to its sysfs paths.
pub fn resolve_fan_paths(config: &HwmonFanConfig) -> Result<FanPaths> {
    let chip = find_chip(&config.platform, &scan_chips())?;
    resolve_fan_paths_on(&chip, config)
}

fn resolve_fan_paths_on(chip: &HwmonChip, config: &HwmonFanConfig) -> Result<FanPaths> {
    let pwm = chip.path.join(format!("pwm{}", config.index));
    if !chip.pwms.contains(&config.index) {
        return Err(AerofluxError::config(format!(
            "Platform {}: no pwm{} control found",
            config.platform, config.index
        )));
    }

    let rpm = chip
        .fans
        .contains(&config.index)
        .then(|| chip.path.join(format!("fan{}_input", config.index)));
    let enable_path = chip.path.join(format!("pwm{}_enable", config.index));
    let enable = enable_path.exists().then_some(enable_path);

    Ok(FanPaths { pwm, rpm, enable })
}

/// Resolve a sensor's hwmon sub-configuration to its tempN_input path.
pub fn resolve_sensor_path(config: &HwmonSensorConfig) -> Result<PathBuf> {
    let chip = find_chip(&config.platform, &scan_chips())?;
    if !chip.temps.contains(&config.index) {
        return Err(AerofluxError::config(format!(
            "Platform {}: no temp{}_input found",
            config.platform, config.index
        )));
    }
    Ok(chip.path.join(format!("temp{}_input", config.index)))
}

/// Match a platform selector against the scanned chips.
///
/// Selectors are either a plain chip name (`nct6798`) or name@tag
/// (`nct6798@hwmon3`) to disambiguate between chips sharing a name.
fn find_chip(platform: &str, chips: &[HwmonChip]) -> Result<HwmonChip> {
    let (want_name, want_tag) = match platform.split_once('@') {
        Some((name, tag)) => (name, Some(tag)),
        None => (platform, None),
    };

    chips
        .iter()
        .find(|chip| {
            chip.name == want_name && want_tag.map(|tag| chip.tag == tag).unwrap_or(true)
        })
        .cloned()
        .ok_or_else(|| {
            AerofluxError::config(format!("No hwmon chip matching platform '{platform}' found"))
        })
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Extract N from names like `pwm2`, `fan1_input`, `temp3_input`.
fn extract_index(fname: &str, prefix: &str, suffix: &str) -> Option<usize> {
    fname
        .strip_prefix(prefix)?
        .strip_suffix(suffix)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_chip(dir: &Path, tag: &str, name: &str) -> PathBuf {
        let chip_dir = dir.join(tag);
        fs::create_dir_all(&chip_dir).unwrap();
        fs::write(chip_dir.join("name"), format!("{name}\n")).unwrap();
        chip_dir
    }

    #[test]
    fn test_scan_finds_features() {
        let root = tempfile::tempdir().unwrap();
        let chip_dir = fake_chip(root.path(), "hwmon0", "nct6798");
        fs::write(chip_dir.join("pwm1"), "128").unwrap();
        fs::write(chip_dir.join("pwm2"), "128").unwrap();
        fs::write(chip_dir.join("pwm1_enable"), "2").unwrap();
        fs::write(chip_dir.join("fan1_input"), "900").unwrap();
        fs::write(chip_dir.join("temp1_input"), "42000").unwrap();
        // empty chip is skipped entirely
        fake_chip(root.path(), "hwmon1", "acpitz");

        let chips = scan_chips_at(root.path());
        assert_eq!(chips.len(), 1);
        let chip = &chips[0];
        assert_eq!(chip.name, "nct6798");
        assert_eq!(chip.pwms, vec![1, 2]);
        assert_eq!(chip.fans, vec![1]);
        assert_eq!(chip.temps, vec![1]);
    }

    #[test]
    fn test_find_chip_by_name_and_tag() {
        let root = tempfile::tempdir().unwrap();
        for tag in ["hwmon0", "hwmon1"] {
            let chip_dir = fake_chip(root.path(), tag, "k10temp");
            fs::write(chip_dir.join("temp1_input"), "50000").unwrap();
        }
        let chips = scan_chips_at(root.path());

        let plain = find_chip("k10temp", &chips).unwrap();
        assert_eq!(plain.name, "k10temp");

        let tagged = find_chip("k10temp@hwmon1", &chips).unwrap();
        assert_eq!(tagged.tag, "hwmon1");

        assert!(find_chip("missing", &chips).is_err());
    }

    #[test]
    fn test_resolve_fan_paths() {
        let root = tempfile::tempdir().unwrap();
        let chip_dir = fake_chip(root.path(), "hwmon0", "nct6798");
        fs::write(chip_dir.join("pwm1"), "128").unwrap();
        fs::write(chip_dir.join("pwm1_enable"), "2").unwrap();
        fs::write(chip_dir.join("fan1_input"), "900").unwrap();

        let chips = scan_chips_at(root.path());
        let config = HwmonFanConfig {
            platform: "nct6798".to_string(),
            index: 1,
        };
        let chip = find_chip(&config.platform, &chips).unwrap();
        let paths = resolve_fan_paths_on(&chip, &config).unwrap();
        assert!(paths.pwm.ends_with("pwm1"));
        assert!(paths.rpm.unwrap().ends_with("fan1_input"));
        assert!(paths.enable.unwrap().ends_with("pwm1_enable"));

        let missing = HwmonFanConfig {
            platform: "nct6798".to_string(),
            index: 7,
        };
        assert!(resolve_fan_paths_on(&chip, &missing).is_err());
    }

    #[test]
    fn test_extract_index() {
        assert_eq!(extract_index("pwm2", "pwm", ""), Some(2));
        assert_eq!(extract_index("fan1_input", "fan", "_input"), Some(1));
        assert_eq!(extract_index("temp13_input", "temp", "_input"), Some(13));
        assert_eq!(extract_index("pwm1_enable", "pwm", ""), None);
        assert_eq!(extract_index("name", "pwm", ""), None);
    }
}
