//! PWM→RPM persistence
//!
//! The initialization sequence is slow and noisy (it sweeps the whole PWM
//! range), so its measurements are kept across restarts: one JSON file per
//! fan id under the configured db path. The format is a plain map from PWM
//! value to the list of RPM samples taken at that value.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use af_error::{AerofluxError, Result};
use tracing::debug;

pub struct Persistence {
    db_path: PathBuf,
}

impl Persistence {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn fan_data_path(&self, fan_id: &str) -> PathBuf {
        self.db_path.join(format!("{fan_id}.json"))
    }

    /// Load the persisted PWM→RPM samples of a fan.
    ///
    /// A fan that was never initialized yields [`AerofluxError::PwmDataMissing`];
    /// the caller recovers by running the initialization sequence.
    pub fn load_fan_pwm_data(&self, fan_id: &str) -> Result<BTreeMap<u8, Vec<f64>>> {
        let path = self.fan_data_path(fan_id);
        if !path.exists() {
            return Err(AerofluxError::PwmDataMissing(fan_id.to_string()));
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| AerofluxError::persistence(format!("reading {}: {e}", path.display())))?;
        let data: BTreeMap<u8, Vec<f64>> = serde_json::from_str(&contents)?;
        debug!(fan = %fan_id, entries = data.len(), "Loaded PWM curve data");
        Ok(data)
    }

    /// Persist the PWM→RPM samples of a fan, replacing the file atomically.
    pub fn save_fan_pwm_data(&self, fan_id: &str, data: &BTreeMap<u8, Vec<f64>>) -> Result<()> {
        fs::create_dir_all(&self.db_path)
            .map_err(|e| AerofluxError::persistence(format!("creating db path: {e}")))?;

        let path = self.fan_data_path(fan_id);
        let json = serde_json::to_string(data)?;

        // write to a temp file then rename so a crash never leaves a torn file
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .map_err(|e| AerofluxError::persistence(format!("creating {}: {e}", temp_path.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| AerofluxError::persistence(format!("writing {}: {e}", temp_path.display())))?;
        file.sync_all()
            .map_err(|e| AerofluxError::persistence(format!("syncing {}: {e}", temp_path.display())))?;
        drop(file);

        fs::rename(&temp_path, &path)
            .map_err(|e| AerofluxError::persistence(format!("replacing {}: {e}", path.display())))?;

        debug!(fan = %fan_id, entries = data.len(), "Saved PWM curve data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_data_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        let err = persistence.load_fan_pwm_data("fan1").unwrap_err();
        assert!(matches!(err, AerofluxError::PwmDataMissing(_)));
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());

        let mut data = BTreeMap::new();
        data.insert(0u8, vec![0.0, 0.0]);
        data.insert(128u8, vec![880.0, 900.0]);
        data.insert(255u8, vec![1800.0]);

        persistence.save_fan_pwm_data("fan1", &data).unwrap();
        let loaded = persistence.load_fan_pwm_data("fan1").unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_save_replaces_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());

        let mut data = BTreeMap::new();
        data.insert(0u8, vec![1.0]);
        persistence.save_fan_pwm_data("fan1", &data).unwrap();

        data.insert(0u8, vec![2.0]);
        persistence.save_fan_pwm_data("fan1", &data).unwrap();

        let loaded = persistence.load_fan_pwm_data("fan1").unwrap();
        assert_eq!(loaded[&0], vec![2.0]);
    }

    #[test]
    fn test_fans_do_not_share_data() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());

        let mut data = BTreeMap::new();
        data.insert(10u8, vec![100.0]);
        persistence.save_fan_pwm_data("fan1", &data).unwrap();

        assert!(persistence.load_fan_pwm_data("fan2").is_err());
    }

    #[test]
    fn test_corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        fs::write(dir.path().join("fan1.json"), "{not json").unwrap();

        let err = persistence.load_fan_pwm_data("fan1").unwrap_err();
        assert!(matches!(err, AerofluxError::JsonParse(_)));
    }
}
