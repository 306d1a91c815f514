//! Stage controller configuration.
//!
//! Positions and settle times are empirical values for the current optical
//! table. They live here rather than in code so a realignment only needs a
//! new config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port for the control channel.
pub const DEFAULT_PORT: u16 = 42522;

/// Upper bound on a user-settable lens focus, in microsteps.
pub const MAX_FOCUS: i32 = 76346;

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial device the stages are daisy-chained on
    pub serial_port: String,
    /// Address the control channel listens on
    pub listen: String,
    pub positions: Positions,
    pub timing: Timing,
    pub homing: Homing,
    pub trigger: TriggerConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            positions: Positions::default(),
            timing: Timing::default(),
            homing: Homing::default(),
            trigger: TriggerConfig::default(),
        }
    }
}

impl StageConfig {
    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file. Fields absent from the file keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Stage positions in microsteps.
///
/// The rest pair parks the mirror in the MOT beam path with the lens fully
/// withdrawn. The imaging pair swings the mirror clear so the lens can advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Positions {
    pub mirror_rest: i32,
    pub lens_rest: i32,
    pub mirror_imaging: i32,
    /// Focus used when no experiment supplies one
    pub lens_imaging: i32,
}

impl Default for Positions {
    fn default() -> Self {
        Self {
            mirror_rest: 76346,
            lens_rest: 0,
            mirror_imaging: 30000,
            lens_imaging: 76346,
        }
    }
}

/// Settle times and polling limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Expected lens travel time before position polling starts
    pub lens_settle_ms: u64,
    /// Expected mirror travel time before position polling starts
    pub mirror_settle_ms: u64,
    /// Longest single wait on the trigger line before re-checking for abort
    pub edge_poll_ms: u64,
    /// Give up on a position or settings query after this many polls.
    /// `None` polls forever.
    pub max_position_polls: Option<u32>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            lens_settle_ms: 3500,
            mirror_settle_ms: 1500,
            edge_poll_ms: 1000,
            max_position_polls: None,
        }
    }
}

impl Timing {
    pub fn lens_settle(&self) -> Duration {
        Duration::from_millis(self.lens_settle_ms)
    }

    pub fn mirror_settle(&self) -> Duration {
        Duration::from_millis(self.mirror_settle_ms)
    }

    pub fn edge_poll(&self) -> Duration {
        Duration::from_millis(self.edge_poll_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Homing {
    /// Device mode bit that reads 1 once the stage has been homed
    pub homed_bit: u32,
}

impl Default for Homing {
    fn default() -> Self {
        Self { homed_bit: 7 }
    }
}

/// GPIO line carrying the experiment trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub chip: String,
    pub line: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip0".to_string(),
            line: 23,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_table_values() {
        let config = StageConfig::default();
        assert_eq!(config.positions.mirror_rest, 76346);
        assert_eq!(config.positions.lens_rest, 0);
        assert_eq!(config.positions.mirror_imaging, 30000);
        assert_eq!(config.timing.lens_settle(), Duration::from_millis(3500));
        assert_eq!(config.timing.mirror_settle(), Duration::from_millis(1500));
        assert_eq!(config.timing.max_position_polls, None);
        assert_eq!(config.homing.homed_bit, 7);
        assert_eq!(config.listen, "0.0.0.0:42522");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.json");
        std::fs::write(
            &path,
            r#"{ "serial_port": "/dev/ttyAMA0", "timing": { "max_position_polls": 50 } }"#,
        )
        .unwrap();

        let config = StageConfig::load_from_file(&path).unwrap();
        assert_eq!(config.serial_port, "/dev/ttyAMA0");
        assert_eq!(config.timing.max_position_polls, Some(50));
        assert_eq!(config.timing.lens_settle_ms, 3500);
        assert_eq!(config.positions, Positions::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.json");
        let mut config = StageConfig::default();
        config.positions.mirror_imaging = 31000;
        config.trigger.line = 17;

        config.save_to_file(&path).unwrap();
        assert_eq!(StageConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = StageConfig::load_from_file(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
