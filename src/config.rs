//! Configuration module for persistent settings.
//!
//! This module handles loading, saving, and validating the daemon
//! configuration, including the controller tuning set.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Controller tuning, read-only to the controller once validated.
///
/// Convergence values are in the host's depth units; parallax values are in
/// normalized screen units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Tunables {
    /// Popout applied at session start
    pub initial_popout: f32,
    /// Lower convergence bound (also the anti-judder lock value)
    pub min_convergence: f32,
    /// Upper convergence bound
    pub max_convergence: f32,
    /// Minimum desired-target change before the loop retargets
    pub popout_deviation_threshold: f32,
    /// Number of recent popout samples inspected for oscillation
    pub judder_detection_window: usize,
    /// Sign flips within the window tolerated before locking low
    pub judder_threshold: u32,
    /// How long the locked-low phase holds, in seconds
    pub lock_duration_seconds: f32,
    /// Target change per manual nudge
    pub manual_step_size: f32,
    /// Half-life of the exponential approach toward the target, in seconds
    pub ramp_halflife_seconds: f32,
    /// Interaxial separation in normalized screen units
    pub separation: f32,
    /// Crossed-parallax budget at the nearest relevant depth
    pub max_crossed_parallax: f32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            initial_popout: 0.3,
            min_convergence: 0.0,
            max_convergence: 1.0,
            popout_deviation_threshold: 0.02,
            judder_detection_window: 12,
            judder_threshold: 4,
            lock_duration_seconds: 5.0,
            manual_step_size: 0.05,
            ramp_halflife_seconds: 0.25,
            separation: 0.06,
            max_crossed_parallax: 0.02,
        }
    }
}

impl Tunables {
    /// Validate tuning values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [
            ("initial_popout", self.initial_popout),
            ("min_convergence", self.min_convergence),
            ("max_convergence", self.max_convergence),
            ("popout_deviation_threshold", self.popout_deviation_threshold),
            ("lock_duration_seconds", self.lock_duration_seconds),
            ("manual_step_size", self.manual_step_size),
            ("ramp_halflife_seconds", self.ramp_halflife_seconds),
            ("separation", self.separation),
            ("max_crossed_parallax", self.max_crossed_parallax),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be a finite number, got {}",
                    name, value
                )));
            }
        }

        if self.min_convergence > self.max_convergence {
            return Err(ConfigError::ValidationError(format!(
                "min_convergence ({}) cannot be greater than max_convergence ({})",
                self.min_convergence, self.max_convergence
            )));
        }

        if self.min_convergence < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "min_convergence ({}) cannot be negative",
                self.min_convergence
            )));
        }

        if self.initial_popout < self.min_convergence || self.initial_popout > self.max_convergence {
            return Err(ConfigError::ValidationError(format!(
                "initial_popout ({}) must be within [{}, {}]",
                self.initial_popout, self.min_convergence, self.max_convergence
            )));
        }

        if self.popout_deviation_threshold < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "popout_deviation_threshold ({}) cannot be negative",
                self.popout_deviation_threshold
            )));
        }

        if self.judder_detection_window < 3 {
            return Err(ConfigError::ValidationError(format!(
                "judder_detection_window ({}) must be at least 3 samples",
                self.judder_detection_window
            )));
        }

        if self.judder_threshold < 1 {
            return Err(ConfigError::ValidationError(
                "judder_threshold must be at least 1".to_string(),
            ));
        }

        // A window of N samples holds at most N - 2 sign flips, so the
        // threshold must leave room for one more than itself.
        if (self.judder_detection_window as u64) < (self.judder_threshold as u64) + 3 {
            return Err(ConfigError::ValidationError(format!(
                "judder_detection_window ({}) too small for judder_threshold ({}), need at least {}",
                self.judder_detection_window,
                self.judder_threshold,
                self.judder_threshold + 3
            )));
        }

        if self.lock_duration_seconds <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "lock_duration_seconds ({}) must be positive",
                self.lock_duration_seconds
            )));
        }

        if self.manual_step_size <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "manual_step_size ({}) must be positive",
                self.manual_step_size
            )));
        }

        if self.ramp_halflife_seconds <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "ramp_halflife_seconds ({}) must be positive",
                self.ramp_halflife_seconds
            )));
        }

        if self.separation <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "separation ({}) must be positive",
                self.separation
            )));
        }

        if self.max_crossed_parallax < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "max_crossed_parallax ({}) cannot be negative",
                self.max_crossed_parallax
            )));
        }

        Ok(())
    }
}

/// Daemon configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Whether the automatic loop engages at startup
    pub enabled: bool,
    pub tunables: Tunables,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            tunables: Tunables::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunables.validate()
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<Config>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .map_err(|e| ConfigError::ParseError(format!("Failed to read config file: {}", e)))?;

            let config: Config = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            // Validate loaded config
            config.validate()?;
            config
        } else {
            Config::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Manager with default tunables and the automatic loop disengaged.
    ///
    /// Used when the on-disk configuration fails validation: the host falls
    /// back to static convergence while keeping manual control available.
    pub fn fallback(path: &Path) -> Self {
        Self {
            config: RwLock::new(Config {
                enabled: false,
                ..Config::default()
            }),
            path: path.to_path_buf(),
        }
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self
            .config
            .read()
            .map_err(|_| ConfigError::ValidationError("Failed to acquire read lock".to_string()))?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> Config {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| Config::default())
    }

    /// Update configuration with validation.
    pub fn update(&self, config: Config) -> Result<(), ConfigError> {
        // Validate before updating
        config.validate()?;

        let mut current = self
            .config
            .write()
            .map_err(|_| ConfigError::ValidationError("Failed to acquire write lock".to_string()))?;

        *current = config;

        // Release lock before saving
        drop(current);

        // Persist to file
        self.save()
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default config path (~/.config/autoconv/config.json).
    pub fn default_path() -> PathBuf {
        settings_dir().join("config.json")
    }
}

/// Directory holding the daemon's persistent settings.
pub(crate) fn settings_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("autoconv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.enabled);
        assert_eq!(config.tunables.min_convergence, 0.0);
        assert_eq!(config.tunables.max_convergence, 1.0);
    }

    #[test]
    fn test_config_manager_load_nonexistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.json");

        let manager = ConfigManager::load_or_default(&path).unwrap();
        let config = manager.get();

        // Should use defaults when file doesn't exist
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_manager_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        // Create and save config
        let manager = ConfigManager::load_or_default(&path).unwrap();
        let mut config = manager.get();
        config.tunables.initial_popout = 0.5;
        config.tunables.max_convergence = 2.0;
        config.tunables.manual_step_size = 0.1;
        manager.update(config.clone()).unwrap();

        // Load again and verify
        let manager2 = ConfigManager::load_or_default(&path).unwrap();
        let loaded = manager2.get();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.tunables.min_convergence = 2.0;
        config.tunables.max_convergence = 1.0;
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let result = ConfigManager::load_or_default(&path);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_fallback_is_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigManager::fallback(&path);
        let config = manager.get();
        assert!(!config.enabled);
        assert!(config.tunables.validate().is_ok());
    }

    #[test]
    fn test_validation_min_greater_than_max() {
        let mut tunables = Tunables::default();
        tunables.min_convergence = 1.5;
        tunables.max_convergence = 1.0;
        tunables.initial_popout = 1.2;

        let result = tunables.validate();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_initial_out_of_bounds() {
        let mut tunables = Tunables::default();
        tunables.initial_popout = 3.0;
        assert!(tunables.validate().is_err());

        tunables.initial_popout = -0.1;
        assert!(tunables.validate().is_err());
    }

    #[test]
    fn test_validation_window_too_small_for_threshold() {
        let mut tunables = Tunables::default();
        tunables.judder_detection_window = 4;
        tunables.judder_threshold = 4;
        let err = tunables.validate().unwrap_err();
        assert!(err.to_string().contains("judder_detection_window"));
    }

    #[test]
    fn test_validation_rejects_non_finite() {
        let mut tunables = Tunables::default();
        tunables.separation = f32::NAN;
        assert!(tunables.validate().is_err());

        let mut tunables = Tunables::default();
        tunables.max_convergence = f32::INFINITY;
        assert!(tunables.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_nonpositive_steps() {
        let mut tunables = Tunables::default();
        tunables.manual_step_size = 0.0;
        assert!(tunables.validate().is_err());

        let mut tunables = Tunables::default();
        tunables.ramp_halflife_seconds = -1.0;
        assert!(tunables.validate().is_err());

        let mut tunables = Tunables::default();
        tunables.lock_duration_seconds = 0.0;
        assert!(tunables.validate().is_err());

        let mut tunables = Tunables::default();
        tunables.separation = 0.0;
        assert!(tunables.validate().is_err());
    }

    // Strategy to generate valid Tunables values
    fn valid_tunables_strategy() -> impl Strategy<Value = Tunables> {
        (
            0.0f32..5.0,   // min_convergence
            0.0f32..5.0,   // extra up to max
            0.0f32..1.0,   // initial fraction between min and max
            0.0f32..0.5,   // deviation threshold
            7usize..64,    // window
            1u32..4,       // judder threshold
            0.1f32..30.0,  // lock duration
            0.001f32..1.0, // manual step
            0.01f32..2.0,  // ramp half-life
        )
            .prop_map(
                |(min, extra, frac, deviation, window, threshold, lock, step, ramp)| {
                    let max = min + extra;
                    Tunables {
                        initial_popout: (min + (max - min) * frac).clamp(min, max),
                        min_convergence: min,
                        max_convergence: max,
                        popout_deviation_threshold: deviation,
                        judder_detection_window: window,
                        judder_threshold: threshold,
                        lock_duration_seconds: lock,
                        manual_step_size: step,
                        ramp_halflife_seconds: ramp,
                        separation: 0.06,
                        max_crossed_parallax: 0.02,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Serializing a valid configuration to JSON and back yields an
        // equivalent configuration.
        #[test]
        fn prop_config_json_round_trip(tunables in valid_tunables_strategy(), enabled in any::<bool>()) {
            let config = Config { enabled, tunables };
            prop_assert!(config.validate().is_ok());

            let json = serde_json::to_string(&config).unwrap();
            let parsed: Config = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(config, parsed);
        }

        #[test]
        fn prop_config_file_round_trip(tunables in valid_tunables_strategy(), enabled in any::<bool>()) {
            let config = Config { enabled, tunables };
            let dir = tempdir().unwrap();
            let path = dir.path().join("config.json");

            let manager = ConfigManager::load_or_default(&path).unwrap();
            manager.update(config.clone()).unwrap();

            let manager2 = ConfigManager::load_or_default(&path).unwrap();
            prop_assert_eq!(config, manager2.get());
        }

        // Any configuration with inverted convergence bounds is rejected.
        #[test]
        fn prop_validation_rejects_inverted_bounds(
            max in 0.0f32..5.0,
            gap in 0.001f32..5.0,
        ) {
            let mut tunables = Tunables::default();
            tunables.min_convergence = max + gap;
            tunables.max_convergence = max;
            tunables.initial_popout = max;

            prop_assert!(tunables.validate().is_err());
        }
    }
}
