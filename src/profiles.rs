//! Per-title profile management for the AutoConv daemon.
//!
//! Stores and loads title-specific tuning based on the host-reported app id,
//! so different games keep their own convergence behavior.

use crate::config::{settings_dir, Tunables};
use crate::error::ProfileError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Tuning profile for a specific title
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TitleProfile {
    /// Host-reported application id
    pub app_id: String,
    /// Title name (for display)
    pub name: String,
    /// Tuning applied while this title is active
    pub tunables: Tunables,
}

impl TitleProfile {
    pub fn new(app_id: String, name: String, tunables: Tunables) -> Self {
        Self {
            app_id,
            name,
            tunables,
        }
    }
}

/// Profile manager for loading/saving title profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileManager {
    /// Map of app id to profile
    profiles: HashMap<String, TitleProfile>,
    /// Currently active title app id
    #[serde(skip)]
    current_app_id: Option<String>,
    /// Where this manager persists itself
    #[serde(skip, default = "ProfileManager::profiles_path")]
    path: PathBuf,
    /// Tuning used when no profile matches
    pub global_default: Tunables,
}

impl Default for ProfileManager {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            current_app_id: None,
            path: Self::profiles_path(),
            global_default: Tunables::default(),
        }
    }
}

impl ProfileManager {
    /// Get the profiles file path
    pub fn profiles_path() -> PathBuf {
        settings_dir().join("profiles.json")
    }

    /// Load profiles from file or return default
    pub fn load_or_default() -> Result<Self, ProfileError> {
        Self::load_from(&Self::profiles_path())
    }

    /// Load profiles from a specific path or return default
    pub fn load_from(path: &std::path::Path) -> Result<Self, ProfileError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ProfileError::LoadFailed(e.to_string()))?;
            match serde_json::from_str::<ProfileManager>(&contents) {
                Ok(mut manager) => {
                    manager.path = path.to_path_buf();
                    info!("Loaded {} title profiles from {:?}", manager.profiles.len(), path);
                    Ok(manager)
                }
                Err(e) => {
                    warn!("Failed to parse profiles.json: {}, using defaults", e);
                    Ok(Self::with_path(path))
                }
            }
        } else {
            info!("No profiles.json found, using defaults");
            Ok(Self::with_path(path))
        }
    }

    /// Default manager persisting to the given path.
    pub fn with_path(path: &std::path::Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..Self::default()
        }
    }

    /// Save profiles to the path they were loaded from
    pub fn save(&self) -> Result<(), ProfileError> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProfileError::SaveFailed(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ProfileError::SaveFailed(e.to_string()))?;

        // Atomic write
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &json).map_err(|e| ProfileError::SaveFailed(e.to_string()))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| ProfileError::SaveFailed(e.to_string()))?;

        info!("Saved {} profiles to {:?}", self.profiles.len(), self.path);
        Ok(())
    }

    /// Get profile for a specific app id
    pub fn get_profile(&self, app_id: &str) -> Option<&TitleProfile> {
        self.profiles.get(app_id)
    }

    /// Set or update a profile
    pub fn set_profile(&mut self, profile: TitleProfile) {
        info!("Setting profile for {} ({})", profile.name, profile.app_id);
        self.profiles.insert(profile.app_id.clone(), profile);
    }

    /// Remove a profile
    pub fn remove_profile(&mut self, app_id: &str) -> Option<TitleProfile> {
        self.profiles.remove(app_id)
    }

    /// Get all profiles
    pub fn all_profiles(&self) -> Vec<&TitleProfile> {
        self.profiles.values().collect()
    }

    /// Set current active title
    pub fn set_current_title(&mut self, app_id: Option<String>) {
        self.current_app_id = app_id;
    }

    /// Get current active title app id
    pub fn current_title(&self) -> Option<&String> {
        self.current_app_id.as_ref()
    }

    /// Tuning for the current title (profile or global default)
    pub fn tunables_for_current(&self) -> Tunables {
        if let Some(app_id) = &self.current_app_id {
            if let Some(profile) = self.profiles.get(app_id) {
                return profile.tunables.clone();
            }
        }
        self.global_default.clone()
    }
}

/// Profile list response for IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileListResponse {
    pub profiles: Vec<TitleProfile>,
    pub current_app_id: Option<String>,
    pub global_default: Tunables,
}

impl From<&ProfileManager> for ProfileListResponse {
    fn from(manager: &ProfileManager) -> Self {
        Self {
            profiles: manager.profiles.values().cloned().collect(),
            current_app_id: manager.current_app_id.clone(),
            global_default: manager.global_default.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_profile_lookup_falls_back_to_global() {
        let mut manager = ProfileManager::default();
        let mut tunables = Tunables::default();
        tunables.max_convergence = 2.0;
        manager.set_profile(TitleProfile::new(
            "demo-1".to_string(),
            "Demo Title".to_string(),
            tunables.clone(),
        ));

        manager.set_current_title(Some("demo-1".to_string()));
        assert_eq!(manager.tunables_for_current(), tunables);

        manager.set_current_title(Some("unknown".to_string()));
        assert_eq!(manager.tunables_for_current(), manager.global_default);

        manager.set_current_title(None);
        assert_eq!(manager.tunables_for_current(), manager.global_default);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let mut manager = ProfileManager::with_path(&path);
        let mut tunables = Tunables::default();
        tunables.initial_popout = 0.45;
        manager.set_profile(TitleProfile::new(
            "demo-2".to_string(),
            "Other Title".to_string(),
            tunables.clone(),
        ));
        manager.save().unwrap();

        let loaded = ProfileManager::load_from(&path).unwrap();
        assert_eq!(loaded.get_profile("demo-2").unwrap().tunables, tunables);
        // The active title is runtime state and never persisted.
        assert_eq!(loaded.current_title(), None);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(&path, "not json").unwrap();

        let loaded = ProfileManager::load_from(&path).unwrap();
        assert!(loaded.all_profiles().is_empty());
    }
}
