//! TOML configuration file I/O
//!
//! Handles loading and saving bridge configuration to/from TOML files
//! in the user's configuration directory.

use crate::bridge::supervisor::RetryPolicy;
use crate::config::{EngineConfig, RelayConfig};
use crate::error::{ConfigError, DvpnError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Complete TOML configuration structure
///
/// Contains engine settings plus optional retry and relay tuning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Engine connection settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry policy settings (optional)
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Event relay settings (optional)
    #[serde(default)]
    pub relay: Option<RelayConfig>,
}

impl TomlConfig {
    /// Create a new TOML configuration
    pub fn new(engine: EngineConfig, retry: Option<RetryPolicy>, relay: Option<RelayConfig>) -> Self {
        Self { engine, retry, relay }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), DvpnError> {
        self.engine
            .validate()
            .map_err(|message| ConfigError::ValidationError { message })?;

        if let Some(ref policy) = self.retry {
            debug!("Validating retry policy from config");
            policy.validate().map_err(|e| {
                warn!("Retry policy validation failed: {}", e);
                ConfigError::ValidationError {
                    message: format!("Invalid retry policy: {}", e),
                }
            })?;
        }

        if let Some(ref relay) = self.relay {
            if relay.statistics_window_ms == 0 {
                return Err(ConfigError::ValidationError {
                    message: "statistics_window_ms cannot be zero".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, DvpnError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            },
            _ => ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            },
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| ConfigError::ValidationError {
            message: format!("Failed to parse config file: {}", e),
        })?;

        config.validate()?;

        let policy = config.retry_policy();
        info!(
            "Loaded engine config: address={}, max_attempts={}, base_delay={}ms, max_delay={}ms",
            config.engine.address, policy.max_attempts, policy.base_delay_ms, policy.max_delay_ms
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), DvpnError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        std::fs::write(path, contents).map_err(|_| ConfigError::SaveFailed {
            path: path.to_string_lossy().to_string(),
        })?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Retry policy, or the default when not configured
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    /// Relay settings, or the default when not configured
    pub fn relay_config(&self) -> RelayConfig {
        self.relay.clone().unwrap_or_default()
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default preferences file name
const PREFERENCES_FILE_NAME: &str = "preferences.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/dvpn, or DVPN_CONFIG_DIR environment variable if set
pub fn get_config_dir() -> Result<PathBuf, DvpnError> {
    if let Ok(config_dir) = std::env::var("DVPN_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| ConfigError::IoError {
        message: "HOME environment variable not set".to_string(),
    })?;

    Ok(PathBuf::from(home).join(".config").join("dvpn"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, DvpnError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the default preferences file path
pub fn get_preferences_path() -> Result<PathBuf, DvpnError> {
    Ok(get_config_dir()?.join(PREFERENCES_FILE_NAME))
}

/// Load configuration from the default TOML file
pub fn load_config() -> Result<TomlConfig, DvpnError> {
    TomlConfig::from_file(&get_config_path()?)
}

/// Load configuration, falling back to defaults when no file exists
pub fn load_config_or_default() -> Result<TomlConfig, DvpnError> {
    match load_config() {
        Err(DvpnError::Config(ConfigError::LoadFailed { path })) => {
            debug!("No configuration at {}, using defaults", path);
            Ok(TomlConfig::default())
        }
        other => other,
    }
}

/// Save configuration to the default TOML file
pub fn save_config(config: &TomlConfig) -> Result<PathBuf, DvpnError> {
    let path = get_config_path()?;
    config.to_file(&path)?;
    Ok(path)
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, DvpnError> {
    Ok(get_config_path()?.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let original = TomlConfig::new(
            EngineConfig {
                identity: Some("0x5ee8".to_string()),
                ..EngineConfig::default()
            },
            Some(RetryPolicy::default()),
            None,
        );

        original.to_file(&config_path).unwrap();
        let loaded = TomlConfig::from_file(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_missing_file_is_load_failed() {
        let temp_dir = tempdir().unwrap();
        let err = TomlConfig::from_file(&temp_dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, DvpnError::Config(ConfigError::LoadFailed { .. })));
    }

    #[test]
    fn test_invalid_retry_policy_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[engine]
address = "http://127.0.0.1:4050"

[retry]
max_attempts = 0
"#,
        )
        .unwrap();

        let err = TomlConfig::from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("Invalid retry policy"));
    }
}
