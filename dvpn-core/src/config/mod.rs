//! Configuration module
//!
//! Handles loading and saving bridge configuration from TOML files.

use crate::types::ServiceType;
use serde::{Deserialize, Serialize};

pub mod toml_config;

/// Default Tequilapi address of a locally running engine
pub const DEFAULT_ENGINE_ADDRESS: &str = "http://127.0.0.1:4050";

/// Engine connection settings
///
/// Describes where the engine's control API lives and how long each call
/// may take before it is reported as timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the engine control API
    #[serde(default = "default_address")]
    pub address: String,

    /// Consumer identity used for connect requests
    #[serde(default)]
    pub identity: Option<String>,

    /// Service requested when connecting
    #[serde(default)]
    pub service_type: ServiceType,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,

    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,

    /// Cadence of the engine event feed
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_address() -> String {
    DEFAULT_ENGINE_ADDRESS.to_string()
}
fn default_connect_timeout() -> u64 {
    15_000
}
fn default_disconnect_timeout() -> u64 {
    5_000
}
fn default_status_timeout() -> u64 {
    3_000
}
fn default_poll_interval() -> u64 {
    1_000
}

impl EngineConfig {
    /// Create a configuration for the given engine address
    pub fn new(address: String) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err("Engine address cannot be empty".to_string());
        }

        match url::Url::parse(&self.address) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(format!(
                    "Engine address must use http or https, got: {}",
                    url.scheme()
                ))
            }
            Err(e) => return Err(format!("Engine address is not a valid URL: {}", e)),
        }

        if self.connect_timeout_ms == 0 || self.disconnect_timeout_ms == 0 || self.status_timeout_ms == 0 {
            return Err("Timeouts cannot be zero".to_string());
        }

        if self.poll_interval_ms == 0 {
            return Err("Poll interval cannot be zero".to_string());
        }

        if let Some(identity) = &self.identity {
            if identity.trim().is_empty() {
                return Err("Identity cannot be blank".to_string());
            }
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            identity: None,
            service_type: ServiceType::default(),
            connect_timeout_ms: default_connect_timeout(),
            disconnect_timeout_ms: default_disconnect_timeout(),
            status_timeout_ms: default_status_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Event relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Statistics arriving within this window are coalesced into one UI update
    #[serde(default = "default_statistics_window")]
    pub statistics_window_ms: u64,
}

fn default_statistics_window() -> u64 {
    500
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            statistics_window_ms: default_statistics_window(),
        }
    }
}
