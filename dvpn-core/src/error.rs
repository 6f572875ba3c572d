//! Error types for the dvpn bridge
//!
//! This module defines all error types used throughout the bridge core,
//! providing consistent error handling and user-friendly error messages.

use crate::types::{ConnectionState, FailureReason, RequestSeq};
use thiserror::Error;

/// Engine rejection code for a disconnect issued while nothing is connected
pub const CODE_NOT_CONNECTED: &str = "not_connected";

/// Engine rejection code for a connect with no matching node
pub const CODE_NO_NODE_AVAILABLE: &str = "no_node_available";

/// Engine rejection code for a connect issued without a consumer identity
pub const CODE_IDENTITY_REQUIRED: &str = "identity_required";

/// Main error type for the dvpn application
#[derive(Error, Debug)]
pub enum DvpnError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reported by the engine control client
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Errors reported by the bridge session
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Errors from the preference store
    #[error("Preference store error: {0}")]
    Store(#[from] StoreError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Invalid engine address: {address}")]
    InvalidAddress { address: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Failures surfaced by the engine control client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Control channel is down or the engine process is gone
    #[error("Engine unreachable: {reason}")]
    Unreachable { reason: String },

    /// No reply within the per-call deadline
    #[error("Engine did not reply to {operation} within {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Engine explicitly refused the request
    #[error("Engine rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl EngineError {
    /// Build a rejection with the given code
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the supervisor may retry the failed call
    ///
    /// Explicit refusals are final; only transport-level failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    /// Short machine-readable code used in UI events
    pub fn code(&self) -> &str {
        match self {
            Self::Unreachable { .. } => "unreachable",
            Self::Timeout { .. } => "timeout",
            Self::Rejected { code, .. } => code,
        }
    }
}

/// Errors reported to command submitters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Command is incompatible with the committed state
    #[error("Cannot {requested} while {current}")]
    StateConflict {
        current: ConnectionState,
        requested: String,
    },

    /// A newer command replaced this one before it completed
    #[error("Command #{seq} was superseded")]
    Superseded { seq: RequestSeq },

    /// The command resolved into a failure state
    #[error("Connection failed: {0}")]
    Failed(FailureReason),

    /// The engine refused or failed a call that has no failure state of its own
    #[error("Engine error: {0}")]
    Engine(EngineError),

    /// The bridge was torn down before the command completed
    #[error("Bridge session closed")]
    Closed,
}

/// Preference store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read preferences from {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to write preferences to {path}: {message}")]
    WriteFailed { path: String, message: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DvpnError>;
