//! Core library for the dvpn client bridge
//!
//! This crate provides the session core that sits between a UI and the
//! native decentralized-VPN engine: engine control, connection state,
//! command dispatch, event relay and retry/recovery supervision.

pub mod error;
pub mod types;

pub mod bridge;
pub mod config;
pub mod engine;
pub mod format;
pub mod store;

/// Environment variable holding a tracing filter, e.g. `dvpn_core=debug`
pub const LOG_ENV: &str = "DVPN_LOG";

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr with pretty formatting. The filter defaults to
/// `info` and can be overridden with `DVPN_LOG`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry().with(journal_layer).with(filter).try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    Ok(())
}
