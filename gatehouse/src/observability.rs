//! Structured logging setup

use tracing::Subscriber;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

use crate::{
    config::AuthConfig,
    error::{Error, Result},
};

/// Install a JSON `tracing` subscriber filtered by the configured log level
///
/// Hosts that already own a subscriber should skip this; a second
/// installation returns [`Error::Internal`].
pub fn init_tracing(config: &AuthConfig) -> Result<()> {
    subscriber(config)
        .try_init()
        .map_err(|e| Error::Internal(format!("tracing already initialized: {}", e)))?;

    tracing::info!(issuer = %config.issuer, "Tracing initialized");

    Ok(())
}

/// JSON subscriber for `config`; an unparsable level falls back to `info`
fn subscriber(config: &AuthConfig) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish()
}
