//! Logging initialization.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    if config.format == "json" {
        let subscriber = Registry::default().with(filter).with(
            fmt::layer()
                .json()
                .with_target(config.enable_target)
                .with_thread_ids(config.enable_thread_ids),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(filter).with(
            fmt::layer()
                .with_target(config.enable_target)
                .with_thread_ids(config.enable_thread_ids),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    tracing::debug!("Logging initialized ({} format)", config.format);
    Ok(())
}
