//! Tracing setup shared by the hub, exporter and agent binaries

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// A `RUST_LOG` directive takes precedence over `default_level`, so
/// individual targets can still be turned up in the field without
/// touching the daemon's configuration.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| {
            crate::Error::Config(format!("invalid log level {default_level:?}: {e}"))
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
