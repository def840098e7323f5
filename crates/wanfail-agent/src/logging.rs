//! Log filter set up once at startup and swappable at runtime.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

pub type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Install the global subscriber. `RUST_LOG` wins over `default`.
pub fn init(default: &str) -> anyhow::Result<LogHandle> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(handle)
}

/// Replace the active filter with `directive` (`debug`, `wanfail_core=trace`, ...).
pub fn set_level(handle: &LogHandle, directive: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(directive)
        .map_err(|e| format!("invalid log level {directive:?}: {e}"))?;
    handle.reload(filter).map_err(|e| e.to_string())?;
    tracing::info!(level = directive, "log level changed");
    Ok(())
}
