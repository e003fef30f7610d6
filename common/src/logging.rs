//! Structured logging initialization
//!
//! Provides consistent logging initialization across all stack components.

use crate::config::ConfigExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guard that keeps the tracing subscriber active.
/// Drop this at the end of main to flush logs.
pub struct LogGuard;

/// Initialize structured logging for a component.
///
/// `RUST_LOG` controls the filter (INFO when unset). Setting `LOG_FORMAT=json`
/// switches to one JSON object per line, which is what the log shipper of a
/// short-lived compute unit expects.
///
/// # Example
/// ```ignore
/// let _guard = init_logging("migration-runner");
/// info!("Starting up...");
/// ```
pub fn init_logging(component: &str) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if String::env_or("LOG_FORMAT", "text") == "json" {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }

    tracing::debug!(component, "Logging initialized");
    LogGuard
}
