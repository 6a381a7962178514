//! Structured logging initialization.
//!
//! All audit events are emitted as newline-delimited JSON on stdout with
//! event-specific fields recorded as tracing fields, so downstream
//! collectors never have to parse free-form messages. The filter is
//! overridable through `RUST_LOG`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "tidings=info";

/// Install the global NDJSON subscriber.
///
/// Returns an error when a subscriber is already installed, which only
/// happens when init is called twice.
pub fn init() -> crate::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .map_err(|e| crate::Error::Other(format!("failed to install tracing subscriber: {e}")))?;

    Ok(())
}
