//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level at runtime
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - RUST_LOG overrides the configured filter

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `default_filter` applies when RUST_LOG is unset.
pub fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
