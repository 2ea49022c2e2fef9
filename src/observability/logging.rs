//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once
//! - Apply the configured log level, letting RUST_LOG override it
//!
//! # Design Decisions
//! - Uses the tracing crate for structured logging
//! - Initialization is idempotent; embedding applications that installed
//!   their own subscriber win

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// Initialize logging from configuration. A second call, or an already
/// installed global subscriber, is a no-op.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
