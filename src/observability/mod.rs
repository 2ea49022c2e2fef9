//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges for the control plane)
//!
//! Consumers:
//!     → Log aggregation (stdout, file, remote)
//!     → Whatever metrics recorder the embedding application installs
//! ```
//!
//! # Design Decisions
//! - Structured fields on every event: connection, channel, principal
//! - Metric updates are cheap (atomic increments); no exporter is
//!   installed here, that belongs to the embedding application
//! - Log level comes from config, overridable via RUST_LOG

pub mod logging;
pub mod metrics;
