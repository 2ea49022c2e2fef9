//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Managed connection loses its session:
//!     → backoff.rs computes the delay for each dial attempt
//!     → delays grow exponentially, capped, with jitter
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every control-plane call has a deadline
//! - Only transport-level loss is retried; authentication failures are
//!   returned to the caller untouched
//! - Jitter prevents reconnect stampedes after a shared outage

pub mod backoff;
