//! Resource lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! close() / close_async():
//!     → closeable.rs (idempotent transition, release the resource)
//!     → listeners fire once, in registration order
//!     → closed() observers wake
//!
//! handle() duplication:
//!     → handle.rs (shared refcount, per-handle listener set)
//!     → last handle close runs the release routine
//! ```
//!
//! # Design Decisions
//! - Close is idempotent from any task; a second close is a no-op
//! - Listeners registered after close fire immediately and synchronously
//! - A handle contributes exactly one count; closing it twice does not
//!   double-decrement

pub mod closeable;
pub mod handle;

pub use closeable::{CloseListener, CloseState, Closeable};
pub use handle::Handle;
