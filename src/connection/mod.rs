//! Connection subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     ConnectionBuilder → snapshot → Endpoint::connect
//!         → connector dials the transport
//!         → connection.rs (session state, identity table)
//!
//! Channel open:
//!     open_channel() → quota check (no waiting)
//!         → open request to the peer → ChannelFuture resolves
//!         → channel.rs (slot held until close)
//!
//! Managed:
//!     managed.rs re-dials with backoff on loss, preserving the
//!     peer identity context across physical sessions
//! ```
//!
//! # Design Decisions
//! - Direction is an enum: outbound carries the peer URI, inbound the
//!   local identity; no state where both or neither hold
//! - Channel opens resolve independently and may complete out of order
//! - Cancellation is resolved by the transport's definitive reply: a
//!   usable channel or a terminal error, never a silent drop

pub(crate) mod builder;
pub(crate) mod channel;
pub(crate) mod connection;
pub(crate) mod managed;

pub use builder::{ConnectionBuilder, ConnectionDefinition};
pub use channel::{Channel, ChannelFuture};
pub use connection::{AllowAllPermissions, Connection, ConnectionId, PermissionPolicy};
pub use managed::ManagedConnection;
