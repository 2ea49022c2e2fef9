//! Multiplexed remote-endpoint connection layer with per-call identity
//! switching.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod transport;

pub use config::EndpointConfig;
pub use connection::{
    Channel, ChannelFuture, Connection, ConnectionBuilder, ManagedConnection,
};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use identity::{ConnectionPeerIdentity, PeerIdentityContext};
pub use lifecycle::Closeable;
