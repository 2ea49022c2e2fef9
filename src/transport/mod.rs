//! Transport seam.
//!
//! # Data Flow
//! ```text
//! Connection control plane:
//!     open_channel() → OpenRequest over the transport → OpenReply
//!     cancel_open()  → best-effort cancel; the pending open resolves
//!                      Cancelled or Accepted, never silently drops
//!     authenticate() → credential round-trip for an additional identity
//!     close()        → tears the session down, failing pending requests
//! ```
//!
//! # Design Decisions
//! - No wire format here: any framed, ordered, reliable transport can sit
//!   behind the trait
//! - Replies are definitive; the cancellation race is resolved by the
//!   transport, not by the caller
//! - The in-process memory transport exists so the control plane can be
//!   exercised end-to-end without a network

pub mod memory;

use std::net::SocketAddr;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use crate::error::Result;
use crate::identity::Principal;

pub use memory::{AuthPolicy, MemoryConnector, MemoryRemote, MemoryRemoteBuilder, MemoryTransport};

/// What the connection layer knows about the peer before authenticating.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Target URI for outbound connections; absent when accepted inbound.
    pub uri: Option<Url>,
    /// Remote endpoint name, if the peer declared one.
    pub name: Option<String>,
    /// Negotiated protocol name.
    pub protocol: String,
}

impl PeerInfo {
    pub fn unnamed(protocol: impl Into<String>) -> Self {
        Self {
            uri: None,
            name: None,
            protocol: protocol.into(),
        }
    }
}

/// Transport-security session details, when the session is protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub version: String,
    pub cipher_suite: String,
}

/// Identifier of one multiplexed channel, assigned by the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Options attached to a channel-open request. Opaque to the control
/// plane; interpreted by the service handler on the accepting side.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Advisory outbound window, in messages.
    pub max_outbound_messages: Option<u32>,
    /// Free-form option pairs forwarded to the peer.
    pub properties: Vec<(String, String)>,
}

/// A channel-open request issued to the peer.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Correlation token; also the handle used to cancel the request.
    pub token: Uuid,
    pub service: String,
    pub options: ChannelOptions,
}

/// Definitive outcome of a channel-open request.
#[derive(Debug, Clone)]
pub enum OpenReply {
    /// The peer accepted and assigned a channel ID.
    Accepted(ChannelId),
    /// No handler registered for the service on the peer.
    ServiceNotFound,
    /// The request was cancelled before the peer accepted it.
    Cancelled,
}

/// An additional-identity authentication request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub mechanism: String,
    pub principal: Principal,
    /// Initial mechanism response produced by the SASL client.
    pub response: Vec<u8>,
}

/// Outcome of an authentication round-trip.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Accepted,
    Rejected(String),
}

/// One framed, ordered, reliable session to a peer.
///
/// Implementations resolve every in-flight request when `close()` runs so
/// no caller is left pending.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn tls_info(&self) -> Option<TlsInfo>;

    /// Negotiated protocol name. Never absent.
    fn protocol(&self) -> String;

    /// Remote endpoint name declared during the handshake, if any.
    fn remote_endpoint_name(&self) -> Option<String>;

    /// The local principal established at the transport handshake.
    fn local_principal(&self) -> Principal;

    /// Whether the peer accepts additional-identity authentication.
    fn supports_remote_auth(&self) -> bool;

    /// Ask the peer to open a channel. Resolves with a definitive reply or
    /// a transport error; never hangs past transport teardown.
    async fn open_channel(&self, request: OpenRequest) -> Result<OpenReply>;

    /// Signal that the open identified by `token` should be abandoned.
    /// A request the peer already accepted is unaffected.
    async fn cancel_open(&self, token: Uuid);

    /// Tell the peer a channel is closed and release its resources.
    async fn close_channel(&self, id: ChannelId);

    /// Run one additional-identity authentication round-trip.
    async fn authenticate(&self, request: AuthRequest) -> Result<AuthOutcome>;

    /// Tear down the session. Pending opens resolve with an error.
    async fn close(&self);
}
