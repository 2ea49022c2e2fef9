//! In-process transport.
//!
//! Pairs a dialing connection with a scripted remote side: a set of
//! accepted service names, an authentication policy, and a gate that can
//! hold channel-open requests in flight. Used to exercise the control
//! plane end-to-end without a network; managed connections re-dial the
//! same remote, which keeps counting across sessions.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::connection::ConnectionDefinition;
use crate::endpoint::Connector;
use crate::error::{Error, Result};
use crate::identity::Principal;

use super::{AuthOutcome, AuthRequest, ChannelId, OpenReply, OpenRequest, TlsInfo, Transport};

/// How the remote side answers authentication requests.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    AcceptAll,
    RejectAll(String),
    /// Accept only the named principals; anonymous is always accepted.
    AcceptNamed(HashSet<String>),
}

impl AuthPolicy {
    fn decide(&self, request: &AuthRequest) -> AuthOutcome {
        match self {
            AuthPolicy::AcceptAll => AuthOutcome::Accepted,
            AuthPolicy::RejectAll(reason) => AuthOutcome::Rejected(reason.clone()),
            AuthPolicy::AcceptNamed(names) => match &request.principal {
                Principal::Anonymous => AuthOutcome::Accepted,
                Principal::Named(name) if names.contains(name) => AuthOutcome::Accepted,
                Principal::Named(name) => {
                    AuthOutcome::Rejected(format!("unknown principal {name}"))
                }
            },
        }
    }
}

/// Scripted remote peer shared across every dialed session.
pub struct MemoryRemote {
    endpoint_name: Option<String>,
    protocol: String,
    services: HashSet<String>,
    auth_policy: AuthPolicy,
    transport_principal: Principal,
    tls: Option<TlsInfo>,
    supports_remote_auth: bool,

    gate_open: AtomicBool,
    events: Notify,
    next_channel: AtomicU64,
    /// Channels currently retained across all sessions of this remote.
    active_channels: AtomicU64,
    auth_attempts: AtomicU32,
    dials: AtomicU32,
}

impl MemoryRemote {
    pub fn builder() -> MemoryRemoteBuilder {
        MemoryRemoteBuilder::default()
    }

    /// Open a fresh session against this remote.
    pub fn dial(self: &Arc<Self>) -> MemoryTransport {
        self.dials.fetch_add(1, Ordering::SeqCst);
        MemoryTransport {
            remote: Arc::clone(self),
            opens: Mutex::new(OpenTable::default()),
            channels: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Hold subsequent channel-open requests until [`release_opens`].
    ///
    /// [`release_opens`]: MemoryRemote::release_opens
    pub fn hold_opens(&self) {
        self.gate_open.store(false, Ordering::SeqCst);
    }

    pub fn release_opens(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
        self.events.notify_waiters();
    }

    /// Authentication round-trips observed across all sessions.
    pub fn auth_attempts(&self) -> u32 {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    /// Sessions opened against this remote.
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Channels the remote side currently retains, across sessions.
    pub fn active_channels(&self) -> u64 {
        self.active_channels.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MemoryRemoteBuilder {
    endpoint_name: Option<String>,
    protocol: Option<String>,
    services: HashSet<String>,
    auth_policy: Option<AuthPolicy>,
    transport_principal: Option<Principal>,
    tls: Option<TlsInfo>,
    supports_remote_auth: Option<bool>,
}

impl MemoryRemoteBuilder {
    pub fn endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = Some(name.into());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Service names the remote will accept channels for.
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.services.insert(name.into());
        self
    }

    pub fn auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.auth_policy = Some(policy);
        self
    }

    /// The principal the dialer is considered to hold at transport level.
    pub fn transport_principal(mut self, principal: Principal) -> Self {
        self.transport_principal = Some(principal);
        self
    }

    pub fn tls(mut self, tls: TlsInfo) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn supports_remote_auth(mut self, supported: bool) -> Self {
        self.supports_remote_auth = Some(supported);
        self
    }

    pub fn build(self) -> Arc<MemoryRemote> {
        Arc::new(MemoryRemote {
            endpoint_name: self.endpoint_name,
            protocol: self.protocol.unwrap_or_else(|| "memory".into()),
            services: self.services,
            auth_policy: self.auth_policy.unwrap_or(AuthPolicy::AcceptAll),
            transport_principal: self.transport_principal.unwrap_or(Principal::Anonymous),
            tls: self.tls,
            supports_remote_auth: self.supports_remote_auth.unwrap_or(true),
            gate_open: AtomicBool::new(true),
            events: Notify::new(),
            next_channel: AtomicU64::new(1),
            active_channels: AtomicU64::new(0),
            auth_attempts: AtomicU32::new(0),
            dials: AtomicU32::new(0),
        })
    }
}

#[derive(Default)]
struct OpenTable {
    /// Tokens cancelled before acceptance.
    cancelled: HashSet<Uuid>,
    /// Tokens the remote already accepted.
    accepted: HashMap<Uuid, ChannelId>,
}

/// One dialed session against a [`MemoryRemote`].
pub struct MemoryTransport {
    remote: Arc<MemoryRemote>,
    opens: Mutex<OpenTable>,
    /// Channels the remote currently retains for this session.
    channels: Mutex<HashSet<ChannelId>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Channels the remote side retains. Empty after close or cancel.
    pub fn retained_channels(&self) -> usize {
        self.channels.lock().expect("channel set lock poisoned").len()
    }

    pub fn remote(&self) -> &Arc<MemoryRemote> {
        &self.remote
    }

    fn is_cancelled(&self, token: Uuid) -> bool {
        self.opens
            .lock()
            .expect("open table lock poisoned")
            .cancelled
            .contains(&token)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        self.remote.tls.clone()
    }

    fn protocol(&self) -> String {
        self.remote.protocol.clone()
    }

    fn remote_endpoint_name(&self) -> Option<String> {
        self.remote.endpoint_name.clone()
    }

    fn local_principal(&self) -> Principal {
        self.remote.transport_principal.clone()
    }

    fn supports_remote_auth(&self) -> bool {
        self.remote.supports_remote_auth
    }

    async fn open_channel(&self, request: OpenRequest) -> Result<OpenReply> {
        // Wait out the gate while staying responsive to cancel and close.
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }
            if self.is_cancelled(request.token) {
                return Ok(OpenReply::Cancelled);
            }
            if self.remote.gate_open.load(Ordering::SeqCst) {
                break;
            }
            let notified = self.remote.events.notified();
            // Re-check after registering for wakeup; a notify between the
            // checks above and here would otherwise be lost.
            if !self.remote.gate_open.load(Ordering::SeqCst)
                && !self.closed.load(Ordering::SeqCst)
                && !self.is_cancelled(request.token)
            {
                notified.await;
            }
        }

        let mut opens = self.opens.lock().expect("open table lock poisoned");
        if opens.cancelled.contains(&request.token) {
            return Ok(OpenReply::Cancelled);
        }
        if !self.remote.services.contains(&request.service) {
            return Ok(OpenReply::ServiceNotFound);
        }
        let id = ChannelId(self.remote.next_channel.fetch_add(1, Ordering::SeqCst));
        opens.accepted.insert(request.token, id);
        self.channels
            .lock()
            .expect("channel set lock poisoned")
            .insert(id);
        self.remote.active_channels.fetch_add(1, Ordering::SeqCst);
        Ok(OpenReply::Accepted(id))
    }

    async fn cancel_open(&self, token: Uuid) {
        let mut opens = self.opens.lock().expect("open table lock poisoned");
        if opens.accepted.contains_key(&token) {
            // Already accepted: the channel is delivered regardless.
            return;
        }
        opens.cancelled.insert(token);
        self.remote.events.notify_waiters();
    }

    async fn close_channel(&self, id: ChannelId) {
        let removed = self
            .channels
            .lock()
            .expect("channel set lock poisoned")
            .remove(&id);
        if removed {
            self.remote.active_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn authenticate(&self, request: AuthRequest) -> Result<AuthOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.remote.auth_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote.auth_policy.decide(&request))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The remote drops this session's channels with it.
        let dropped = {
            let mut channels = self.channels.lock().expect("channel set lock poisoned");
            let dropped = channels.len() as u64;
            channels.clear();
            dropped
        };
        self.remote.active_channels.fetch_sub(dropped, Ordering::SeqCst);
        self.remote.events.notify_waiters();
    }
}

/// Connector dialing a [`MemoryRemote`], registered under a URI scheme.
pub struct MemoryConnector {
    remote: Arc<MemoryRemote>,
}

impl MemoryConnector {
    pub fn new(remote: Arc<MemoryRemote>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _definition: &ConnectionDefinition) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.remote.dial()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(service: &str) -> OpenRequest {
        OpenRequest {
            token: Uuid::new_v4(),
            service: service.into(),
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn accepts_known_service() {
        let remote = MemoryRemote::builder().service("echo").build();
        let transport = remote.dial();
        match transport.open_channel(request("echo")).await.unwrap() {
            OpenReply::Accepted(_) => {}
            other => panic!("expected acceptance, got {other:?}"),
        }
        assert_eq!(transport.retained_channels(), 1);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let remote = MemoryRemote::builder().service("echo").build();
        let transport = remote.dial();
        assert!(matches!(
            transport.open_channel(request("missing")).await.unwrap(),
            OpenReply::ServiceNotFound
        ));
        assert_eq!(transport.retained_channels(), 0);
    }

    #[tokio::test]
    async fn cancel_before_gate_release_wins() {
        let remote = MemoryRemote::builder().service("echo").build();
        remote.hold_opens();
        let transport = Arc::new(remote.dial());

        let req = request("echo");
        let token = req.token;
        let opener = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.open_channel(req).await })
        };
        tokio::task::yield_now().await;
        transport.cancel_open(token).await;

        assert!(matches!(opener.await.unwrap().unwrap(), OpenReply::Cancelled));
        assert_eq!(transport.retained_channels(), 0);
    }

    #[tokio::test]
    async fn cancel_after_acceptance_is_noop() {
        let remote = MemoryRemote::builder().service("echo").build();
        let transport = remote.dial();

        let req = request("echo");
        let token = req.token;
        let reply = transport.open_channel(req).await.unwrap();
        transport.cancel_open(token).await;

        assert!(matches!(reply, OpenReply::Accepted(_)));
        assert_eq!(transport.retained_channels(), 1);
    }

    #[tokio::test]
    async fn close_fails_gated_opens() {
        let remote = MemoryRemote::builder().service("echo").build();
        remote.hold_opens();
        let transport = Arc::new(remote.dial());

        let opener = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.open_channel(request("echo")).await })
        };
        tokio::task::yield_now().await;
        transport.close().await;

        assert!(matches!(
            opener.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }
}
