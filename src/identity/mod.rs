//! Identity subsystem.
//!
//! # Data Flow
//! ```text
//! Caller asks for an identity on a connection:
//!     → peer.rs (task-scoped binding, capability handle)
//!     → context.rs (derive credential material, cache across reconnects)
//!     → transport authenticate round-trip
//!     → table.rs (insert-or-reuse, small-integer ID)
//!
//! Identity IDs:
//!     0 = the connection's own authenticated identity
//!     1 = the reserved anonymous identity
//!     ≥2 = dynamically registered, recycled through a free-list
//! ```
//!
//! # Design Decisions
//! - Registration for one principal is linearizable: concurrent callers
//!   converge on a single ID
//! - Authentication failures are never cached and never retried here;
//!   retry policy belongs to the caller
//! - The authentication context is ambient: task-scoped override first,
//!   process default second, anonymous last

pub mod context;
pub mod peer;
pub mod table;

use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

pub use context::PeerIdentityContext;
pub use peer::ConnectionPeerIdentity;
pub use table::{IdentityTable, ANONYMOUS_ID, CONNECTION_ID};

/// An authenticated (or anonymous) principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// The reserved anonymous principal.
    Anonymous,
    /// A named principal.
    Named(String),
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "<anonymous>"),
            Principal::Named(name) => write!(f, "{name}"),
        }
    }
}

/// An identity usable for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityIdentity {
    pub principal: Principal,
    /// Mechanism that authenticated the principal.
    pub mechanism: String,
}

impl SecurityIdentity {
    pub fn anonymous() -> Self {
        Self {
            principal: Principal::Anonymous,
            mechanism: "anonymous".into(),
        }
    }

    pub fn new(principal: Principal, mechanism: impl Into<String>) -> Self {
        Self {
            principal,
            mechanism: mechanism.into(),
        }
    }
}

/// Credential state carried alongside a registered principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// No proof material (anonymous, or transport-level trust).
    None,
    /// An opaque secret evaluated by the mechanism.
    Secret(Vec<u8>),
}

/// Resolved identity material as stored in the [`IdentityTable`].
#[derive(Debug, Clone)]
pub struct IdentityMaterial {
    pub principal: Principal,
    pub mechanism: String,
    pub credential: Credential,
}

impl IdentityMaterial {
    pub fn anonymous() -> Self {
        Self {
            principal: Principal::Anonymous,
            mechanism: "anonymous".into(),
            credential: Credential::None,
        }
    }

    /// Key used for insert-or-reuse: one ID per principal+mechanism.
    pub(crate) fn key(&self) -> (Principal, String) {
        (self.principal.clone(), self.mechanism.clone())
    }

    pub fn to_security_identity(&self) -> SecurityIdentity {
        SecurityIdentity {
            principal: self.principal.clone(),
            mechanism: self.mechanism.clone(),
        }
    }
}

/// What the authentication context chose for a given peer.
#[derive(Debug, Clone)]
pub struct IdentitySelection {
    pub principal: Principal,
    pub mechanism: String,
    pub credential: Credential,
    /// Whether derived proof material may be reused across connections.
    /// Challenge-response mechanisms are inherently per-connection.
    pub cacheable: bool,
}

impl IdentitySelection {
    pub fn anonymous() -> Self {
        Self {
            principal: Principal::Anonymous,
            mechanism: "anonymous".into(),
            credential: Credential::None,
            cacheable: true,
        }
    }
}

/// Strategy object choosing which identity to assert toward a peer.
///
/// Opaque to this crate: rule evaluation, credential stores and mechanism
/// preference all live behind this seam.
pub trait AuthenticationContext: Send + Sync {
    /// Choose principal and credential material for the given peer.
    fn select(&self, peer: &crate::transport::PeerInfo) -> Result<IdentitySelection>;
}

/// A fixed-selection authentication context: always asserts the same
/// principal with the same secret, regardless of peer.
pub struct StaticAuthenticationContext {
    selection: IdentitySelection,
}

impl StaticAuthenticationContext {
    pub fn new(selection: IdentitySelection) -> Self {
        Self { selection }
    }

    /// Shorthand for a named principal with a password-style secret.
    pub fn with_password(name: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            selection: IdentitySelection {
                principal: Principal::Named(name.into()),
                mechanism: "plain".into(),
                credential: Credential::Secret(secret.into()),
                cacheable: true,
            },
        }
    }
}

impl AuthenticationContext for StaticAuthenticationContext {
    fn select(&self, _peer: &crate::transport::PeerInfo) -> Result<IdentitySelection> {
        Ok(self.selection.clone())
    }
}

/// Context that always selects the anonymous identity. Used when no ambient
/// or default context is installed.
pub struct AnonymousAuthenticationContext;

impl AuthenticationContext for AnonymousAuthenticationContext {
    fn select(&self, _peer: &crate::transport::PeerInfo) -> Result<IdentitySelection> {
        Ok(IdentitySelection::anonymous())
    }
}

/// One mechanism exchange in progress.
pub trait SaslClient: Send {
    fn mechanism(&self) -> &str;

    /// Produce the initial response sent with the authentication request.
    fn initial_response(&mut self) -> Result<Vec<u8>>;

    /// Evaluate a server challenge. Mechanisms that need challenges are
    /// per-connection; their results are never cached.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Factory turning an [`IdentitySelection`] into a mechanism exchange.
pub trait SaslClientFactory: Send + Sync {
    fn create_client(&self, selection: &IdentitySelection) -> Result<Box<dyn SaslClient>>;
}

/// Default factory: a PLAIN-style single-response exchange.
pub struct PlainSaslClientFactory;

impl SaslClientFactory for PlainSaslClientFactory {
    fn create_client(&self, selection: &IdentitySelection) -> Result<Box<dyn SaslClient>> {
        Ok(Box::new(PlainSaslClient {
            selection: selection.clone(),
        }))
    }
}

struct PlainSaslClient {
    selection: IdentitySelection,
}

impl SaslClient for PlainSaslClient {
    fn mechanism(&self) -> &str {
        &self.selection.mechanism
    }

    fn initial_response(&mut self) -> Result<Vec<u8>> {
        // authzid NUL authcid NUL secret
        let mut response = Vec::new();
        response.push(0);
        match &self.selection.principal {
            Principal::Anonymous => {}
            Principal::Named(name) => response.extend_from_slice(name.as_bytes()),
        }
        response.push(0);
        if let Credential::Secret(secret) = &self.selection.credential {
            response.extend_from_slice(secret);
        }
        Ok(response)
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Authentication(
            "plain mechanism does not accept challenges".into(),
        ))
    }
}

tokio::task_local! {
    static SCOPED_AUTH_CONTEXT: Arc<dyn AuthenticationContext>;
}

static DEFAULT_AUTH_CONTEXT: RwLock<Option<Arc<dyn AuthenticationContext>>> = RwLock::new(None);

/// Install the process-wide default authentication context.
pub fn set_default_authentication_context(ctx: Arc<dyn AuthenticationContext>) {
    *DEFAULT_AUTH_CONTEXT
        .write()
        .expect("default auth context lock poisoned") = Some(ctx);
}

/// Run a future with a task-scoped authentication context. Connection
/// builders that set no explicit context pick this one up.
pub async fn with_authentication_context<F>(ctx: Arc<dyn AuthenticationContext>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    SCOPED_AUTH_CONTEXT.scope(ctx, fut).await
}

/// The task-scoped authentication context, if the calling scope set one.
pub(crate) fn scoped_authentication_context() -> Option<Arc<dyn AuthenticationContext>> {
    SCOPED_AUTH_CONTEXT.try_with(Arc::clone).ok()
}

/// The context ambient in the calling scope: task-scoped override first,
/// process default second, anonymous last.
pub fn ambient_authentication_context() -> Arc<dyn AuthenticationContext> {
    if let Ok(ctx) = SCOPED_AUTH_CONTEXT.try_with(Arc::clone) {
        return ctx;
    }
    if let Some(ctx) = DEFAULT_AUTH_CONTEXT
        .read()
        .expect("default auth context lock poisoned")
        .as_ref()
    {
        return Arc::clone(ctx);
    }
    Arc::new(AnonymousAuthenticationContext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerInfo;

    #[test]
    fn plain_client_encodes_name_and_secret() {
        let selection = IdentitySelection {
            principal: Principal::Named("alice".into()),
            mechanism: "plain".into(),
            credential: Credential::Secret(b"s3cret".to_vec()),
            cacheable: true,
        };
        let mut client = PlainSaslClientFactory.create_client(&selection).unwrap();
        let response = client.initial_response().unwrap();
        assert_eq!(response, b"\0alice\0s3cret");
        assert!(client.evaluate_challenge(b"x").is_err());
    }

    #[tokio::test]
    async fn scoped_context_wins_over_default() {
        let peer = PeerInfo::unnamed("test");
        let scoped: Arc<dyn AuthenticationContext> =
            Arc::new(StaticAuthenticationContext::with_password("alice", "pw"));

        let selection = with_authentication_context(scoped, async {
            ambient_authentication_context().select(&peer).unwrap()
        })
        .await;
        assert_eq!(selection.principal, Principal::Named("alice".into()));

        // Outside the scope the built-in anonymous fallback applies.
        let fallback = ambient_authentication_context().select(&peer).unwrap();
        assert!(fallback.principal.is_anonymous());
    }
}
