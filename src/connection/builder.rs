//! Connection definition builder.
//!
//! # Responsibilities
//! - Accumulate connection settings with fail-fast validation
//! - Perform no I/O; connecting is the endpoint's job
//! - Snapshot into an immutable [`ConnectionDefinition`] at consumption
//!   time, so later mutation never affects an in-flight connection

use std::net::SocketAddr;
use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};
use crate::identity::{AuthenticationContext, SaslClientFactory};

/// Mutable accumulator for the settings of one outbound connection.
///
/// Setters validate immediately and perform no I/O. The builder stays
/// usable after [`snapshot`]; the snapshot is what the connect operation
/// consumes, so further mutation is inert for that connection.
///
/// [`snapshot`]: ConnectionBuilder::snapshot
pub struct ConnectionBuilder {
    uri: Url,
    immediate: bool,
    sasl_client_factory: Option<Arc<dyn SaslClientFactory>>,
    authentication_context: Option<Arc<dyn AuthenticationContext>>,
    bind_address: Option<SocketAddr>,
    abstract_type: Option<String>,
    abstract_type_authority: Option<String>,
}

impl ConnectionBuilder {
    /// Start a builder for the given target URI. Fails fast on a URI that
    /// does not parse or has no scheme to select a connector with.
    pub fn new(uri: &str) -> Result<Self> {
        let uri: Url = uri
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("target URI: {e}")))?;
        Ok(Self::from_url(uri))
    }

    pub fn from_url(uri: Url) -> Self {
        Self {
            uri,
            immediate: false,
            sasl_client_factory: None,
            authentication_context: None,
            bind_address: None,
            abstract_type: None,
            abstract_type_authority: None,
        }
    }

    /// Authenticate the connection identity during connect instead of
    /// deferring to first use. Defaults to `false`.
    pub fn immediate(&mut self, immediate: bool) -> &mut Self {
        self.immediate = immediate;
        self
    }

    pub fn sasl_client_factory(&mut self, factory: Arc<dyn SaslClientFactory>) -> &mut Self {
        self.sasl_client_factory = Some(factory);
        self
    }

    /// Explicit authentication context. When unset, the context ambient in
    /// the scope calling connect applies.
    pub fn authentication_context(&mut self, context: Arc<dyn AuthenticationContext>) -> &mut Self {
        self.authentication_context = Some(context);
        self
    }

    pub fn bind_address(&mut self, address: SocketAddr) -> &mut Self {
        self.bind_address = Some(address);
        self
    }

    /// Abstract transport type for address-family-specific binding.
    pub fn abstract_type(&mut self, abstract_type: impl Into<String>) -> Result<&mut Self> {
        let abstract_type = abstract_type.into();
        if abstract_type.is_empty() {
            return Err(Error::InvalidArgument("abstract type must not be empty".into()));
        }
        self.abstract_type = Some(abstract_type);
        Ok(self)
    }

    pub fn abstract_type_authority(&mut self, authority: impl Into<String>) -> Result<&mut Self> {
        let authority = authority.into();
        if authority.is_empty() {
            return Err(Error::InvalidArgument(
                "abstract type authority must not be empty".into(),
            ));
        }
        self.abstract_type_authority = Some(authority);
        Ok(self)
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn get_bind_address(&self) -> Option<SocketAddr> {
        self.bind_address
    }

    pub fn get_abstract_type(&self) -> Option<&str> {
        self.abstract_type.as_deref()
    }

    pub fn get_abstract_type_authority(&self) -> Option<&str> {
        self.abstract_type_authority.as_deref()
    }

    /// Copy the current settings into an immutable definition.
    pub fn snapshot(&self) -> ConnectionDefinition {
        ConnectionDefinition {
            uri: self.uri.clone(),
            immediate: self.immediate,
            sasl_client_factory: self.sasl_client_factory.clone(),
            authentication_context: self.authentication_context.clone(),
            bind_address: self.bind_address,
            abstract_type: self.abstract_type.clone(),
            abstract_type_authority: self.abstract_type_authority.clone(),
        }
    }
}

/// Immutable snapshot of a [`ConnectionBuilder`], as consumed by the
/// connect operation.
#[derive(Clone)]
pub struct ConnectionDefinition {
    pub uri: Url,
    pub immediate: bool,
    pub sasl_client_factory: Option<Arc<dyn SaslClientFactory>>,
    pub authentication_context: Option<Arc<dyn AuthenticationContext>>,
    pub bind_address: Option<SocketAddr>,
    pub abstract_type: Option<String>,
    pub abstract_type_authority: Option<String>,
}

impl std::fmt::Debug for ConnectionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDefinition")
            .field("uri", &self.uri.as_str())
            .field("immediate", &self.immediate)
            .field("bind_address", &self.bind_address)
            .field("abstract_type", &self.abstract_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_configured_values() {
        let bind: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut builder = ConnectionBuilder::new("mem://peer").unwrap();
        builder.immediate(true).bind_address(bind);

        let definition = builder.snapshot();
        assert_eq!(definition.uri.as_str(), "mem://peer");
        assert!(definition.immediate);
        assert_eq!(definition.bind_address, Some(bind));
    }

    #[test]
    fn invalid_uri_fails_fast() {
        assert!(matches!(
            ConnectionBuilder::new("not a uri"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_abstract_type_rejected() {
        let mut builder = ConnectionBuilder::new("mem://peer").unwrap();
        assert!(builder.abstract_type("").is_err());
        assert!(builder.abstract_type("stream").is_ok());
        assert!(builder.abstract_type_authority("").is_err());
    }

    #[test]
    fn mutation_after_snapshot_is_inert() {
        let mut builder = ConnectionBuilder::new("mem://peer").unwrap();
        builder.immediate(true);
        let definition = builder.snapshot();

        builder.immediate(false);
        builder.bind_address("127.0.0.1:9999".parse().unwrap());

        assert!(definition.immediate);
        assert_eq!(definition.bind_address, None);
    }
}
