//! Shared helpers for integration tests: an endpoint wired to a scripted
//! in-process remote.

use std::sync::Arc;

use remlink::config::EndpointConfig;
use remlink::connection::ConnectionBuilder;
use remlink::transport::{MemoryConnector, MemoryRemote, MemoryRemoteBuilder};
use remlink::Endpoint;

/// A remote accepting the given services, answering auth per its policy.
pub fn remote() -> MemoryRemoteBuilder {
    MemoryRemote::builder()
        .endpoint_name("peer")
        .protocol("memory")
        .service("echo")
}

/// An endpoint with the `mem` scheme wired to `remote`.
pub fn endpoint_for(remote: &Arc<MemoryRemote>) -> Endpoint {
    endpoint_with_config(remote, EndpointConfig::default())
}

pub fn endpoint_with_config(remote: &Arc<MemoryRemote>, config: EndpointConfig) -> Endpoint {
    let endpoint = Endpoint::builder("test-endpoint").config(config).build();
    endpoint.register_connector("mem", Arc::new(MemoryConnector::new(Arc::clone(remote))));
    endpoint
}

pub fn builder() -> ConnectionBuilder {
    ConnectionBuilder::new("mem://peer").expect("static test URI parses")
}
