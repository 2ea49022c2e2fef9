//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EndpointConfig (validated, immutable)
//!     → copied into each connection's settings at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; connections snapshot it
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks and
//!   reports every error, not just the first

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::ChannelConfig;
pub use schema::EndpointConfig;
pub use schema::IdentityConfig;
pub use schema::ObservabilityConfig;
pub use schema::ReconnectConfig;
