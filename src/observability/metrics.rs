//! Metrics collection.
//!
//! # Responsibilities
//! - Define control-plane metrics (connections, channels, identities)
//! - Record through whatever recorder the embedding application installed
//!
//! # Metrics
//! - `remlink_connections_active` (gauge): live connections
//! - `remlink_channels_active` (gauge): open channels across connections
//! - `remlink_identities_registered_total` (counter): table registrations
//! - `remlink_auth_rejected_total` (counter): rejected authentications
//! - `remlink_reconnects_total` (counter): managed re-establishments
//!
//! # Design Decisions
//! - Low-overhead updates (atomic operations in the recorder)
//! - No exporter here; a library records, the application exposes

pub const CONNECTIONS_ACTIVE: &str = "remlink_connections_active";
pub const CHANNELS_ACTIVE: &str = "remlink_channels_active";
pub const IDENTITIES_REGISTERED: &str = "remlink_identities_registered_total";
pub const AUTH_REJECTED: &str = "remlink_auth_rejected_total";
pub const RECONNECTS: &str = "remlink_reconnects_total";

pub(crate) fn connection_opened() {
    metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

pub(crate) fn connection_closed() {
    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

pub(crate) fn channel_opened() {
    metrics::gauge!(CHANNELS_ACTIVE).increment(1.0);
}

pub(crate) fn channel_closed() {
    metrics::gauge!(CHANNELS_ACTIVE).decrement(1.0);
}

pub(crate) fn identity_registered() {
    metrics::counter!(IDENTITIES_REGISTERED).increment(1);
}

pub(crate) fn auth_rejected() {
    metrics::counter!(AUTH_REJECTED).increment(1);
}

pub(crate) fn reconnected() {
    metrics::counter!(RECONNECTS).increment(1);
}
