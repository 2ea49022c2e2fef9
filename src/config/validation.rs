//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits and timeouts nonzero, delays ordered)
//! - Check the log level is one tracing understands
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: EndpointConfig → Result<(), Vec<ValidationError>>
//! - Runs before a config is accepted into the system

use crate::config::schema::EndpointConfig;

/// One semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check a configuration, collecting every error.
pub fn validate_config(config: &EndpointConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.channels.max_per_connection == 0 {
        errors.push(ValidationError {
            field: "channels.max_per_connection",
            message: "must be at least 1".into(),
        });
    }
    if config.channels.open_timeout_secs == 0 {
        errors.push(ValidationError {
            field: "channels.open_timeout_secs",
            message: "must be nonzero; every open needs a deadline".into(),
        });
    }
    if config.identity.auth_timeout_secs == 0 {
        errors.push(ValidationError {
            field: "identity.auth_timeout_secs",
            message: "must be nonzero; every round-trip needs a deadline".into(),
        });
    }
    if config.reconnect.max_attempts == 0 {
        errors.push(ValidationError {
            field: "reconnect.max_attempts",
            message: "must be at least 1".into(),
        });
    }
    if config.reconnect.base_delay_ms > config.reconnect.max_delay_ms {
        errors.push(ValidationError {
            field: "reconnect.base_delay_ms",
            message: format!(
                "base delay {}ms exceeds max delay {}ms",
                config.reconnect.base_delay_ms, config.reconnect.max_delay_ms
            ),
        });
    }
    if !LOG_LEVELS.contains(&config.observability.log_level.as_str()) {
        errors.push(ValidationError {
            field: "observability.log_level",
            message: format!(
                "unknown level \"{}\" (expected one of {:?})",
                config.observability.log_level, LOG_LEVELS
            ),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&EndpointConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = EndpointConfig::default();
        config.channels.max_per_connection = 0;
        config.reconnect.max_attempts = 0;
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors
            .iter()
            .any(|e| e.field == "channels.max_per_connection"));
    }

    #[test]
    fn delay_ordering_is_checked() {
        let mut config = EndpointConfig::default();
        config.reconnect.base_delay_ms = 5_000;
        config.reconnect.max_delay_ms = 1_000;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "reconnect.base_delay_ms");
    }
}
