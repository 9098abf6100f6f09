//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate backend URLs and the bind address
//! - Validate value ranges (intervals and bucket defaults within bounds)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::load_balancer::backend::parse_backend_url;
use crate::rate_limit::MAX_RATE_SECS;

/// Upper bound for health-check intervals and every timeout: one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

fn check_secs(errors: &mut Vec<ValidationError>, field: &str, value: u64, max: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than 0"));
    } else if value > max {
        errors.push(ValidationError::new(field, format!("must be at most {max}")));
    }
}

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::new("backends", "at least one backend is required"));
    }
    for (i, raw) in config.backends.iter().enumerate() {
        if let Err(e) = parse_backend_url(raw) {
            errors.push(ValidationError::new(format!("backends[{i}]"), e.to_string()));
        }
    }

    let health = &config.health_check;
    if health.enabled {
        check_secs(&mut errors, "health_check.interval_secs", health.interval_secs, MAX_INTERVAL_SECS);
        check_secs(&mut errors, "health_check.timeout_secs", health.timeout_secs, MAX_INTERVAL_SECS);
        if !health.path.starts_with('/') {
            errors.push(ValidationError::new("health_check.path", "must start with '/'"));
        }
    }

    let limits = &config.rate_limit;
    if limits.default_max_tokens < 1 {
        errors.push(ValidationError::new("rate_limit.default_max_tokens", "must be at least 1"));
    }
    check_secs(&mut errors, "rate_limit.default_rate_secs", limits.default_rate_secs, MAX_RATE_SECS);

    let timeouts = &config.timeouts;
    check_secs(&mut errors, "timeouts.request_secs", timeouts.request_secs, MAX_INTERVAL_SECS);
    check_secs(&mut errors, "timeouts.upstream_secs", timeouts.upstream_secs, MAX_INTERVAL_SECS);
    if timeouts.shutdown_grace_secs > MAX_INTERVAL_SECS {
        errors.push(ValidationError::new(
            "timeouts.shutdown_grace_secs",
            format!("must be at most {MAX_INTERVAL_SECS}"),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
