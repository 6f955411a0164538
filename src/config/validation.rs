//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the service name and trust domain are usable as a SPIFFE ID
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;
use crate::identity::TrustDomain;
use crate::registrar;

/// One rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Service names become a SPIFFE ID path segment: alphanumerics and inner hyphens.
pub fn validate_service_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("service name is required".to_string());
    }
    let bytes = name.as_bytes();
    let edges_ok = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    if !edges_ok || !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
        return Err(format!(
            "invalid service name {name:?}: must be alphanumeric with optional inner hyphens"
        ));
    }
    Ok(())
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(message) = validate_service_name(&config.service.name) {
        errors.push(ValidationError::new("service.name", message));
    }

    if let Err(e) = TrustDomain::parse(&config.service.domain) {
        errors.push(ValidationError::new("service.domain", e.to_string()));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address {:?}", config.listener.bind_address),
        ));
    }

    let shutdown = &config.shutdown;
    if shutdown.drain_timeout_secs == 0 {
        errors.push(ValidationError::new("shutdown.drain_timeout_secs", "must be greater than 0"));
    }
    if shutdown.force_timeout_secs == 0 {
        errors.push(ValidationError::new("shutdown.force_timeout_secs", "must be greater than 0"));
    }
    if shutdown.force_timeout_secs < shutdown.drain_timeout_secs {
        tracing::warn!(
            drain_timeout_secs = shutdown.drain_timeout_secs,
            force_timeout_secs = shutdown.force_timeout_secs,
            "Force timeout is shorter than drain timeout; drains will be cut short"
        );
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address {:?}", config.observability.metrics_address),
        ));
    }

    if let Some(selector) = &config.registrar.selector {
        if let Err(e) = registrar::validate_selector(selector) {
            errors.push(ValidationError::new("registrar.selector", e.to_string()));
        }
    }
    if config.registrar.ttl_secs == 0 {
        errors.push(ValidationError::new("registrar.ttl_secs", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
