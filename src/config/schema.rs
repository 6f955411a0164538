//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the identity server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Service name and trust domain.
    pub service: ServiceConfig,

    /// Where the workload credential and trust bundle live.
    pub identity: IdentityConfig,

    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Shutdown timing overrides.
    pub shutdown: ShutdownTimings,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Workload registration settings used by `identity-cli register`.
    pub registrar: RegistrarConfig,
}

/// Service identity reference.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, used as the SPIFFE ID path.
    pub name: String,

    /// Trust domain reference (e.g., "example.org").
    pub domain: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "identity-server".to_string(),
            domain: "example.org".to_string(),
        }
    }
}

/// PEM file locations for the workload identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Certificate chain, leaf first (PEM).
    pub cert_path: String,

    /// Private key (PEM, PKCS#8, PKCS#1 or SEC1).
    pub key_path: String,

    /// Trust bundle authorities (PEM).
    pub bundle_path: String,

    /// Rotate the identity when any of the files change.
    pub watch: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cert_path: "/etc/identity/svid.pem".to_string(),
            key_path: "/etc/identity/svid_key.pem".to_string(),
            bundle_path: "/etc/identity/bundle.pem".to_string(),
            watch: false,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
        }
    }
}

/// Shutdown timing configuration (seconds).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownTimings {
    /// Upper bound for the pre-shutdown hook.
    pub grace_period_secs: u64,

    /// Upper bound for draining in-flight requests.
    pub drain_timeout_secs: u64,

    /// Hard deadline for the whole wait, measured from the trigger.
    pub force_timeout_secs: u64,
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            drain_timeout_secs: 20,
            force_timeout_secs: 45,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive, overridden by `RUST_LOG`.
    pub log_filter: String,

    /// Emit logs as JSON.
    pub json_logs: bool,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics listen address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "identity_server=info,tower_http=info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// SPIRE server registration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// `spire-server` binary.
    pub server_path: String,

    /// SPIRE server API socket.
    pub socket_path: String,

    /// Workload selector (e.g., "unix:uid:1000"). Defaults to the current process uid.
    pub selector: Option<String>,

    /// Parent SPIFFE ID. Defaults to `spiffe://<domain>/spire-agent`.
    pub parent_id: Option<String>,

    /// Entry TTL in seconds.
    pub ttl_secs: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            server_path: "spire-server".to_string(),
            socket_path: "/tmp/spire-server/private/api.sock".to_string(),
            selector: None,
            parent_id: None,
            ttl_secs: 3600,
        }
    }
}
