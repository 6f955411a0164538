//! Workload registration with a SPIRE server.
//!
//! # Responsibilities
//! - Validate the service name, trust domain and workload selector
//! - Build the `spire-server entry create` invocation
//! - Run it and translate its failures into typed errors
//!
//! # Design Decisions
//! - Only allow-listed binary and socket locations are executed against
//! - An entry that already exists counts as success, so registration is idempotent

use std::path::{Component, Path};

use thiserror::Error;
use tokio::process::Command;

use crate::config::validation::validate_service_name;
use crate::config::{RegistrarConfig, ServerConfig};
use crate::identity::{codec, wire, TrustDomain};

/// Overrides the configured SPIRE server socket.
pub const SOCKET_PATH_ENV: &str = "SPIRE_SOCKET_PATH";

const ALLOWED_SERVER_DIRS: [&str; 4] = ["/usr/bin/", "/usr/local/bin/", "/opt/spire/bin/", "./bin/"];
const DEFAULT_SERVER_BINARY: &str = "spire-server";
const SELECTOR_TYPES: [&str; 3] = ["unix", "k8s", "docker"];

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("invalid spire-server path: {0}")]
    InvalidServerPath(String),

    #[error("invalid socket path: {0}")]
    InvalidSocketPath(String),

    #[error("invalid selector format: {0}")]
    InvalidSelector(String),

    #[error("permission denied: ensure you have access to SPIRE socket at {0}")]
    PermissionDenied(String),

    #[error("SPIRE server not running or not accessible at {0}")]
    ServerUnavailable(String),

    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SPIRE registration failed ({status}): {output}")]
    Failed { status: String, output: String },
}

/// Validate a `type:value[:value...]` workload selector.
pub fn validate_selector(selector: &str) -> Result<(), RegistrarError> {
    let mut parts = selector.split(':');
    let kind = parts.next().unwrap_or_default();
    let has_value = parts.next().is_some_and(|value| !value.is_empty());
    if !has_value || !SELECTOR_TYPES.contains(&kind) {
        return Err(RegistrarError::InvalidSelector(selector.to_string()));
    }
    Ok(())
}

fn has_parent_dir(path: &str) -> bool {
    Path::new(path).components().any(|c| c == Component::ParentDir)
}

fn validate_server_path(path: &str) -> Result<(), RegistrarError> {
    let allowed = path == DEFAULT_SERVER_BINARY
        || ALLOWED_SERVER_DIRS.iter().any(|dir| path.starts_with(dir));
    if path.is_empty() || has_parent_dir(path) || !allowed {
        return Err(RegistrarError::InvalidServerPath(path.to_string()));
    }
    Ok(())
}

fn validate_socket_path(path: &str) -> Result<(), RegistrarError> {
    let allowed = path.ends_with(".sock") || path.starts_with("/tmp/") || path.starts_with("/var/run/");
    if path.is_empty() || has_parent_dir(path) || !allowed {
        return Err(RegistrarError::InvalidSocketPath(path.to_string()));
    }
    Ok(())
}

/// Selector matching the current process: its uid where available,
/// otherwise its executable path.
pub fn default_selector() -> Result<String, RegistrarError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata("/proc/self") {
            return Ok(format!("unix:uid:{}", meta.uid()));
        }
    }

    let exe = std::env::current_exe().map_err(|e| RegistrarError::InvalidRequest {
        field: "selector",
        reason: format!("cannot determine current executable: {e}"),
    })?;
    Ok(format!("unix:path:{}", exe.display()))
}

/// One workload entry to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub service_name: String,
    pub trust_domain: TrustDomain,
    pub selector: String,
    pub parent_id: Option<String>,
    pub ttl_secs: u64,
}

impl RegistrationRequest {
    pub fn new(
        service_name: &str,
        trust_domain: &str,
        selector: Option<&str>,
    ) -> Result<Self, RegistrarError> {
        validate_service_name(service_name).map_err(|reason| RegistrarError::InvalidRequest {
            field: "service name",
            reason,
        })?;
        let trust_domain = TrustDomain::parse(trust_domain).map_err(|e| RegistrarError::InvalidRequest {
            field: "trust domain",
            reason: e.to_string(),
        })?;

        let selector = match selector {
            Some(selector) => selector.to_string(),
            None => default_selector()?,
        };
        validate_selector(&selector)?;

        Ok(Self {
            service_name: service_name.to_string(),
            trust_domain,
            selector,
            parent_id: None,
            ttl_secs: 3600,
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, RegistrarError> {
        let mut request = Self::new(
            &config.service.name,
            &config.service.domain,
            config.registrar.selector.as_deref(),
        )?;
        request.parent_id = config.registrar.parent_id.clone();
        request.ttl_secs = config.registrar.ttl_secs;
        Ok(request)
    }

    fn id_under_domain(&self, path: &str, field: &'static str) -> Result<String, RegistrarError> {
        let invalid = |reason: String| RegistrarError::InvalidRequest { field, reason };
        let domain = codec::encode(&self.trust_domain).map_err(|e| invalid(e.to_string()))?;
        let id = wire::SpiffeId::from_path(domain, path).map_err(|e| invalid(e.to_string()))?;
        Ok(id.to_string())
    }

    /// `spiffe://<domain>/<service>`.
    pub fn spiffe_id(&self) -> Result<String, RegistrarError> {
        self.id_under_domain(&format!("/{}", self.service_name), "SPIFFE ID")
    }

    /// The configured parent, or `spiffe://<domain>/spire-agent`.
    pub fn parent_id(&self) -> Result<String, RegistrarError> {
        match &self.parent_id {
            Some(parent) => wire::SpiffeId::parse(parent)
                .map(|id| id.to_string())
                .map_err(|e| RegistrarError::InvalidRequest {
                    field: "parent ID",
                    reason: e.to_string(),
                }),
            None => self.id_under_domain("/spire-agent", "parent ID"),
        }
    }
}

/// How a registration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    AlreadyExists,
}

/// Creates registration entries through the `spire-server` CLI.
#[derive(Debug, Clone)]
pub struct SpireRegistrar {
    server_path: String,
    socket_path: String,
}

impl SpireRegistrar {
    pub fn new(server_path: impl Into<String>, socket_path: impl Into<String>) -> Result<Self, RegistrarError> {
        let server_path = server_path.into();
        let socket_path = socket_path.into();
        validate_server_path(&server_path)?;
        validate_socket_path(&socket_path)?;
        Ok(Self {
            server_path,
            socket_path,
        })
    }

    /// Build from configuration; `SPIRE_SOCKET_PATH` overrides the socket.
    pub fn from_config(config: &RegistrarConfig) -> Result<Self, RegistrarError> {
        let socket_path = std::env::var(SOCKET_PATH_ENV).unwrap_or_else(|_| config.socket_path.clone());
        Self::new(config.server_path.clone(), socket_path)
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    pub fn command_args(&self, request: &RegistrationRequest) -> Result<Vec<String>, RegistrarError> {
        Ok(vec![
            "entry".to_string(),
            "create".to_string(),
            "-socketPath".to_string(),
            self.socket_path.clone(),
            "-spiffeID".to_string(),
            request.spiffe_id()?,
            "-parentID".to_string(),
            request.parent_id()?,
            "-selector".to_string(),
            request.selector.clone(),
            "-ttl".to_string(),
            request.ttl_secs.to_string(),
        ])
    }

    /// Create the entry. An existing entry is not an error.
    pub async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutcome, RegistrarError> {
        let args = self.command_args(request)?;
        tracing::debug!(
            server = %self.server_path,
            socket = %self.socket_path,
            args = ?args,
            "Creating SPIRE entry"
        );

        let output = Command::new(&self.server_path)
            .args(&args)
            .output()
            .await
            .map_err(|source| RegistrarError::Spawn {
                binary: self.server_path.clone(),
                source,
            })?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if output.status.success() {
            tracing::info!(
                service = %request.service_name,
                trust_domain = %request.trust_domain,
                "Created SPIRE registration entry"
            );
            return Ok(RegistrationOutcome::Created);
        }

        classify_failure(&combined, &self.socket_path, output.status.to_string()).map(|outcome| {
            tracing::info!(service = %request.service_name, "Registration entry already exists");
            outcome
        })
    }
}

fn classify_failure(output: &str, socket_path: &str, status: String) -> Result<RegistrationOutcome, RegistrarError> {
    if output.contains("already exists") {
        return Ok(RegistrationOutcome::AlreadyExists);
    }
    if output.contains("permission denied") {
        return Err(RegistrarError::PermissionDenied(socket_path.to_string()));
    }
    if output.contains("connection refused") || output.contains("no such file") {
        return Err(RegistrarError::ServerUnavailable(socket_path.to_string()));
    }
    Err(RegistrarError::Failed {
        status,
        output: output.trim().to_string(),
    })
}
