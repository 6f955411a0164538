//! Top-level error type for the server API.

use std::time::Duration;

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::identity::ProviderError;
use crate::lifecycle::registry::RegistryError;
use crate::lifecycle::shutdown::ShutdownError;
use crate::lifecycle::state::ServerState;
use crate::net::TransportError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A caller passed an invalid argument.
    #[error("invalid {argument}: {reason}")]
    Validation { argument: &'static str, reason: String },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    /// The identity provider failed or handed out unusable material.
    #[error("identity provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("server not serving after {0:?}")]
    NotReady(Duration),

    #[error("shutdown already in progress")]
    ShutdownInProgress,
}

impl ServerError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ServerError::Configuration(_) => "configuration",
            ServerError::Validation { .. } => "validation",
            ServerError::InvalidState { .. } => "invalid_state",
            ServerError::Provider(_) => "provider",
            ServerError::Registry(_) => "registry",
            ServerError::Transport(_) => "transport",
            ServerError::Shutdown(_) => "shutdown",
            ServerError::NotReady(_) => "not_ready",
            ServerError::ShutdownInProgress => "shutdown_in_progress",
        }
    }
}
