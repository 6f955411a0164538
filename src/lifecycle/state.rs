//! Server lifecycle states.

use std::fmt;

/// Where a server is in its lifecycle.
///
/// ```text
/// Uninitialized → Initializing → Serving → Draining → Stopped
///                      ↓
///                   Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Created; services may still be registered.
    Uninitialized,
    /// Establishing identity and binding the listener.
    Initializing,
    /// Accepting traffic.
    Serving,
    /// Shutdown sequence running.
    Draining,
    Stopped,
    /// Startup failed. Terminal.
    Failed,
}

impl ServerState {
    /// Stopped or Failed; no further transitions happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Initializing => "initializing",
            ServerState::Serving => "serving",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
            ServerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
