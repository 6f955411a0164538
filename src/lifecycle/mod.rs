//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (controller.rs):
//!     register services (registry.rs) → serve → establish identity
//!     → attach handlers → start transport → Serving
//!
//! Shutdown (shutdown.rs):
//!     close / signal / deadline / transport exit → Draining
//!     → announce → pre-hook → stop accepting → drain → close listener
//!     → cleanup (hooks.rs) → post-hook → complete → Stopped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT/SIGQUIT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: identity first, then handlers, then listener
//! - Ordered shutdown: stop accept, drain, close, cleanup
//! - Shutdown has a force timeout; cleanup still runs after it fires

pub mod controller;
pub mod hooks;
pub mod registry;
pub mod shutdown;
pub mod signals;
pub mod state;

pub use controller::{IdentityServer, ServerOptions};
pub use hooks::{BoxError, ShutdownConfig};
pub use registry::{RegistryError, ServiceRegistration};
pub use shutdown::{ShutdownError, ShutdownOrchestrator, ShutdownPhaseError, ShutdownTrigger};
pub use state::ServerState;
