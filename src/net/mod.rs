//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! IdentityBinding
//!     → tls.rs (rustls ServerConfig, client certs required)
//!     → listener.rs (axum-server accept loop, merged service routes)
//!     → inflight.rs (per-request tracking for drain)
//!
//! Listener States:
//!     Accepting → Not accepting (draining) → Closed
//! ```
//!
//! # Design Decisions
//! - The controller sees only the capability traits in transport.rs
//! - TLS is mandatory; there is no plaintext listener
//! - Each request tracked for graceful shutdown

pub mod inflight;
pub mod listener;
pub mod tls;
pub mod transport;

pub use inflight::{InFlightGuard, InFlightTracker};
pub use listener::{AxumListener, AxumTransport};
pub use transport::{ServiceRegistrar, ServingListener, Transport, TransportError};
