//! Identity-aware server lifecycle library.
//!
//! Binds a service to a SPIFFE workload identity, serves it over mutual TLS
//! and shuts it down in a fixed, bounded order.

pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod registrar;

pub use config::schema::ServerConfig;
pub use error::ServerError;
pub use identity::{IdentityBinding, IdentityProvider, TrustBundle, TrustDomain};
pub use lifecycle::{IdentityServer, ServerOptions, ServerState, ShutdownConfig};
