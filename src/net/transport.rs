//! Transport capability traits.
//!
//! The lifecycle controller only ever talks to a transport through these
//! traits, so it can drive an axum listener, a test double, or anything else
//! that can stop accepting, report in-flight work and close.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::IdentityBinding;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to register handlers for service {service}: {reason}")]
    Handler { service: String, reason: String },

    #[error("server exited: {0}")]
    Serve(String),
}

/// Something that contributes request handlers for one named service.
pub trait ServiceRegistrar: Send + Sync + 'static {
    fn service_name(&self) -> &str;

    fn routes(&self) -> axum::Router;
}

/// A not-yet-started transport.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Attach one service's handlers. Called once per registration, in order,
    /// before `start`.
    fn register_handler(&mut self, registrar: &dyn ServiceRegistrar) -> Result<(), TransportError>;

    /// Configure mutual TLS from `binding` and begin accepting.
    async fn start(
        self,
        binding: Arc<IdentityBinding>,
    ) -> Result<Arc<dyn ServingListener>, TransportError>;
}

/// A transport that is accepting connections.
#[async_trait]
pub trait ServingListener: Send + Sync + 'static {
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting new connections. Idempotent.
    fn stop_accepting(&self);

    fn in_flight(&self) -> usize;

    /// Resolve once no requests are in flight.
    async fn wait_for_in_flight(&self);

    /// Close the listener, abandoning anything still running, and wait for it to exit.
    async fn close(&self) -> Result<(), TransportError>;

    /// Resolve when the listener has exited, for any reason.
    async fn exited(&self) -> Result<(), TransportError>;

    /// Swap in credentials from a rotated binding without dropping connections.
    fn reload(&self, binding: &IdentityBinding) -> Result<(), TransportError>;
}
