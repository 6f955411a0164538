//! axum-server backed transport with mutual TLS.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Merge registered service routes into one router
//! - Serve over rustls with client certificate verification
//! - Expose stop/drain/close/reload to the lifecycle controller
//!
//! # Design Decisions
//! - The socket is bound before `serve` so bind errors surface early
//! - Overlapping routes from two services fail registration instead of panicking
//! - Stop accepting maps to axum-server's graceful shutdown; close maps to hard shutdown
//! - In-flight requests are counted by middleware, not by connection

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ListenerConfig;
use crate::identity::IdentityBinding;
use crate::net::inflight::InFlightTracker;
use crate::net::tls;
use crate::net::transport::{ServiceRegistrar, ServingListener, Transport, TransportError};

/// Exit outcome of the serve task; `None` while running.
type ExitState = Option<Result<(), String>>;

/// A bound, not yet serving, HTTPS transport.
pub struct AxumTransport {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    router: Router,
    tracker: InFlightTracker,
}

impl AxumTransport {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, TransportError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            TransportError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TransportError::Bind)?;

        Self::from_std(listener.into_std().map_err(TransportError::Bind)?)
    }

    /// Wrap an already bound listener.
    pub fn from_std(listener: std::net::TcpListener) -> Result<Self, TransportError> {
        listener.set_nonblocking(true).map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self {
            listener,
            local_addr,
            router: Router::new(),
            tracker: InFlightTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for AxumTransport {
    fn register_handler(&mut self, registrar: &dyn ServiceRegistrar) -> Result<(), TransportError> {
        let routes = registrar.routes();
        let router = std::mem::take(&mut self.router);
        // axum panics when merged routes overlap.
        self.router = catch_unwind(AssertUnwindSafe(move || router.merge(routes))).map_err(|panic| {
            let reason = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "conflicting routes".to_string());
            TransportError::Handler {
                service: registrar.service_name().to_string(),
                reason,
            }
        })?;
        tracing::debug!(service = %registrar.service_name(), "Service handlers attached");
        Ok(())
    }

    async fn start(
        self,
        binding: Arc<IdentityBinding>,
    ) -> Result<Arc<dyn ServingListener>, TransportError> {
        let rustls_config = RustlsConfig::from_config(Arc::new(tls::server_config(&binding)?));
        let handle = Handle::new();

        let tracker = self.tracker.clone();
        let app = self.router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(move |request: Request, next: Next| {
                    let guard = tracker.track();
                    async move {
                        let response = next.run(request).await;
                        drop(guard);
                        response
                    }
                })),
        );

        let server = axum_server::from_tcp_rustls(self.listener, rustls_config.clone())
            .handle(handle.clone());

        let (exit_tx, exit_rx) = watch::channel::<ExitState>(None);
        let local_addr = self.local_addr;
        tokio::spawn(async move {
            let outcome = server
                .serve(app.into_make_service())
                .await
                .map_err(|e| e.to_string());
            match &outcome {
                Ok(()) => tracing::info!(address = %local_addr, "HTTPS server stopped"),
                Err(e) => tracing::error!(address = %local_addr, error = %e, "HTTPS server failed"),
            }
            exit_tx.send_replace(Some(outcome));
        });

        tracing::info!(
            address = %local_addr,
            spiffe_id = %binding.spiffe_id(),
            "HTTPS server starting"
        );

        Ok(Arc::new(AxumListener {
            local_addr,
            handle,
            rustls_config,
            tracker: self.tracker,
            exit_rx,
        }))
    }
}

/// The running side of [`AxumTransport`].
pub struct AxumListener {
    local_addr: SocketAddr,
    handle: Handle,
    rustls_config: RustlsConfig,
    tracker: InFlightTracker,
    exit_rx: watch::Receiver<ExitState>,
}

#[async_trait]
impl ServingListener for AxumListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn stop_accepting(&self) {
        // Without a timeout; the drain and force timers bound the wait.
        self.handle.graceful_shutdown(None);
    }

    fn in_flight(&self) -> usize {
        self.tracker.count()
    }

    async fn wait_for_in_flight(&self) {
        self.tracker.wait_idle().await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle.shutdown();
        self.exited().await
    }

    async fn exited(&self) -> Result<(), TransportError> {
        let mut rx = self.exit_rx.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::Serve("serve task dropped".to_string()))?
            .clone();
        match outcome {
            Some(Err(reason)) => Err(TransportError::Serve(reason)),
            _ => Ok(()),
        }
    }

    fn reload(&self, binding: &IdentityBinding) -> Result<(), TransportError> {
        let config = tls::server_config(binding)?;
        self.rustls_config.reload_from_config(Arc::new(config));
        tracing::info!(spiffe_id = %binding.spiffe_id(), "TLS credentials reloaded");
        Ok(())
    }
}
