//! Server lifecycle controller.
//!
//! # Responsibilities
//! - Own the server state machine and the one lock guarding it
//! - Collect service registrations before serving
//! - Establish the identity binding and start the transport
//! - Funnel close, signal, deadline and transport exit into one shutdown
//!
//! # Design Decisions
//! - State changes happen only inside short lock-held sections; nothing is
//!   awaited with the lock held
//! - The shutdown sequence runs on its own task, so dropping a `serve` or
//!   `close` future never strands it
//! - Dropping `serve` while initializing moves the server to `Failed` and
//!   releases any parked trigger
//! - A trigger that arrives while initializing is parked and fires the moment
//!   the server starts serving
//! - Terminal state is published on a watch channel for any number of waiters
//!
//! # State Machine
//! ```text
//! Uninitialized ──serve──→ Initializing ──started──→ Serving ──trigger──→ Draining ──→ Stopped
//!       │                        │
//!       └──close──→ Draining     └──startup error or serve dropped──→ Failed
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::identity::{BindingSlot, IdentityBinding, IdentityProvider, IdentitySettings};
use crate::lifecycle::hooks::{BoxError, CleanupFn, ShutdownConfig};
use crate::lifecycle::registry::{RegistryError, ServiceRegistration, ServiceRegistry};
use crate::lifecycle::shutdown::{ShutdownError, ShutdownOrchestrator, ShutdownPhaseError, ShutdownTrigger};
use crate::lifecycle::signals::wait_for_shutdown_signal;
use crate::lifecycle::state::ServerState;
use crate::net::{ServingListener, Transport};
use crate::observability::metrics;

/// Everything needed to construct an [`IdentityServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub identity: IdentitySettings,
    pub shutdown: ShutdownConfig,
    /// Install SIGINT/SIGTERM/SIGQUIT handling while serving.
    pub handle_signals: bool,
}

impl ServerOptions {
    pub fn new(identity: IdentitySettings) -> Self {
        Self {
            identity,
            shutdown: ShutdownConfig::default(),
            handle_signals: false,
        }
    }

    /// Identity settings and shutdown timings from a loaded configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(IdentitySettings::new(
            config.service.name.clone(),
            config.service.domain.clone(),
        ))
        .with_shutdown(ShutdownConfig::from_timings(&config.shutdown))
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }
}

struct Core {
    state: ServerState,
    registry: ServiceRegistry,
    listener: Option<Arc<dyn ServingListener>>,
    parked: Option<ShutdownTrigger>,
    outcome: Option<ShutdownError>,
}

struct Inner {
    id: Uuid,
    settings: IdentitySettings,
    provider: Arc<dyn IdentityProvider>,
    binding: BindingSlot,
    orchestrator: ShutdownOrchestrator,
    handle_signals: bool,
    core: Mutex<Core>,
    state_tx: watch::Sender<ServerState>,
}

/// An identity-aware server with a managed lifecycle.
///
/// Cheap to clone; clones share the same server.
#[derive(Clone)]
pub struct IdentityServer {
    inner: Arc<Inner>,
}

/// Fails the server if `serve` is dropped before it reaches `Serving`.
struct StartupGuard<'a> {
    server: &'a IdentityServer,
    armed: bool,
}

impl StartupGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut core = self.server.lock();
        if core.state == ServerState::Initializing {
            tracing::warn!("Serve dropped during startup");
            core.parked = None;
            metrics::record_startup_failure("cancelled");
            self.server.transition(&mut core, ServerState::Failed);
        }
    }
}

/// Aborts the deadline and signal watchers when `serve` returns.
struct TriggerTasks(Vec<JoinHandle<()>>);

impl Drop for TriggerTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl IdentityServer {
    pub fn new(options: ServerOptions, provider: Arc<dyn IdentityProvider>) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Uninitialized);
        let id = Uuid::new_v4();

        tracing::debug!(
            server_id = %id,
            service = %options.identity.service_name,
            trust_domain = %options.identity.trust_domain,
            "Server created"
        );

        Self {
            inner: Arc::new(Inner {
                id,
                settings: options.identity,
                provider,
                binding: BindingSlot::default(),
                orchestrator: ShutdownOrchestrator::new(options.shutdown),
                handle_signals: options.handle_signals,
                core: Mutex::new(Core {
                    state: ServerState::Uninitialized,
                    registry: ServiceRegistry::new(),
                    listener: None,
                    parked: None,
                    outcome: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// The current identity binding, once established.
    pub fn binding(&self) -> Option<Arc<IdentityBinding>> {
        self.inner.binding.load()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().listener.as_ref().and_then(|l| l.local_addr())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.lock().registry.names()
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("identity_server", server_id = %self.inner.id)
    }

    fn transition(&self, core: &mut Core, to: ServerState) {
        let from = core.state;
        core.state = to;
        tracing::info!(server_id = %self.inner.id, from = %from, to = %to, "State transition");
        metrics::record_transition(from.as_str(), to.as_str());
        self.inner.state_tx.send_replace(to);
    }

    /// Add a service whose handlers are attached when the server starts.
    ///
    /// Rejected once `serve` has been called.
    pub fn register_service(&self, registration: ServiceRegistration) -> Result<(), ServerError> {
        let mut core = self.lock();
        let name = registration.service_name().to_string();
        match core.registry.register(registration) {
            Ok(()) => {
                tracing::debug!(service = %name, "Service registered");
                Ok(())
            }
            Err(RegistryError::InvalidRegistrar) => Err(ServerError::Validation {
                argument: "registration",
                reason: RegistryError::InvalidRegistrar.to_string(),
            }),
            Err(e) => {
                tracing::warn!(service = %name, state = %core.state, "Late service registration rejected");
                Err(e.into())
            }
        }
    }

    /// Register a cleanup callback to run during shutdown, in registration order.
    pub fn register_cleanup_func<F, Fut>(&self, cleanup: F) -> Result<(), ServerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let run = Box::new(move || -> BoxFuture<'static, Result<(), BoxError>> { Box::pin(cleanup()) });
        self.push_cleanup(None, run)
    }

    /// Like [`register_cleanup_func`](Self::register_cleanup_func) with a name
    /// used in logs and in the shutdown error.
    pub fn register_named_cleanup_func<F, Fut>(
        &self,
        name: impl Into<String>,
        cleanup: F,
    ) -> Result<(), ServerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServerError::Validation {
                argument: "name",
                reason: "cleanup name must not be empty".to_string(),
            });
        }

        let run = Box::new(move || -> BoxFuture<'static, Result<(), BoxError>> { Box::pin(cleanup()) });
        self.push_cleanup(Some(name), run)
    }

    fn push_cleanup(&self, name: Option<String>, run: CleanupFn) -> Result<(), ServerError> {
        match self.inner.orchestrator.register_cleanup(name, run) {
            Some(name) => {
                tracing::debug!(cleanup = %name, "Cleanup registered");
                Ok(())
            }
            None => {
                tracing::warn!("Cleanup registration rejected, shutdown already started");
                Err(ServerError::ShutdownInProgress)
            }
        }
    }

    /// Establish identity, start `transport` and block until the server stops.
    ///
    /// Returns the aggregated shutdown error if any shutdown phase failed.
    pub async fn serve<T: Transport>(&self, transport: T) -> Result<(), ServerError> {
        self.serve_inner(transport, None).instrument(self.span()).await
    }

    /// Like [`serve`](Self::serve), but shuts down when `deadline` is reached.
    pub async fn serve_with_deadline<T: Transport>(
        &self,
        transport: T,
        deadline: Instant,
    ) -> Result<(), ServerError> {
        self.serve_inner(transport, Some(deadline))
            .instrument(self.span())
            .await
    }

    async fn serve_inner<T: Transport>(
        &self,
        mut transport: T,
        deadline: Option<Instant>,
    ) -> Result<(), ServerError> {
        let registrations = {
            let mut core = self.lock();
            if core.state != ServerState::Uninitialized {
                return Err(ServerError::InvalidState {
                    operation: "serve",
                    state: core.state,
                });
            }
            core.registry.seal();
            self.transition(&mut core, ServerState::Initializing);
            core.registry.snapshot()
        };
        let startup = StartupGuard {
            server: self,
            armed: true,
        };

        let _triggers = self.arm_triggers(deadline);

        let binding = match IdentityBinding::establish(&self.inner.settings, self.inner.provider.as_ref()).await {
            Ok(binding) => Arc::new(binding),
            Err(e) => return Err(self.fail(e)),
        };

        for registration in &registrations {
            if let Err(e) = transport.register_handler(registration.as_ref()) {
                return Err(self.fail(e.into()));
            }
        }

        let listener = match transport.start(Arc::clone(&binding)).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.fail(e.into())),
        };

        let parked = {
            let mut core = self.lock();
            self.inner.binding.replace(binding);
            core.listener = Some(Arc::clone(&listener));
            self.transition(&mut core, ServerState::Serving);
            core.parked.take()
        };
        startup.disarm();
        tracing::info!(
            address = ?listener.local_addr(),
            services = registrations.len(),
            "Serving"
        );

        if let Some(trigger) = parked {
            tracing::info!(trigger = %trigger, "Firing shutdown trigger received during startup");
            self.begin_shutdown(trigger, Vec::new());
        }

        tokio::select! {
            _ = self.wait_terminal() => {}
            exit = listener.exited() => {
                let reason = match exit {
                    Ok(()) => "listener stopped".to_string(),
                    Err(e) => e.to_string(),
                };
                // No-op unless still serving.
                self.begin_shutdown(
                    ShutdownTrigger::TransportExited,
                    vec![ShutdownPhaseError::TransportExited(reason)],
                );
                self.wait_terminal().await;
            }
        }

        match self.lock().outcome.clone() {
            Some(e) => Err(ServerError::Shutdown(e)),
            None => Ok(()),
        }
    }

    fn fail(&self, error: ServerError) -> ServerError {
        tracing::error!(error = %error, "Server startup failed");
        metrics::record_startup_failure(error.as_label());
        let mut core = self.lock();
        core.parked = None;
        self.transition(&mut core, ServerState::Failed);
        error
    }

    fn arm_triggers(&self, deadline: Option<Instant>) -> TriggerTasks {
        let mut tasks = Vec::new();

        if let Some(deadline) = deadline {
            let server = self.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                tracing::info!("Serve deadline reached");
                server.begin_shutdown(ShutdownTrigger::Deadline, Vec::new());
            }));
        }

        if self.inner.handle_signals {
            let server = self.clone();
            tasks.push(tokio::spawn(async move {
                match wait_for_shutdown_signal().await {
                    Ok(()) => {
                        server.begin_shutdown(ShutdownTrigger::Signal, Vec::new());
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
                }
            }));
        }

        TriggerTasks(tasks)
    }

    /// Start the shutdown sequence if this trigger is the first one.
    ///
    /// Returns `true` when this call owns the shutdown, either started or
    /// parked until serving begins.
    fn begin_shutdown(&self, trigger: ShutdownTrigger, causes: Vec<ShutdownPhaseError>) -> bool {
        let listener = {
            let mut core = self.lock();
            match core.state {
                ServerState::Uninitialized | ServerState::Serving => {}
                ServerState::Initializing => {
                    if core.parked.is_some() {
                        return false;
                    }
                    tracing::info!(trigger = %trigger, "Shutdown requested during startup, parking");
                    core.parked = Some(trigger);
                    return true;
                }
                ServerState::Draining | ServerState::Stopped | ServerState::Failed => return false,
            }
            core.registry.seal();
            self.inner.orchestrator.close_registrations();
            self.transition(&mut core, ServerState::Draining);
            core.listener.take()
        };

        let server = self.clone();
        let span = self.span();
        tokio::spawn(
            async move {
                let outcome = server.inner.orchestrator.run(trigger, listener, causes).await;
                let mut core = server.lock();
                core.outcome = outcome;
                server.transition(&mut core, ServerState::Stopped);
            }
            .instrument(span),
        );
        true
    }

    async fn wait_terminal(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        // The sender lives in `inner`, so the channel stays open.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Shut the server down and wait for it to stop.
    ///
    /// The call that starts the shutdown receives its aggregated error.
    /// Every other call, including calls on a stopped server, returns `Ok`.
    pub async fn close(&self) -> Result<(), ServerError> {
        let owner = self.begin_shutdown(ShutdownTrigger::Close, Vec::new());
        self.wait_terminal().await;

        if !owner {
            return Ok(());
        }
        match self.lock().outcome.clone() {
            Some(e) => Err(ServerError::Shutdown(e)),
            None => Ok(()),
        }
    }

    /// Fetch fresh identity material and swap it in without dropping connections.
    pub async fn rotate_identity(&self) -> Result<(), ServerError> {
        let listener = {
            let core = self.lock();
            if core.state != ServerState::Serving {
                return Err(ServerError::InvalidState {
                    operation: "rotate_identity",
                    state: core.state,
                });
            }
            core.listener.clone()
        };

        let result = self.reestablish(listener).await;
        metrics::record_rotation(result.as_ref().err().map(ServerError::as_label));
        result
    }

    async fn reestablish(&self, listener: Option<Arc<dyn ServingListener>>) -> Result<(), ServerError> {
        let binding = Arc::new(
            IdentityBinding::establish(&self.inner.settings, self.inner.provider.as_ref())
                .instrument(self.span())
                .await?,
        );
        if let Some(listener) = listener {
            listener.reload(&binding)?;
        }
        self.inner.binding.replace(Arc::clone(&binding));
        tracing::info!(spiffe_id = %binding.spiffe_id(), "Identity rotated");
        Ok(())
    }

    /// Wait until the server is serving, or fail if it stops first or the timeout passes.
    pub async fn wait_until_serving(&self, timeout: Duration) -> Result<(), ServerError> {
        let mut rx = self.inner.state_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, ServerState::Uninitialized | ServerState::Initializing)),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) | Err(_) => return Err(ServerError::NotReady(timeout)),
        };
        if state == ServerState::Serving {
            Ok(())
        } else {
            Err(ServerError::InvalidState {
                operation: "wait_until_serving",
                state,
            })
        }
    }
}

impl std::fmt::Debug for IdentityServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.lock();
        f.debug_struct("IdentityServer")
            .field("id", &self.inner.id)
            .field("service", &self.inner.settings.service_name)
            .field("state", &core.state)
            .field("registry", &core.registry)
            .field("orchestrator", &self.inner.orchestrator)
            .finish()
    }
}
