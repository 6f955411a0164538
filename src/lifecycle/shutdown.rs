//! Graceful shutdown orchestration.
//!
//! # Responsibilities
//! - Run the shutdown phases in a fixed order
//! - Bound the pre-hook, drain and overall sequence with timers
//! - Own the cleanup callback registry
//! - Aggregate every phase failure into one error
//!
//! # Design Decisions
//! - Best effort: a failing phase is recorded and the next phase still runs
//! - The force timer starts at trigger time and races pre-hook, stop and drain;
//!   cleanup and the post-hook always run after it
//! - Hooks and callbacks run with no lock held
//! - Panics in hooks and callbacks are caught and recorded like errors
//!
//! # Phases
//! ```text
//! Announce → Pre-hook → Stop accepting → Drain ─┐
//!      └──────── force timeout ─────────────────┤
//!                                               ↓
//!                     Close listener → Cleanup → Post-hook → Complete
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::time::Instant;

use crate::lifecycle::hooks::{CleanupFn, CleanupRegistry, ShutdownConfig};
use crate::net::ServingListener;
use crate::observability::metrics;

/// What started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownTrigger {
    Close,
    Signal,
    Deadline,
    /// The listener stopped on its own while serving.
    TransportExited,
}

impl ShutdownTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownTrigger::Close => "close",
            ShutdownTrigger::Signal => "signal",
            ShutdownTrigger::Deadline => "deadline",
            ShutdownTrigger::TransportExited => "transport_exited",
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Announce,
    PreHook,
    StopAccepting,
    Drain,
    Close,
    Cleanup,
    PostHook,
    Complete,
}

impl ShutdownPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownPhase::Announce => "announce",
            ShutdownPhase::PreHook => "pre_hook",
            ShutdownPhase::StopAccepting => "stop_accepting",
            ShutdownPhase::Drain => "drain",
            ShutdownPhase::Close => "close",
            ShutdownPhase::Cleanup => "cleanup",
            ShutdownPhase::PostHook => "post_hook",
            ShutdownPhase::Complete => "complete",
        }
    }
}

/// One failure recorded during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownPhaseError {
    #[error("pre-shutdown hook failed: {0}")]
    PreHook(String),

    #[error("pre-shutdown hook exceeded grace period of {0:?}")]
    PreHookTimeout(Duration),

    #[error("pre-shutdown hook panicked")]
    PreHookPanic,

    #[error("drain timed out after {timeout:?} with {in_flight} request(s) in flight")]
    DrainTimeout { timeout: Duration, in_flight: usize },

    #[error("force timeout of {timeout:?} reached with {in_flight} request(s) in flight")]
    ForceTimeout { timeout: Duration, in_flight: usize },

    #[error("listener close failed: {0}")]
    Listener(String),

    #[error("cleanup {name:?} failed: {reason}")]
    Cleanup { name: String, reason: String },

    #[error("cleanup {name:?} panicked")]
    CleanupPanic { name: String },

    #[error("post-shutdown hook failed: {0}")]
    PostHook(String),

    #[error("post-shutdown hook panicked")]
    PostHookPanic,

    #[error("transport exited unexpectedly: {0}")]
    TransportExited(String),
}

impl ShutdownPhaseError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ShutdownPhaseError::PreHook(_) => "pre_hook",
            ShutdownPhaseError::PreHookTimeout(_) => "pre_hook_timeout",
            ShutdownPhaseError::PreHookPanic => "pre_hook_panic",
            ShutdownPhaseError::DrainTimeout { .. } => "drain_timeout",
            ShutdownPhaseError::ForceTimeout { .. } => "force_timeout",
            ShutdownPhaseError::Listener(_) => "listener",
            ShutdownPhaseError::Cleanup { .. } => "cleanup",
            ShutdownPhaseError::CleanupPanic { .. } => "cleanup_panic",
            ShutdownPhaseError::PostHook(_) => "post_hook",
            ShutdownPhaseError::PostHookPanic => "post_hook_panic",
            ShutdownPhaseError::TransportExited(_) => "transport_exited",
        }
    }
}

/// Every failure from one shutdown run, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    causes: Vec<ShutdownPhaseError>,
}

impl ShutdownError {
    /// `None` when there is nothing to report.
    pub fn from_causes(causes: Vec<ShutdownPhaseError>) -> Option<Self> {
        if causes.is_empty() {
            None
        } else {
            Some(Self { causes })
        }
    }

    pub fn causes(&self) -> &[ShutdownPhaseError] {
        &self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown completed with {} error(s): ", self.causes.len())?;
        for (i, cause) in self.causes.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

/// Runs the shutdown sequence.
pub struct ShutdownOrchestrator {
    config: ShutdownConfig,
    cleanups: Mutex<CleanupRegistry>,
}

impl ShutdownOrchestrator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            cleanups: Mutex::new(CleanupRegistry::default()),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    fn cleanups(&self) -> MutexGuard<'_, CleanupRegistry> {
        self.cleanups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a cleanup callback, named `cleanup-<n>` when `name` is `None`.
    ///
    /// Returns the name used, or `None` once shutdown has begun.
    pub fn register_cleanup(&self, name: Option<String>, run: CleanupFn) -> Option<String> {
        self.cleanups().register(name, run)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups().len()
    }

    /// Reject cleanup registrations from now on.
    pub fn close_registrations(&self) {
        self.cleanups().close();
    }

    /// Run every phase once and return the aggregate failure, if any.
    ///
    /// `causes` carries failures recorded before the sequence started.
    pub async fn run(
        &self,
        trigger: ShutdownTrigger,
        listener: Option<Arc<dyn ServingListener>>,
        mut causes: Vec<ShutdownPhaseError>,
    ) -> Option<ShutdownError> {
        let started = Instant::now();
        let force_deadline = started + self.config.force_timeout;
        self.close_registrations();

        tracing::info!(
            trigger = %trigger,
            grace_period = ?self.config.grace_period,
            drain_timeout = ?self.config.drain_timeout,
            force_timeout = ?self.config.force_timeout,
            "Shutdown started"
        );

        if let Some(hook) = &self.config.on_shutdown_start {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                tracing::error!("on_shutdown_start hook panicked");
            }
        }
        metrics::record_phase(ShutdownPhase::Announce.as_str(), started.elapsed());

        let bounded = async {
            self.run_pre_hook(&mut causes).await;

            if let Some(listener) = &listener {
                let phase_started = Instant::now();
                listener.stop_accepting();
                tracing::info!(in_flight = listener.in_flight(), "Stopped accepting connections");
                metrics::record_phase(ShutdownPhase::StopAccepting.as_str(), phase_started.elapsed());
            }

            self.drain(listener.as_deref(), &mut causes).await;
        };

        if tokio::time::timeout_at(force_deadline, bounded).await.is_err() {
            let in_flight = listener.as_ref().map_or(0, |l| l.in_flight());
            tracing::warn!(
                force_timeout = ?self.config.force_timeout,
                in_flight,
                "Force timeout reached, skipping remaining drain"
            );
            causes.push(ShutdownPhaseError::ForceTimeout {
                timeout: self.config.force_timeout,
                in_flight,
            });
            if let Some(listener) = &listener {
                listener.stop_accepting();
            }
        }

        if let Some(listener) = &listener {
            let phase_started = Instant::now();
            match listener.close().await {
                Ok(()) => tracing::info!("Listener closed"),
                Err(e) if trigger == ShutdownTrigger::TransportExited => {
                    tracing::debug!(error = %e, "Listener already exited");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener close failed");
                    causes.push(ShutdownPhaseError::Listener(e.to_string()));
                }
            }
            metrics::record_phase(ShutdownPhase::Close.as_str(), phase_started.elapsed());
        }

        self.run_cleanups(&mut causes).await;
        self.run_post_hook(&mut causes);

        for cause in &causes {
            metrics::record_shutdown_error(cause.as_label());
        }
        let outcome = ShutdownError::from_causes(causes);

        let phase_started = Instant::now();
        if let Some(hook) = &self.config.on_shutdown_complete {
            if catch_unwind(AssertUnwindSafe(|| hook(outcome.as_ref()))).is_err() {
                tracing::error!("on_shutdown_complete hook panicked");
            }
        }
        metrics::record_phase(ShutdownPhase::Complete.as_str(), phase_started.elapsed());

        let elapsed = started.elapsed();
        match &outcome {
            None => tracing::info!(trigger = %trigger, elapsed = ?elapsed, "Shutdown complete"),
            Some(e) => tracing::warn!(
                trigger = %trigger,
                elapsed = ?elapsed,
                errors = e.len(),
                "Shutdown complete with errors: {}",
                e
            ),
        }
        metrics::record_shutdown(trigger.as_str(), elapsed, outcome.as_ref().map_or(0, ShutdownError::len));

        outcome
    }

    async fn run_pre_hook(&self, causes: &mut Vec<ShutdownPhaseError>) {
        let Some(hook) = &self.config.pre_shutdown_hook else {
            return;
        };
        let started = Instant::now();

        let future = match catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(future) => future,
            Err(_) => {
                tracing::error!("Pre-shutdown hook panicked");
                causes.push(ShutdownPhaseError::PreHookPanic);
                return;
            }
        };

        match tokio::time::timeout(self.config.grace_period, AssertUnwindSafe(future).catch_unwind()).await {
            Ok(Ok(Ok(()))) => tracing::debug!("Pre-shutdown hook complete"),
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, "Pre-shutdown hook failed");
                causes.push(ShutdownPhaseError::PreHook(e.to_string()));
            }
            Ok(Err(_)) => {
                tracing::error!("Pre-shutdown hook panicked");
                causes.push(ShutdownPhaseError::PreHookPanic);
            }
            Err(_) => {
                tracing::warn!(grace_period = ?self.config.grace_period, "Pre-shutdown hook timed out");
                causes.push(ShutdownPhaseError::PreHookTimeout(self.config.grace_period));
            }
        }
        metrics::record_phase(ShutdownPhase::PreHook.as_str(), started.elapsed());
    }

    async fn drain(&self, listener: Option<&dyn ServingListener>, causes: &mut Vec<ShutdownPhaseError>) {
        let Some(listener) = listener else {
            return;
        };
        let started = Instant::now();

        match tokio::time::timeout(self.config.drain_timeout, listener.wait_for_in_flight()).await {
            Ok(()) => tracing::info!(elapsed = ?started.elapsed(), "Drain complete"),
            Err(_) => {
                let in_flight = listener.in_flight();
                tracing::warn!(drain_timeout = ?self.config.drain_timeout, in_flight, "Drain timed out");
                causes.push(ShutdownPhaseError::DrainTimeout {
                    timeout: self.config.drain_timeout,
                    in_flight,
                });
            }
        }
        metrics::record_phase(ShutdownPhase::Drain.as_str(), started.elapsed());
    }

    async fn run_cleanups(&self, causes: &mut Vec<ShutdownPhaseError>) {
        let entries = self.cleanups().take();
        let started = Instant::now();

        for entry in entries {
            let name = entry.name;
            let run = entry.run;
            match tokio::spawn(async move { run().await }).await {
                Ok(Ok(())) => tracing::debug!(cleanup = %name, "Cleanup complete"),
                Ok(Err(e)) => {
                    tracing::error!(cleanup = %name, error = %e, "Cleanup failed");
                    causes.push(ShutdownPhaseError::Cleanup {
                        name,
                        reason: e.to_string(),
                    });
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(cleanup = %name, "Cleanup panicked");
                    causes.push(ShutdownPhaseError::CleanupPanic { name });
                }
                Err(e) => {
                    causes.push(ShutdownPhaseError::Cleanup {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        metrics::record_phase(ShutdownPhase::Cleanup.as_str(), started.elapsed());
    }

    fn run_post_hook(&self, causes: &mut Vec<ShutdownPhaseError>) {
        let Some(hook) = &self.config.post_shutdown_hook else {
            return;
        };

        let started = Instant::now();
        let so_far = ShutdownError::from_causes(causes.clone());
        match catch_unwind(AssertUnwindSafe(|| hook(so_far.as_ref()))) {
            Ok(Ok(())) => tracing::debug!("Post-shutdown hook complete"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Post-shutdown hook failed");
                causes.push(ShutdownPhaseError::PostHook(e.to_string()));
            }
            Err(_) => {
                tracing::error!("Post-shutdown hook panicked");
                causes.push(ShutdownPhaseError::PostHookPanic);
            }
        }
        metrics::record_phase(ShutdownPhase::PostHook.as_str(), started.elapsed());
    }
}

impl fmt::Debug for ShutdownOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownOrchestrator")
            .field("config", &self.config)
            .field("cleanups", &self.cleanup_count())
            .finish()
    }
}
