//! Shutdown configuration, lifecycle hooks and cleanup callbacks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::config::schema::ShutdownTimings;
use crate::lifecycle::shutdown::ShutdownError;

/// Error type returned by hooks and cleanup callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type StartHook = Arc<dyn Fn() + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(Option<&ShutdownError>) + Send + Sync>;
pub type PreShutdownHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
pub type PostShutdownHook = Arc<dyn Fn(Option<&ShutdownError>) -> Result<(), BoxError> + Send + Sync>;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(45);

/// Timing and hooks for the shutdown sequence.
///
/// `force_timeout` is measured from the moment shutdown is triggered and
/// bounds the pre-hook, stop and drain phases together. Cleanup always runs.
#[derive(Clone)]
pub struct ShutdownConfig {
    /// Upper bound for the pre-shutdown hook.
    pub grace_period: Duration,
    /// Upper bound for waiting on in-flight requests.
    pub drain_timeout: Duration,
    pub force_timeout: Duration,
    pub on_shutdown_start: Option<StartHook>,
    pub on_shutdown_complete: Option<CompleteHook>,
    pub pre_shutdown_hook: Option<PreShutdownHook>,
    pub post_shutdown_hook: Option<PostShutdownHook>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            force_timeout: DEFAULT_FORCE_TIMEOUT,
            on_shutdown_start: None,
            on_shutdown_complete: None,
            pre_shutdown_hook: None,
            post_shutdown_hook: None,
        }
    }
}

impl ShutdownConfig {
    /// Timings from configuration, no hooks.
    pub fn from_timings(timings: &ShutdownTimings) -> Self {
        Self {
            grace_period: Duration::from_secs(timings.grace_period_secs),
            drain_timeout: Duration::from_secs(timings.drain_timeout_secs),
            force_timeout: Duration::from_secs(timings.force_timeout_secs),
            ..Self::default()
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_force_timeout(mut self, force_timeout: Duration) -> Self {
        self.force_timeout = force_timeout;
        self
    }

    pub fn on_shutdown_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_shutdown_start = Some(Arc::new(hook));
        self
    }

    pub fn on_shutdown_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&ShutdownError>) + Send + Sync + 'static,
    {
        self.on_shutdown_complete = Some(Arc::new(hook));
        self
    }

    /// Runs before the listener stops accepting, e.g. to deregister from
    /// service discovery.
    pub fn pre_shutdown_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.pre_shutdown_hook = Some(Arc::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(hook())
        }));
        self
    }

    /// Receives the aggregated error of every earlier phase.
    pub fn post_shutdown_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&ShutdownError>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.post_shutdown_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ShutdownConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownConfig")
            .field("grace_period", &self.grace_period)
            .field("drain_timeout", &self.drain_timeout)
            .field("force_timeout", &self.force_timeout)
            .field("on_shutdown_start", &self.on_shutdown_start.is_some())
            .field("on_shutdown_complete", &self.on_shutdown_complete.is_some())
            .field("pre_shutdown_hook", &self.pre_shutdown_hook.is_some())
            .field("post_shutdown_hook", &self.post_shutdown_hook.is_some())
            .finish()
    }
}

pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

pub(crate) struct CleanupEntry {
    pub(crate) name: String,
    pub(crate) run: CleanupFn,
}

/// Ordered cleanup callbacks. Closed once shutdown takes them.
#[derive(Default)]
pub(crate) struct CleanupRegistry {
    entries: Vec<CleanupEntry>,
    registered: usize,
    closed: bool,
}

impl CleanupRegistry {
    /// Append a callback. Unnamed callbacks get `cleanup-<n>`, counting every
    /// registration so far.
    ///
    /// Returns the name used, or `None` once shutdown has begun.
    pub(crate) fn register(&mut self, name: Option<String>, run: CleanupFn) -> Option<String> {
        if self.closed {
            return None;
        }
        self.registered += 1;
        let name = name.unwrap_or_else(|| format!("cleanup-{}", self.registered));
        self.entries.push(CleanupEntry { name: name.clone(), run });
        Some(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reject further registrations without running anything yet.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Close the registry and hand out every callback in registration order.
    pub(crate) fn take(&mut self) -> Vec<CleanupEntry> {
        self.closed = true;
        std::mem::take(&mut self.entries)
    }
}
