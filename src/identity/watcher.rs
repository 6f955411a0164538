//! Credential file watcher for identity rotation.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::IdentityServer;

/// Quiet period before a burst of file events triggers one rotation.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches PEM files and rotates the server identity when they change.
pub struct IdentityWatcher {
    paths: Vec<PathBuf>,
    server: IdentityServer,
}

/// Keeps the watcher alive. Dropping it stops rotation.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl IdentityWatcher {
    pub fn new(server: IdentityServer, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            server,
        }
    }

    /// Start watching. Must be called inside a tokio runtime.
    pub fn run(self) -> Result<WatchGuard, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in &self.paths {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }
        tracing::info!(paths = ?self.paths, "Identity watcher started");

        let server = self.server;
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Collapse the burst of events a single rewrite produces.
                loop {
                    match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                tracing::info!("Identity files changed, rotating");
                if let Err(e) = server.rotate_identity().await {
                    tracing::error!(error = %e, "Identity rotation failed. Keeping current identity.");
                }
            }
        });

        Ok(WatchGuard {
            _watcher: watcher,
            task,
        })
    }
}
