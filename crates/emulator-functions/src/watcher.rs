// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source watching.
//!
//! Watches a functions directory and runs a reload callback once changes
//! have settled.

use futures::future::BoxFuture;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

/// Quiet period after the last change before reloading.
pub const DEBOUNCE: Duration = Duration::from_secs(1);

/// Callback run after a batch of changes.
pub type ReloadFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Whether a changed path should trigger a reload.
pub fn is_relevant_change(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    for component in relative.components() {
        let name = component.as_os_str().to_string_lossy();
        if name == "node_modules" || name.starts_with('.') {
            return false;
        }
    }
    path.extension().is_none_or(|ext| ext != "log")
}

/// A running watch on one directory. Stops when dropped.
pub struct SourceWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
    shutdown: Arc<Notify>,
}

impl SourceWatcher {
    /// Watch `dir` recursively, calling `reload` after each settled batch.
    pub fn start(dir: impl Into<PathBuf>, reload: ReloadFn) -> Result<Self, notify::Error> {
        Self::start_with_debounce(dir, reload, DEBOUNCE)
    }

    pub fn start_with_debounce(dir: impl Into<PathBuf>, reload: ReloadFn, debounce: Duration) -> Result<Self, notify::Error> {
        let dir = dir.into();
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let shutdown = Arc::new(Notify::new());
        tokio::spawn(debounce_loop(dir.clone(), rx, reload, debounce, shutdown.clone()));
        debug!(dir = %dir.display(), "Watching functions source");

        Ok(Self {
            dir,
            _watcher: watcher,
            shutdown,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn debounce_loop(
    root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    reload: ReloadFn,
    debounce: Duration,
    shutdown: Arc<Notify>,
) {
    let mut dirty: Option<PathBuf> = None;
    loop {
        let pending = dirty.is_some();
        let wait = async move {
            if pending {
                tokio::time::sleep(debounce).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = shutdown.notified() => break,
            event = rx.recv() => match event {
                Some(Ok(event)) => {
                    if let Some(path) = event.paths.iter().find(|p| is_relevant_change(&root, p)) {
                        dirty = Some(path.clone());
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Watch error"),
                None => break,
            },
            _ = wait => {
                if let Some(path) = dirty.take() {
                    info!(path = %path.display(), "Functions source changed, reloading");
                    reload().await;
                }
            }
        }
    }
    debug!(dir = %root.display(), "Stopped watching functions source");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ignored_paths() {
        let root = Path::new("/srv/functions");
        assert!(is_relevant_change(root, Path::new("/srv/functions/index.js")));
        assert!(is_relevant_change(root, Path::new("/srv/functions/lib/a.ts")));
        assert!(!is_relevant_change(root, Path::new("/srv/functions/node_modules/x/index.js")));
        assert!(!is_relevant_change(root, Path::new("/srv/functions/.env.local")));
        assert!(!is_relevant_change(root, Path::new("/srv/functions/.git/HEAD")));
        assert!(!is_relevant_change(root, Path::new("/srv/functions/debug.log")));
    }

    #[tokio::test]
    async fn test_change_triggers_single_reload() {
        let dir = tempfile::tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let reload: ReloadFn = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let watcher = SourceWatcher::start_with_debounce(dir.path(), reload, Duration::from_millis(200)).unwrap();
        std::fs::write(dir.path().join("index.js"), "a").unwrap();
        std::fs::write(dir.path().join("index.js"), "b").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        watcher.stop();
    }
}
