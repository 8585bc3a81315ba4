//! Config file watching and hot-reload diffing
//!
//! Watches the `mcpServers` document, debounces editor write bursts, reloads,
//! and emits a [`ConfigChange`] carrying the new snapshot plus the diff the
//! connection manager applies. An unreadable or invalid file degrades to an
//! empty snapshot so a broken edit disconnects outbounds instead of wedging
//! the watcher.

use crate::config::config::{diff_snapshots, load_servers_config, ConfigDiff, ServersSnapshot};
use crate::error::{GatewayError, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Minimum quiet window before a burst of file events triggers a reload
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Emitted after each effective reload
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub snapshot: ServersSnapshot,
    pub diff: ConfigDiff,
}

/// Owns the filesystem watcher and the debounce task
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`. `initial` is the snapshot the gateway booted
    /// with; the first emitted change diffs against it.
    pub fn spawn(
        path: &Path,
        initial: ServersSnapshot,
    ) -> Result<(Self, mpsc::Receiver<ConfigChange>)> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let (change_tx, change_rx) = mpsc::channel::<ConfigChange>(16);

        let config_path: PathBuf = path.to_path_buf();
        let watch_target = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = config_path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let relevant = match &file_name {
                        Some(name) => event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(name.as_os_str())),
                        None => true,
                    };
                    if relevant {
                        let _ = raw_tx.send(());
                    }
                }
                Err(e) => warn!("Config watch error: {}", e),
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create config watcher: {}", e)))?;

        watcher
            .watch(&watch_target, RecursiveMode::NonRecursive)
            .map_err(|e| {
                GatewayError::config(format!(
                    "Failed to watch '{}': {}",
                    watch_target.display(),
                    e
                ))
            })?;

        info!("Watching config file '{}' for changes", config_path.display());

        let task = tokio::spawn(async move {
            let mut current = initial;
            while raw_rx.recv().await.is_some() {
                // Collapse the burst: keep draining until the window stays quiet
                loop {
                    match tokio::time::timeout(DEBOUNCE_WINDOW, raw_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                let snapshot = match load_servers_config(&config_path) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!("Config reload failed, treating as empty server set: {}", e);
                        ServersSnapshot::new()
                    }
                };

                let diff = diff_snapshots(&current, &snapshot);
                if diff.is_empty() {
                    debug!("Config file event produced no effective change");
                    continue;
                }

                info!(
                    "Config reloaded: {} added, {} removed, {} changed",
                    diff.added.len(),
                    diff.removed.len(),
                    diff.changed.len()
                );
                current = snapshot.clone();
                if change_tx.send(ConfigChange { snapshot, diff }).await.is_err() {
                    return;
                }
            }
        });

        Ok((
            Self {
                _watcher: watcher,
                task,
            },
            change_rx,
        ))
    }

    /// Stop the watcher and its debounce task
    pub fn shutdown(self) {
        self.task.abort();
    }
}
