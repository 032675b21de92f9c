//! Filesystem watcher for the tasks tree, with last-write-wins debouncing

use crate::tasks::normalize_path;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Keeps the underlying `RecommendedWatcher` alive; dropping it stops watching.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Paths an event touches. Reads and metadata-free accesses are not changes.
fn touched_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Access(_) => Vec::new(),
        // Renames carry both the source and the destination
        _ => event.paths.iter().map(|p| normalize_path(p)).collect(),
    }
}

/// Watch `root` recursively and deliver one batch of touched paths per quiet
/// period of `debounce` to `reload_tx`.
///
/// The notify callback runs on its own thread and only forwards paths; the
/// debounce timer lives in a tokio task.
pub fn spawn_task_watcher(
    root: &Path,
    debounce: Duration,
    reload_tx: mpsc::Sender<BTreeSet<PathBuf>>,
) -> anyhow::Result<WatcherHandle> {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let paths = touched_paths(event);
                if !paths.is_empty() {
                    // The receiver is gone only during shutdown
                    let _ = event_tx.send(paths);
                }
            }
            Err(err) => {
                warn!(error = %err, "File watch error");
            }
        },
        Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    info!(root = %root.display(), debounce_ms = debounce.as_millis() as u64, "Watching tasks");

    tokio::spawn(debounce_paths(event_rx, debounce, reload_tx));

    Ok(WatcherHandle { _inner: watcher })
}

/// Accumulate paths until `delay` passes without a new event, then send the
/// batch. Every event re-arms the timer.
pub async fn debounce_paths(
    mut events: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    delay: Duration,
    batches: mpsc::Sender<BTreeSet<PathBuf>>,
) {
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();

    loop {
        if pending.is_empty() {
            match events.recv().await {
                Some(paths) => pending.extend(paths),
                None => break,
            }
            continue;
        }

        tokio::select! {
            received = events.recv() => match received {
                Some(paths) => pending.extend(paths),
                None => break,
            },
            _ = tokio::time::sleep(delay) => {
                let batch = std::mem::take(&mut pending);
                debug!(paths = batch.len(), "Debounced change batch");
                if batches.send(batch).await.is_err() {
                    warn!("Reload loop has gone away, stopping debouncer");
                    return;
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = batches.send(pending).await;
    }
    debug!("Debouncer stopped");
}
