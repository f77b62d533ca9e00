//! Filesystem watcher: translates notify events into the incremental
//! indexer's typed messages.
//!
//! Delivery is at-least-once; the indexer's debounce map coalesces
//! duplicates, so over-reporting here is harmless.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::Sender;

use crate::error::{CoreError, CoreResult};
use crate::incremental::IndexMessage;

pub struct WorkspaceWatcher {
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
}

/// Map one notify event to indexer messages (one per affected path).
fn messages_for(event: &Event) -> Vec<IndexMessage> {
    let make: fn(std::path::PathBuf) -> IndexMessage = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => IndexMessage::Reindex,
        EventKind::Remove(_) => IndexMessage::Remove,
        _ => return vec![],
    };
    event.paths.iter().cloned().map(make).collect()
}

impl WorkspaceWatcher {
    /// Watch `root` recursively, forwarding events into `tx`. Watcher
    /// errors are logged; the rest of the system keeps serving from the
    /// last-known index.
    pub fn start(root: &Path, tx: Sender<IndexMessage>) -> CoreResult<Self> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for msg in messages_for(&event) {
                        if tx.send(msg).is_err() {
                            // Indexer shut down; nothing left to notify.
                            return;
                        }
                    }
                }
                Err(err) => tracing::warn!(%err, "file watcher error"),
            }
        })
        .map_err(|e| CoreError::Unavailable(format!("file watcher: {e}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| CoreError::Unavailable(format!("file watcher: {e}")))?;

        tracing::info!(root = %root.display(), "watching workspace");
        Ok(Self { _watcher: watcher })
    }
}
