//! Hot reload of the tunnels file.
//!
//! When the file changes on disk the in-memory store is reloaded and every
//! live session is re-validated at once, so renamed or deleted tunnels stop
//! being served without waiting for the next periodic check.

use crate::lifecycle::Lifecycle;
use crate::store::MemoryStore;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Quiet period after the last change before reloading.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watch the store's tunnels file until the returned task is aborted.
///
/// The parent directory is watched rather than the file itself so that
/// editors which replace the file by renaming keep triggering reloads.
pub fn start_watcher(
    store: Arc<MemoryStore>,
    lifecycle: Arc<Lifecycle>,
    debounce: Duration,
) -> Result<tokio::task::JoinHandle<()>, notify::Error> {
    let Some(path) = store.path().map(Path::to_path_buf) else {
        info!("No tunnels file configured for hot reload");
        return Ok(tokio::spawn(async {}));
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::channel::<()>(16);
    let file_name = path.file_name().map(|n| n.to_os_string());
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant {
                    // Full channel means a reload is already pending.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => debug!("File watch error: {}", e),
        },
        Config::default(),
    )?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for changes", path.display());

    Ok(tokio::spawn(async move {
        // The watcher stops when dropped, so it lives as long as the task.
        let _watcher = watcher;
        while rx.recv().await.is_some() {
            // Debounce: wait until the burst of events is over.
            loop {
                match tokio::time::timeout(debounce, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            match store.reload() {
                Ok(Some(count)) => {
                    info!("Tunnels file reloaded: {} tunnels", count);
                    lifecycle.invalidate();
                }
                Ok(None) => debug!("Tunnels file unchanged, skipping reload"),
                Err(e) => warn!("Keeping previous tunnels, reload failed: {}", e),
            }
        }
        error!("Tunnels file watcher stopped");
    }))
}
