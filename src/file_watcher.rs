use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

/// Quiet period before a burst of changes is handed on.
const SETTLE: Duration = Duration::from_millis(250);

enum WatchMessage {
    Changed(String),
    Shutdown,
}

/// Watches the live scripts directory and reports which script files changed.
pub struct ScriptWatcher {
    watcher: Option<RecommendedWatcher>,
    tx: Sender<WatchMessage>,
    worker: Option<JoinHandle<()>>,
}

impl ScriptWatcher {
    /// `on_change` runs on a dedicated thread with a lowercased file name, once
    /// per file per burst of changes.
    pub fn start<F>(scripts_dir: &Path, on_change: F) -> notify::Result<Self>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded::<WatchMessage>();
        let dir = canonical(scripts_dir);
        let event_tx = tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    for file in changed_scripts(&event, &dir) {
                        let _ = event_tx.send(WatchMessage::Changed(file));
                    }
                }
                Err(e) => warn!("[Lua watcher] Watch error: {e}"),
            })?;
        watcher.watch(scripts_dir, RecursiveMode::NonRecursive)?;
        info!("[Lua watcher] Watching scripts: {}", scripts_dir.display());

        let worker = std::thread::Builder::new()
            .name("lua-script-watcher".to_string())
            .spawn(move || run_worker(rx, on_change))?;

        Ok(Self {
            watcher: Some(watcher),
            tx,
            worker: Some(worker),
        })
    }
}

impl Drop for ScriptWatcher {
    fn drop(&mut self) {
        self.watcher.take();
        let _ = self.tx.send(WatchMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[Lua watcher] Worker thread panicked");
            }
        }
    }
}

fn run_worker<F: FnMut(&str)>(rx: Receiver<WatchMessage>, mut on_change: F) {
    while let Ok(WatchMessage::Changed(first)) = rx.recv() {
        let mut pending = BTreeSet::from([first]);
        loop {
            match rx.recv_timeout(SETTLE) {
                Ok(WatchMessage::Changed(file)) => {
                    pending.insert(file);
                }
                Ok(WatchMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        for file in pending {
            debug!("[Lua watcher] Script changed: {file}");
            on_change(&file);
        }
    }
}

fn changed_scripts(event: &NotifyEvent, scripts_dir: &Path) -> Vec<String> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("lua"))
        .filter(|path| path.parent().map(canonical).as_deref() == Some(scripts_dir))
        .filter_map(|path| path.file_name().and_then(|s| s.to_str()).map(str::to_lowercase))
        .collect()
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
