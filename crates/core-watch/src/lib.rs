//! Filesystem watching for hot reload.
//!
//! One [`Watcher`] observes a root directory (scripts or viewdefs) plus the
//! target directories of any symlinks sitting directly under the root. File
//! events accumulate in a pending map and a short ticker flushes entries
//! older than the debounce delay into one reload per path, delivered to a
//! [`ReloadSink`].
//!
//! Reload resolution: an event directly under the root reloads that file; an
//! event inside a symlink target directory reloads through the symlink path,
//! so module tracking keys stay stable across symlinked layouts.
//!
//! All watcher state lives on the worker thread that consumes the event
//! channel; `stop` closes the done channel and drops the OS watch handle.
//! OS-level errors are logged and watching continues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error("watcher thread failed to start: {0}")]
    Spawn(std::io::Error),
}

/// Receiver of debounced reload requests. Called on the watcher thread with
/// the logical path (through the symlink when the edit happened in a target
/// directory).
pub trait ReloadSink: Send + 'static {
    fn reload(&self, path: &Path);
}

impl<F: Fn(&Path) + Send + 'static> ReloadSink for F {
    fn reload(&self, path: &Path) {
        self(path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Age a pending entry must reach before it flushes.
    pub debounce: Duration,
    /// Flush ticker period.
    pub tick: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            tick: Duration::from_millis(50),
        }
    }
}

/// Handle to a running watcher. Stopping (or dropping) closes the done
/// channel; the worker drops the OS watch handle on exit.
pub struct Watcher {
    done_tx: Option<Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Watcher {
    pub fn spawn(
        root: impl Into<PathBuf>,
        config: WatchConfig,
        sink: Box<dyn ReloadSink>,
    ) -> Result<Self, WatchError> {
        let root = root.into();
        let (event_tx, event_rx) = unbounded();
        let os_watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = event_tx.send(res);
            })?;
        let (done_tx, done_rx) = bounded(0);
        let mut state = State {
            root: root.clone(),
            os_watcher,
            config,
            sink,
            symlink_targets: HashMap::new(),
            watched_dirs: HashMap::new(),
            pending: HashMap::new(),
        };
        state.acquire_dir(&root)?;
        state.rescan_symlinks();
        let handle = std::thread::Builder::new()
            .name("weft-watch".into())
            .spawn(move || state.run(event_rx, done_rx))
            .map_err(WatchError::Spawn)?;
        info!(target: "watch", root = %root.display(), "watcher_started");
        Ok(Self {
            done_tx: Some(done_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.done_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

struct State {
    root: PathBuf,
    os_watcher: RecommendedWatcher,
    config: WatchConfig,
    sink: Box<dyn ReloadSink>,
    /// Symlink file directly under the root → its resolved target file.
    symlink_targets: HashMap<PathBuf, PathBuf>,
    /// Reference-counted watched directories; the root is always held.
    watched_dirs: HashMap<PathBuf, usize>,
    /// Event path → last time an event touched it.
    pending: HashMap<PathBuf, Instant>,
}

impl State {
    fn run(mut self, events: Receiver<notify::Result<notify::Event>>, done: Receiver<()>) {
        loop {
            select! {
                recv(events) -> msg => match msg {
                    Ok(Ok(event)) => self.handle_event(event),
                    Ok(Err(err)) => {
                        // OS watch hiccups never kill the watcher.
                        warn!(target: "watch", %err, "os_watch_error");
                    }
                    Err(_) => break,
                },
                recv(done) -> _ => break,
                default(self.config.tick) => {}
            }
            self.flush_due();
        }
        debug!(target: "watch", root = %self.root.display(), "watcher_stopped");
    }

    fn handle_event(&mut self, event: notify::Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let now = Instant::now();
        let mut rescan = false;
        for path in event.paths {
            if path.parent() == Some(self.root.as_path()) {
                // A direct child changed; symlinks may have come or gone.
                rescan = true;
            }
            if path.is_dir() {
                continue;
            }
            self.pending.insert(path, now);
        }
        if rescan {
            self.rescan_symlinks();
        }
    }

    fn flush_due(&mut self) {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.config.debounce)
            .map(|(p, _)| p.clone())
            .collect();
        for path in due {
            self.pending.remove(&path);
            if let Some(logical) = self.resolve_reload(&path) {
                debug!(target: "watch", path = %logical.display(), "reload_dispatch");
                self.sink.reload(&logical);
            }
        }
    }

    /// Decide which path a raw event reloads: the file itself when it sits
    /// under the root, otherwise the symlink pointing at the changed
    /// basename in its target directory.
    fn resolve_reload(&self, path: &Path) -> Option<PathBuf> {
        if path.parent() == Some(self.root.as_path()) {
            return Some(path.to_path_buf());
        }
        self.symlink_targets
            .iter()
            .find(|(_, target)| {
                *target == path
                    || (target.parent() == path.parent()
                        && target.file_name() == path.file_name())
            })
            .map(|(symlink, _)| symlink.clone())
    }

    /// Reconcile the symlink map with the root directory: resolve every
    /// direct-child symlink, watch its target's parent directory, and
    /// release watches whose symlink went away or moved.
    fn rescan_symlinks(&mut self) {
        let mut current: HashMap<PathBuf, PathBuf> = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_symlink = std::fs::symlink_metadata(&path)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false);
                if !is_symlink {
                    continue;
                }
                match std::fs::canonicalize(&path) {
                    Ok(target) if target.is_file() => {
                        current.insert(path, target);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "watch", path = %path.display(), %err, "symlink_resolve_failed");
                    }
                }
            }
        }

        let old = std::mem::take(&mut self.symlink_targets);
        for (symlink, target) in &current {
            let target_dir = target.parent().map(Path::to_path_buf);
            let unchanged = old.get(symlink) == Some(target);
            if unchanged {
                continue;
            }
            if let Some(dir) = target_dir
                && let Err(err) = self.acquire_dir(&dir)
            {
                warn!(target: "watch", dir = %dir.display(), %err, "watch_dir_failed");
            }
            debug!(
                target: "watch",
                symlink = %symlink.display(),
                dest = %target.display(),
                "symlink_tracked"
            );
        }
        // Symlinks that disappeared or retargeted release their old watch.
        for (symlink, target) in old {
            if current.get(&symlink) == Some(&target) {
                continue;
            }
            if let Some(dir) = target.parent() {
                self.release_dir(&dir.to_path_buf());
            }
        }
        self.symlink_targets = current;
    }

    fn acquire_dir(&mut self, dir: &Path) -> Result<(), notify::Error> {
        let count = self.watched_dirs.entry(dir.to_path_buf()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.os_watcher.watch(dir, RecursiveMode::NonRecursive)?;
            debug!(target: "watch", dir = %dir.display(), "dir_watched");
        }
        Ok(())
    }

    fn release_dir(&mut self, dir: &PathBuf) {
        let Some(count) = self.watched_dirs.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watched_dirs.remove(dir);
            if let Err(err) = self.os_watcher.unwatch(dir) {
                warn!(target: "watch", dir = %dir.display(), %err, "unwatch_failed");
            } else {
                debug!(target: "watch", dir = %dir.display(), "dir_unwatched");
            }
        }
    }
}
