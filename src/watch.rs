//! Directory-watch client adapter (C4): translates watcher callbacks into
//! loader/remover calls against whichever subsystem owns a given watch.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use regex::Regex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to construct watcher: {0}")]
    Construct(String),
    #[error("failed to watch '{path}': {reason}")]
    Watch { path: String, reason: String },
    #[error("failed to list directory '{path}': {reason}")]
    ListDir { path: String, reason: String },
}

/// Implemented by whichever subsystem (editor, enum loader, patch loader)
/// owns a given watch. `Editor` does not implement this directly; a small
/// adapter per subconf key / patch directory does, to keep the RPC surface
/// clean of watcher plumbing.
pub trait WatcherClient: Send + Sync {
    fn load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn live_load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn live_remove_file(
        &self,
        path: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Watches a directory for files matching a filename regex, calling the
/// client's `load_file` for the initial scan and `live_load_file`/
/// `live_remove_file` for subsequent changes.
pub struct DirWatcher {
    pattern: Regex,
    client: Arc<dyn WatcherClient>,
    watcher: Option<PollWatcher>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DirWatcher {
    pub fn new(pattern: Regex, client: Arc<dyn WatcherClient>) -> Self {
        Self {
            pattern,
            client,
            watcher: None,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Scans `dir` once for matching files (calling `load_file` on each),
    /// then begins watching it for live changes. If `dir` is itself a file,
    /// it is loaded directly and its parent directory is watched.
    pub fn load(&mut self, dir: &Path) -> Result<(), WatchError> {
        self.scan(dir)?;
        self.watch_only(dir)
    }

    /// Scans `dir` once, calling the client's `load_file` for each match (or
    /// for `dir` itself, if it is a file). A caller that has already
    /// harvested `dir`'s contents some other way (e.g. directly into state
    /// it holds under a lock `load_file` would otherwise re-enter) should
    /// skip this and call [`Self::watch_only`] instead.
    pub fn scan(&self, dir: &Path) -> Result<(), WatchError> {
        if !dir.is_dir() {
            self.dispatch_load(dir);
            return Ok(());
        }
        let entries = std::fs::read_dir(dir).map_err(|e| WatchError::ListDir {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if self.matches(&path) {
                self.dispatch_load(&path);
            }
        }
        Ok(())
    }

    /// Begins watching `dir` for live changes without an initial scan.
    pub fn watch_only(&mut self, dir: &Path) -> Result<(), WatchError> {
        let watch_dir = if dir.is_dir() {
            dir.to_path_buf()
        } else {
            dir.parent().unwrap_or(dir).to_path_buf()
        };

        let (tx, rx) = mpsc::channel::<Event>();
        let mut watcher = PollWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_millis(500)),
        )
        .map_err(|e| WatchError::Construct(e.to_string()))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Watch {
                path: watch_dir.display().to_string(),
                reason: e.to_string(),
            })?;

        let pattern = self.pattern.clone();
        let client = Arc::clone(&self.client);
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(event) => dispatch_event(&pattern, &client, &event),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        self.watcher = Some(watcher);
        self.handle = Some(handle);
        Ok(())
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.pattern.is_match(name))
    }

    fn dispatch_load(&self, path: &Path) {
        if let Err(e) = self.client.load_file(path) {
            warn!(path = %path.display(), error = %e, "initial scan load failed");
        }
    }

    /// Stops watching. Waits for the dispatch thread to exit before
    /// returning, matching the teardown sequence's "watcher waits for
    /// in-flight callbacks" requirement.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.watcher = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_event(pattern: &Regex, client: &Arc<dyn WatcherClient>, event: &Event) {
    for path in &event.paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !pattern.is_match(name) {
            continue;
        }
        let result = match event.kind {
            EventKind::Remove(_) => client.live_remove_file(path),
            EventKind::Create(_) | EventKind::Modify(_) => client.live_load_file(path),
            _ => continue,
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "watcher callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        loaded: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl WatcherClient for RecordingClient {
        fn load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.loaded
                .lock()
                .unwrap()
                .push(path.display().to_string());
            Ok(())
        }

        fn live_load_file(
            &self,
            path: &Path,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.loaded
                .lock()
                .unwrap()
                .push(path.display().to_string());
            Ok(())
        }

        fn live_remove_file(
            &self,
            path: &Path,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.removed
                .lock()
                .unwrap()
                .push(path.display().to_string());
            Ok(())
        }
    }

    #[test]
    fn initial_scan_loads_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.conf"), "{}").unwrap();
        std::fs::write(dir.path().join("b.txt"), "{}").unwrap();

        let client = Arc::new(RecordingClient::default());
        let mut watcher = DirWatcher::new(Regex::new(r"^.*\.conf$").unwrap(), client.clone());
        watcher.load(dir.path()).unwrap();

        let loaded = client.loaded.lock().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].ends_with("a.conf"));
        drop(loaded);
        watcher.stop();
    }
}
