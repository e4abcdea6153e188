//! Patch loader (C6): watches `<schemaBasename>.patch` files next to a
//! schema and applies JSON merge patches in lexicographic order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::loader;
use crate::watch::{DirWatcher, WatcherClient};

struct State {
    patch_paths: Vec<PathBuf>,
    dirty: bool,
    watcher: Option<DirWatcher>,
}

/// Tracks `<schemaBasename>.patch` sibling files and applies them, in
/// lexicographic path order, as JSON merge patches (RFC 7396).
pub struct PatchLoader {
    state: Arc<Mutex<State>>,
}

impl PatchLoader {
    /// `schema_path` is the physical path of the schema file this loader's
    /// patches apply to.
    pub fn new(schema_path: &Path) -> Self {
        let state = Arc::new(Mutex::new(State {
            patch_paths: Vec::new(),
            dirty: false,
            watcher: None,
        }));

        let Some(dir) = schema_path.parent() else {
            return Self { state };
        };
        let Some(basename) = schema_path.file_name().and_then(|n| n.to_str()) else {
            return Self { state };
        };
        let pattern = format!("^{}\\.patch$", regex::escape(basename));
        let regex = match Regex::new(&pattern) {
            Ok(r) => r,
            Err(e) => {
                warn!(pattern = pattern, error = %e, "invalid patch file pattern");
                return Self { state };
            }
        };

        let adapter: Arc<dyn WatcherClient> = Arc::new(PatchWatchAdapter {
            state: Arc::clone(&state),
        });
        let mut watcher = DirWatcher::new(regex, adapter);
        if let Err(e) = watcher.load(dir) {
            warn!(dir = %dir.display(), error = %e, "failed to watch patch directory");
        } else {
            state.lock().unwrap().watcher = Some(watcher);
        }

        Self { state }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    /// Applies every known patch, in order, to `bytes`. Patches that fail to
    /// open, parse, or apply are logged and skipped; the function always
    /// returns well-formed JSON bytes (the last successfully-patched state).
    pub fn patch(&self, bytes: &[u8]) -> Vec<u8> {
        let paths = {
            let mut state = self.state.lock().unwrap();
            state.dirty = false;
            state.patch_paths.clone()
        };

        let mut doc: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "schema content is not valid JSON; patches skipped");
                return bytes.to_vec();
            }
        };

        for path in &paths {
            let (content, _stderr) = match loader::load_config_bytes(path, None) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read patch file");
                    continue;
                }
            };
            let patch_value: Value = match serde_json::from_slice(&content) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not parse patch file");
                    continue;
                }
            };
            json_patch::merge(&mut doc, &patch_value);
        }

        serde_json::to_vec(&doc).unwrap_or_else(|_| bytes.to_vec())
    }

    pub fn stop(&self) {
        if let Some(mut watcher) = self.state.lock().unwrap().watcher.take() {
            watcher.stop();
        }
    }
}

struct PatchWatchAdapter {
    state: Arc<Mutex<State>>,
}

impl PatchWatchAdapter {
    fn insert(&self, path: &Path) {
        let mut state = self.state.lock().unwrap();
        if !state.patch_paths.contains(&path.to_path_buf()) {
            state.patch_paths.push(path.to_path_buf());
            state.patch_paths.sort();
        }
        state.dirty = true;
    }
}

impl WatcherClient for PatchWatchAdapter {
    fn load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.insert(path);
        Ok(())
    }

    fn live_load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.insert(path);
        Ok(())
    }

    fn live_remove_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut state = self.state.lock().unwrap();
        state.patch_paths.retain(|p| p != path);
        state.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_patches_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("sample.schema.json");
        std::fs::write(&schema_path, r#"{"title":"orig"}"#).unwrap();
        std::fs::write(
            dir.path().join("sample.schema.json.patch"),
            r#"{"title":"patched","extra":1}"#,
        )
        .unwrap();

        let loader = PatchLoader::new(&schema_path);
        let result = loader.patch(br#"{"title":"orig"}"#);
        let value: Value = serde_json::from_slice(&result).unwrap();
        assert_eq!(value["title"], "patched");
        assert_eq!(value["extra"], 1);
        loader.stop();
    }

    #[test]
    fn unreadable_patch_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("sample.schema.json");
        std::fs::write(&schema_path, r#"{"title":"orig"}"#).unwrap();
        std::fs::write(dir.path().join("sample.schema.json.patch"), "not json").unwrap();

        let loader = PatchLoader::new(&schema_path);
        let result = loader.patch(br#"{"title":"orig"}"#);
        let value: Value = serde_json::from_slice(&result).unwrap();
        assert_eq!(value["title"], "orig");
        loader.stop();
    }
}
