//! Enum loader (C5): subconf enum expansion, device-definition expansion, and
//! the recursive preprocess walk that substitutes both into an authored
//! schema tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::loader;
use crate::path_utils::fake_root_path;
use crate::watch::{DirWatcher, WatcherClient};

const DEFAULT_PATTERN: &str = ".*";

/// One harvested device-definition template.
#[derive(Debug, Clone)]
struct DeviceDefinition {
    device_type: String,
    setup_schema: Option<Value>,
    channels: Vec<Value>,
}

struct State {
    enum_values: HashMap<String, HashMap<PathBuf, String>>,
    device_definition_values: HashMap<String, HashMap<PathBuf, DeviceDefinition>>,
    watchers: HashMap<String, DirWatcher>,
    dirty: bool,
}

/// Tracks subconf and device-definition directories referenced by a schema
/// and expands `enum`/`$_devicesDefinitions` nodes during preprocessing.
///
/// A single lock (`state`) guards `dirty`, the harvested value maps, and the
/// watcher map; `preprocess` runs entirely under that lock so that watcher
/// churn during a walk cannot produce a torn read.
pub struct EnumLoader {
    state: Arc<Mutex<State>>,
    root: PathBuf,
}

impl EnumLoader {
    pub fn new(root: PathBuf) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                enum_values: HashMap::new(),
                device_definition_values: HashMap::new(),
                watchers: HashMap::new(),
                dirty: false,
            })),
            root,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    /// Walks `tree`, substituting subconf `enum` nodes and
    /// `$_devicesDefinitions` array markers, then clears `dirty`.
    pub fn preprocess(&self, tree: &Value) -> Value {
        let mut state = self.state.lock().unwrap();
        let result = self.walk(&mut state, tree);
        state.dirty = false;
        result
    }

    fn walk(&self, state: &mut State, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, v) in map {
                    if key == "enum" {
                        if let Value::Object(enum_spec) = v {
                            if enum_spec.contains_key("directories") {
                                out.insert(
                                    key.clone(),
                                    Value::Array(
                                        self.expand_subconf_enum(state, enum_spec)
                                            .into_iter()
                                            .map(Value::String)
                                            .collect(),
                                    ),
                                );
                                continue;
                            }
                        }
                    }
                    out.insert(key.clone(), self.walk(state, v));
                }
                Value::Object(out)
            }
            Value::Array(arr) => {
                let mut out = Vec::with_capacity(arr.len());
                for element in arr {
                    if let Some(spec) = element
                        .as_object()
                        .filter(|m| m.len() == 1 && m.contains_key("$_devicesDefinitions"))
                        .and_then(|m| m.get("$_devicesDefinitions"))
                        .and_then(|v| v.as_object())
                    {
                        out.extend(self.expand_device_definitions(state, spec));
                    } else {
                        out.push(self.walk(state, element));
                    }
                }
                Value::Array(out)
            }
            other => other.clone(),
        }
    }

    fn expand_subconf_enum(&self, state: &mut State, spec: &Map<String, Value>) -> Vec<String> {
        let directories = spec
            .get("directories")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let pointer = spec.get("pointer").and_then(|v| v.as_str()).unwrap_or("");
        let pattern = spec
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PATTERN)
            .to_string();

        let mut values: Vec<String> = Vec::new();
        for dir_value in &directories {
            let Some(dir) = dir_value.as_str() else {
                continue;
            };
            let key = match self.ensure_enum_dir_loaded(state, dir, &pattern, pointer) {
                Some(key) => key,
                None => continue,
            };
            if let Some(harvested) = state.enum_values.get(&key) {
                values.extend(harvested.values().cloned());
            }
        }

        values.sort();
        values.dedup();
        if directories.is_empty() {
            warn!("subconf enum has no directories configured");
        }
        values
    }

    fn ensure_enum_dir_loaded(
        &self,
        state: &mut State,
        dir: &str,
        pattern: &str,
        pointer: &str,
    ) -> Option<String> {
        let key = subconf_key("enum", dir, pattern, pointer);
        if state.watchers.contains_key(&key) {
            return Some(key);
        }

        let (physical_dir, _) = match fake_root_path(&self.root, dir) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = dir, error = %e, "could not resolve subconf directory");
                return None;
            }
        };
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => {
                warn!(pattern = pattern, error = %e, "invalid subconf file pattern");
                return None;
            }
        };

        // Harvest the directory's current contents directly into `state`,
        // which this call already holds exclusively. Going through the
        // watcher's own initial-scan callback here would re-lock
        // `self.state` on a thread that already holds it.
        let harvested = state.enum_values.entry(key.clone()).or_default();
        for path in scan_matching_files(&physical_dir, &regex) {
            match harvest_enum_value(pointer, &path) {
                Ok(value) => {
                    harvested.insert(path, value);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "initial scan load failed"),
            }
        }

        let adapter: Arc<dyn WatcherClient> = Arc::new(EnumWatchAdapter {
            state: Arc::clone(&self.state),
            key: key.clone(),
            pointer: pointer.to_string(),
        });
        let mut watcher = DirWatcher::new(regex, adapter);
        if let Err(e) = watcher.watch_only(&physical_dir) {
            warn!(dir = %physical_dir.display(), error = %e, "failed to watch subconf directory");
            return None;
        }
        state.watchers.insert(key.clone(), watcher);
        Some(key)
    }

    fn expand_device_definitions(&self, state: &mut State, spec: &Map<String, Value>) -> Vec<Value> {
        let directories = spec
            .get("directories")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let pointers = spec.get("pointer").and_then(|v| v.as_array());
        let (dt_ptr, ss_ptr, ch_ptr) = match pointers {
            Some(p) if p.len() == 3 => (
                p[0].as_str().unwrap_or("").to_string(),
                p[1].as_str().unwrap_or("").to_string(),
                p[2].as_str().unwrap_or("").to_string(),
            ),
            _ => {
                warn!("$_devicesDefinitions requires exactly 3 pointers");
                return Vec::new();
            }
        };
        let pattern = spec
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PATTERN)
            .to_string();

        let mut definitions: Vec<DeviceDefinition> = Vec::new();
        let mut seen_types = std::collections::HashSet::new();
        for dir_value in &directories {
            let Some(dir) = dir_value.as_str() else {
                continue;
            };
            let key = match self.ensure_devdef_dir_loaded(
                state, dir, &pattern, &dt_ptr, &ss_ptr, &ch_ptr,
            ) {
                Some(key) => key,
                None => continue,
            };
            if let Some(harvested) = state.device_definition_values.get(&key) {
                let mut paths: Vec<&PathBuf> = harvested.keys().collect();
                paths.sort();
                for path in paths {
                    let def = &harvested[path];
                    if seen_types.insert(def.device_type.clone()) {
                        definitions.push(def.clone());
                    }
                }
            }
        }

        definitions.sort_by(|a, b| a.device_type.cmp(&b.device_type));
        definitions.iter().map(synthesize_device_schema).collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn ensure_devdef_dir_loaded(
        &self,
        state: &mut State,
        dir: &str,
        pattern: &str,
        dt_ptr: &str,
        ss_ptr: &str,
        ch_ptr: &str,
    ) -> Option<String> {
        let key = subconf_key(
            "devdef",
            dir,
            pattern,
            &format!("{dt_ptr}\0{ss_ptr}\0{ch_ptr}"),
        );
        if state.watchers.contains_key(&key) {
            return Some(key);
        }

        let (physical_dir, _) = match fake_root_path(&self.root, dir) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = dir, error = %e, "could not resolve device-definition directory");
                return None;
            }
        };
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => {
                warn!(pattern = pattern, error = %e, "invalid device-definition file pattern");
                return None;
            }
        };

        let harvested = state.device_definition_values.entry(key.clone()).or_default();
        for path in scan_matching_files(&physical_dir, &regex) {
            match harvest_device_definition(dt_ptr, ss_ptr, ch_ptr, &path) {
                Ok(def) => {
                    harvested.insert(path, def);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "initial scan load failed"),
            }
        }

        let adapter: Arc<dyn WatcherClient> = Arc::new(DeviceDefWatchAdapter {
            state: Arc::clone(&self.state),
            key: key.clone(),
            dt_ptr: dt_ptr.to_string(),
            ss_ptr: ss_ptr.to_string(),
            ch_ptr: ch_ptr.to_string(),
        });
        let mut watcher = DirWatcher::new(regex, adapter);
        if let Err(e) = watcher.watch_only(&physical_dir) {
            warn!(dir = %physical_dir.display(), error = %e, "failed to watch device-definition directory");
            return None;
        }
        state.watchers.insert(key.clone(), watcher);
        Some(key)
    }

    /// Stops every subconf/device-definition watcher owned by this loader.
    pub fn stop_watching(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, mut watcher) in state.watchers.drain() {
            watcher.stop();
        }
    }
}

fn subconf_key(kind: &str, dir: &str, pattern: &str, pointer: &str) -> String {
    format!("{kind}\0{dir}\0{pattern}\0{pointer}")
}

/// Lists `dir`'s files matching `pattern` (or returns `dir` itself if it is
/// a file), mirroring `DirWatcher`'s own scan so a caller can harvest a
/// directory's contents without going through the watcher's callback.
fn scan_matching_files(dir: &Path, pattern: &Regex) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return vec![dir.to_path_buf()];
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.is_match(name))
        })
        .collect()
}

fn harvest_enum_value(
    pointer: &str,
    path: &Path,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let (content, _stderr) = loader::load_config_bytes(path, None)?;
    let value: Value = serde_json::from_slice(&content)?;
    let target = value
        .pointer(pointer)
        .ok_or_else(|| format!("pointer '{pointer}' not found in {}", path.display()))?;
    let s = target
        .as_str()
        .ok_or_else(|| format!("pointer target in {} is not a string", path.display()))?;
    Ok(s.to_string())
}

struct EnumWatchAdapter {
    state: Arc<Mutex<State>>,
    key: String,
    pointer: String,
}

impl EnumWatchAdapter {
    fn harvest(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let value = harvest_enum_value(&self.pointer, path)?;
        let mut state = self.state.lock().unwrap();
        state
            .enum_values
            .entry(self.key.clone())
            .or_default()
            .insert(path.to_path_buf(), value);
        state.dirty = true;
        Ok(())
    }
}

impl WatcherClient for EnumWatchAdapter {
    fn load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.harvest(path)
    }

    fn live_load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.harvest(path)
    }

    fn live_remove_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut state = self.state.lock().unwrap();
        if let Some(map) = state.enum_values.get_mut(&self.key) {
            map.remove(path);
        }
        state.dirty = true;
        Ok(())
    }
}

fn harvest_device_definition(
    dt_ptr: &str,
    ss_ptr: &str,
    ch_ptr: &str,
    path: &Path,
) -> Result<DeviceDefinition, Box<dyn std::error::Error + Send + Sync>> {
    let (content, _stderr) = loader::load_config_bytes(path, None)?;
    let value: Value = serde_json::from_slice(&content)?;

    let device_type = value
        .pointer(dt_ptr)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("device type missing in {}", path.display()))?
        .to_string();
    let setup_schema = value.pointer(ss_ptr).cloned();
    let channels = value
        .pointer(ch_ptr)
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| format!("channels missing in {}", path.display()))?;

    Ok(DeviceDefinition {
        device_type,
        setup_schema,
        channels,
    })
}

struct DeviceDefWatchAdapter {
    state: Arc<Mutex<State>>,
    key: String,
    dt_ptr: String,
    ss_ptr: String,
    ch_ptr: String,
}

impl DeviceDefWatchAdapter {
    fn harvest(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let def = harvest_device_definition(&self.dt_ptr, &self.ss_ptr, &self.ch_ptr, path)?;
        let mut state = self.state.lock().unwrap();
        state
            .device_definition_values
            .entry(self.key.clone())
            .or_default()
            .insert(path.to_path_buf(), def);
        state.dirty = true;
        Ok(())
    }
}

impl WatcherClient for DeviceDefWatchAdapter {
    fn load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.harvest(path)
    }

    fn live_load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.harvest(path)
    }

    fn live_remove_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut state = self.state.lock().unwrap();
        if let Some(map) = state.device_definition_values.get_mut(&self.key) {
            map.remove(path);
        }
        state.dirty = true;
        Ok(())
    }
}

fn synthesize_device_schema(def: &DeviceDefinition) -> Value {
    let defaults: Vec<Value> = def
        .channels
        .iter()
        .map(|channel| {
            let mut default = Map::new();
            if let Some(name) = channel.get("name") {
                default.insert("hidden_name".to_string(), name.clone());
            }
            if let Some(interval) = channel.get("poll_interval") {
                default.insert("poll_interval".to_string(), interval.clone());
            }
            Value::Object(default)
        })
        .collect();

    let mut properties = Map::new();
    properties.insert(
        "device_type".to_string(),
        serde_json::json!({
            "type": "string",
            "enum": [def.device_type.clone()],
            "options": {"hidden": true},
            "propertyOrder": 5,
        }),
    );
    if let Some(setup_schema) = &def.setup_schema {
        properties.insert("setup".to_string(), setup_schema.clone());
    }
    properties.insert(
        "channels".to_string(),
        serde_json::json!({
            "type": "array",
            "_format": "table",
            "minItems": def.channels.len(),
            "items": {"$ref": "#/definitions/channelSettings"},
            "default": defaults,
            "options": {
                "disable_array_delete": true,
                "disable_array_reorder": true,
                "disable_array_add": true,
            },
            "propertyOrder": 9,
        }),
    );
    properties.insert(
        "custom_channels".to_string(),
        serde_json::json!({
            "type": "array",
            "items": {"$ref": "#/definitions/channel"},
            "propertyOrder": 10,
        }),
    );

    serde_json::json!({
        "type": "object",
        "title": def.device_type,
        "properties": properties,
        "required": ["device_type"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subconf_enum_expansion_sorts_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.conf"), r#"{"dev_type":"WB-MRM2"}"#).unwrap();
        std::fs::write(dir.path().join("b.conf"), r#"{"dev_type":"MSU21"}"#).unwrap();
        std::fs::write(dir.path().join("c.conf"), r#"{"dev_type":"MSU21"}"#).unwrap();
        std::fs::write(dir.path().join("skip.txt"), r#"{"dev_type":"Ignored"}"#).unwrap();

        let loader = EnumLoader::new(dir.path().to_path_buf());
        let tree = serde_json::json!({
            "enum": {
                "directories": ["/"],
                "pointer": "/dev_type",
                "pattern": r"^.*\.conf$"
            }
        });
        let result = loader.preprocess(&tree);
        assert_eq!(result["enum"], serde_json::json!(["MSU21", "WB-MRM2"]));
        loader.stop_watching();
    }

    #[test]
    fn empty_directories_yields_empty_enum() {
        let dir = tempfile::tempdir().unwrap();
        let loader = EnumLoader::new(dir.path().to_path_buf());
        let tree = serde_json::json!({"enum": {"directories": []}});
        let result = loader.preprocess(&tree);
        assert_eq!(result["enum"], serde_json::json!([]));
        loader.stop_watching();
    }

    #[test]
    fn device_definition_expansion_synthesizes_object_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("msu21.json"),
            serde_json::json!({
                "device_type": "MSU21",
                "device": {"channels": [{"name": "Relay 1"}, {"name": "Relay 2", "poll_interval": 50}]}
            })
            .to_string(),
        )
        .unwrap();

        let loader = EnumLoader::new(dir.path().to_path_buf());
        let tree = serde_json::json!([
            {"$_devicesDefinitions": {
                "directories": ["/"],
                "pointer": ["/device_type", "/setup_schema", "/device/channels"],
                "pattern": r"^.*\.json$"
            }}
        ]);
        let result = loader.preprocess(&tree);
        let arr = result.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["title"], "MSU21");
        assert_eq!(arr[0]["properties"]["channels"]["minItems"], 2);
        assert_eq!(
            arr[0]["properties"]["channels"]["default"][1]["poll_interval"],
            50
        );
        loader.stop_watching();
    }
}
