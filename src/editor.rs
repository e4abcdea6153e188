//! Editor (C8): the two-way schema registry and the `List`/`Load`/`Save`
//! RPC surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::command;
use crate::error::EditorError;
use crate::loader;
use crate::path_utils;
use crate::schema::JSONSchema;
use crate::watch::WatcherClient;
use crate::worker::{Request, RequestWorker};

/// One entry of `List`'s response.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSummary {
    pub title: String,
    pub description: String,
    pub config_path: String,
    pub schema_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub title_translations: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub description_translations: HashMap<String, String>,
}

/// Response to `Load`.
#[derive(Debug, Clone, Serialize)]
pub struct LoadResponse {
    pub config_path: String,
    pub content: Value,
    pub schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
}

/// Response to `Save`.
#[derive(Debug, Clone, Serialize)]
pub struct SaveResponse {
    pub path: String,
}

struct Registry {
    by_schema_path: HashMap<String, Arc<JSONSchema>>,
    by_config_path: HashMap<String, Vec<Arc<JSONSchema>>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            by_schema_path: HashMap::new(),
            by_config_path: HashMap::new(),
        }
    }

    fn locate(&self, path: &str) -> Option<Arc<JSONSchema>> {
        if let Some(schema) = self.by_schema_path.get(path) {
            return Some(Arc::clone(schema));
        }
        self.by_config_path.get(path)?.first().cloned()
    }

    fn remove_from_config_index(&mut self, schema: &Arc<JSONSchema>) {
        if let Some(list) = self.by_config_path.get_mut(schema.config_path()) {
            list.retain(|s| !Arc::ptr_eq(s, schema));
        }
    }
}

struct Inner {
    root: PathBuf,
    registry: Mutex<Registry>,
    worker: RequestWorker,
}

/// The schema registry and RPC surface. Cheap to clone: internally an
/// `Arc`, so a clone can be handed to a directory-watcher adapter while the
/// caller keeps its own handle.
#[derive(Clone)]
pub struct Editor(Arc<Inner>);

impl Editor {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = path_utils::absolute(root.as_ref())?;
        Ok(Self(Arc::new(Inner {
            root,
            registry: Mutex::new(Registry::new()),
            worker: RequestWorker::start(),
        })))
    }

    /// Returns a watcher-facing adapter that dispatches discovered schema
    /// files into this registry. The Editor itself does not implement
    /// [`WatcherClient`] to keep the RPC surface free of watcher plumbing.
    pub fn watcher_client(&self) -> Arc<dyn WatcherClient> {
        Arc::new(EditorWatchAdapter(self.clone()))
    }

    /// Constructs a [`JSONSchema`] for `physical_path` and registers it,
    /// replacing any prior schema registered at the same schema path.
    pub fn load_schema(&self, physical_path: &Path) {
        let schema = match JSONSchema::new_with_root(physical_path, &self.0.root) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(path = %physical_path.display(), error = %e, "schema load failed; skipping");
                return;
            }
        };

        let mut registry = self.0.registry.lock().unwrap();
        if let Some(prior) = registry.by_schema_path.remove(schema.schema_path()) {
            prior.stop_watching_dependent_files();
            registry.remove_from_config_index(&prior);
        }
        registry
            .by_config_path
            .entry(schema.config_path().to_string())
            .or_default()
            .push(Arc::clone(&schema));
        registry
            .by_schema_path
            .insert(schema.schema_path().to_string(), schema);
    }

    /// Unregisters whatever schema is registered at `physical_path`, if any.
    pub fn remove_schema(&self, physical_path: &Path) {
        let Ok(virtual_path) = path_utils::path_from_root(&self.0.root, physical_path) else {
            return;
        };
        let mut registry = self.0.registry.lock().unwrap();
        let Some(schema) = registry.by_schema_path.remove(&virtual_path) else {
            return;
        };
        let had_config_entry = registry
            .by_config_path
            .get(schema.config_path())
            .is_some_and(|list| list.iter().any(|s| Arc::ptr_eq(s, &schema)));
        debug_assert!(
            had_config_entry,
            "schema present in schema-path index but absent from config-path index"
        );
        registry.remove_from_config_index(&schema);
        schema.stop_watching_dependent_files();
    }

    /// `List` RPC: every non-hidden schema, ordered by `(configPath, schemaPath)`.
    pub fn list(&self) -> Vec<SchemaSummary> {
        let registry = self.0.registry.lock().unwrap();
        let mut summaries: Vec<SchemaSummary> = registry
            .by_schema_path
            .values()
            .filter(|s| !s.hide_from_list())
            .map(|s| SchemaSummary {
                title: s.title().to_string(),
                description: s.description().to_string(),
                config_path: s.config_path().to_string(),
                schema_path: s.schema_path().to_string(),
                editor: s.editor_hint().map(str::to_string),
                title_translations: s.props().title_translations.clone(),
                description_translations: s.props().description_translations.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| (&a.config_path, &a.schema_path).cmp(&(&b.config_path, &b.schema_path)));
        summaries
    }

    /// `Load` RPC.
    pub fn load(&self, path: &str) -> Result<LoadResponse, EditorError> {
        // Held for the whole method, not just `locate`: this serializes Load
        // against concurrent Save (and against registry mutation) so a read
        // never races a write to the same on-disk file.
        let registry = self.0.registry.lock().unwrap();
        let schema = registry.locate(path).ok_or_else(EditorError::file_not_found)?;

        let (content, stderr) =
            loader::load_config_bytes(schema.physical_config_path(), schema.to_json_command())
                .map_err(|e| {
                    warn!(path = %schema.physical_config_path().display(), error = %e, "load failed");
                    EditorError::invalid_config()
                })?;
        log_stderr(&stderr);

        if schema.should_validate() {
            let result = schema.validate_content(&content).map_err(|e| {
                error!(error = %e, "validator compile failed");
                EditorError::invalid_config()
            })?;
            if !result.valid {
                for message in &result.errors {
                    warn!(message, "validation error");
                }
                return Err(EditorError::invalid_config());
            }
        }

        let document: Value = serde_json::from_slice(&content).map_err(|_| EditorError::invalid_config())?;
        let preprocessed = fix_format_props(&schema.get_preprocessed());

        Ok(LoadResponse {
            config_path: schema.config_path().to_string(),
            content: document,
            schema: preprocessed,
            editor: schema.editor_hint().map(str::to_string),
        })
    }

    /// `Save` RPC.
    pub fn save(&self, path: &str, content: &[u8]) -> Result<SaveResponse, EditorError> {
        // Held end-to-end (validation, the external `fromJSON` run, the file
        // write, and the worker enqueues): this gives concurrent Saves to a
        // shared configPath a total order, and matches it to the enqueue
        // order the worker executes side effects in.
        let registry = self.0.registry.lock().unwrap();
        let schema = registry.locate(path).ok_or_else(EditorError::file_not_found)?;

        if schema.should_validate() {
            let result = schema.validate_content(content).map_err(|e| {
                error!(error = %e, "validator compile failed");
                EditorError::invalid_config()
            })?;
            if !result.valid {
                for message in &result.errors {
                    warn!(message, "validation error");
                }
                return Err(EditorError::invalid_config());
            }
        }

        let document: Value =
            serde_json::from_slice(content).map_err(|_| EditorError::invalid_config())?;

        let bytes = if let Some(argv) = schema.from_json_command() {
            let output = command::ext_preprocess(argv, content).map_err(|e| {
                warn!(error = %e, "fromJSON command failed");
                EditorError::write()
            })?;
            log_stderr(&output.stderr);
            output.stdout
        } else {
            reindent(&document)
        };

        write_with_permissive_mode(schema.physical_config_path(), &bytes)
            .map_err(|_| EditorError::write())?;

        if schema.restart_delay_ms() > 0 {
            self.0.worker.enqueue(Request::Sleep {
                delay_ms: schema.restart_delay_ms(),
            });
        } else {
            self.0.worker.enqueue(Request::Sync {
                path: schema.physical_config_path().to_path_buf(),
            });
        }
        for service in schema.services() {
            self.0.worker.enqueue(Request::Restart {
                service: service.clone(),
            });
        }

        Ok(SaveResponse {
            path: path.to_string(),
        })
    }
}

struct EditorWatchAdapter(Editor);

impl WatcherClient for EditorWatchAdapter {
    fn load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.load_schema(path);
        Ok(())
    }

    fn live_load_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.load_schema(path);
        Ok(())
    }

    fn live_remove_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.remove_schema(path);
        Ok(())
    }
}

/// Recursively renames `_format` keys to `format`. Authoring convention uses
/// `_format` so authors don't confuse the validator with editor-specific
/// format values; the client expects `format`.
fn fix_format_props(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                let renamed = if key == "_format" { "format".to_string() } else { key.clone() };
                out.insert(renamed, fix_format_props(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(fix_format_props).collect()),
        other => other.clone(),
    }
}

fn reindent(document: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    document
        .serialize(&mut serializer)
        .expect("serializing a parsed Value cannot fail");
    buf
}

fn write_with_permissive_mode(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

fn log_stderr(stderr: &[u8]) {
    if stderr.is_empty() {
        return;
    }
    for line in String::from_utf8_lossy(stderr).lines() {
        warn!(line, "preprocessor stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, body: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn list_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("sample.schema.json");
        write_file(
            &schema_path,
            r#"{
                "title": "Example Config",
                "description": "Just an example",
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
                "configFile": {"path": "/sample.json"}
            }"#,
        );
        write_file(&dir.path().join("sample.json"), r#"{"name":"x"}"#);

        let editor = Editor::new(dir.path()).unwrap();
        editor.load_schema(&schema_path);

        let listing = editor.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].config_path, "/sample.json");
        assert_eq!(listing[0].schema_path, "/sample.schema.json");

        let loaded = editor.load("/sample.json").unwrap();
        assert_eq!(loaded.content["name"], "x");

        editor.save("/sample.json", br#"{"name":"updated"}"#).unwrap();
        let reloaded = editor.load("/sample.json").unwrap();
        assert_eq!(reloaded.content["name"], "updated");
    }

    #[test]
    fn save_rejects_invalid_payload() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("sample.schema.json");
        write_file(
            &schema_path,
            r#"{
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
                "configFile": {"path": "/sample.json"}
            }"#,
        );
        write_file(&dir.path().join("sample.json"), r#"{"name":"x"}"#);

        let editor = Editor::new(dir.path()).unwrap();
        editor.load_schema(&schema_path);

        let err = editor.save("/sample.json", br#"{"wtf":100}"#).unwrap_err();
        assert_eq!(err.code(), 1006);
    }

    #[test]
    fn load_unknown_path_fails_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let editor = Editor::new(dir.path()).unwrap();
        let err = editor.load("/nope.json").unwrap_err();
        assert_eq!(err.code(), 1003);
    }

    #[test]
    fn fix_format_props_renames_nested_keys() {
        let input = serde_json::json!({"a": {"_format": "table", "items": [{"_format": "x"}]}});
        let fixed = fix_format_props(&input);
        assert_eq!(fixed["a"]["format"], "table");
        assert_eq!(fixed["a"]["items"][0]["format"], "x");
    }
}
