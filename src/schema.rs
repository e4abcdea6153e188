//! JSONSchema object (C7): parses an authored schema, holds its properties,
//! and caches the preprocessed tree and compiled validator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::enum_loader::EnumLoader;
use crate::loader;
use crate::patch_loader::PatchLoader;
use crate::path_utils::{fake_root_path, path_from_root, PathError};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file '{path}': {reason}")]
    FileRead { path: String, reason: String },
    #[error("failed to parse schema from '{path}': {reason}")]
    ParseError { path: String, reason: String },
    #[error("schema at '{path}' is missing a configFile.path")]
    MissingConfigFile { path: String },
    #[error("schema at '{path}' has an invalid configFile.path: {reason}")]
    InvalidConfigPath { path: String, reason: String },
    #[error("failed to resolve schema path: {0}")]
    Path(#[from] PathError),
    #[error("failed to compile schema '{path}': {reason}")]
    CompileError { path: String, reason: String },
}

/// Result of validating a document against a compiled schema.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Schema metadata exposed via `List`/`Load`.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaProps {
    pub title: String,
    pub description: String,
    pub config_path: String,
    pub schema_path: String,
    #[serde(skip)]
    pub physical_config_path: PathBuf,
    #[serde(skip)]
    pub from_json_command: Option<Vec<String>>,
    #[serde(skip)]
    pub to_json_command: Option<Vec<String>>,
    pub services: Vec<String>,
    pub restart_delay_ms: u64,
    pub should_validate: bool,
    pub hide_from_list: bool,
    pub editor: Option<String>,
    pub title_translations: HashMap<String, String>,
    pub description_translations: HashMap<String, String>,
}

struct Cache {
    parsed: Value,
    preprocessed: Option<Value>,
    compiled: Option<Arc<jsonschema::Validator>>,
}

/// One authored `*.schema.json` file: its properties, its cached
/// preprocessed tree, and its compiled validator. Owns an [`EnumLoader`] and
/// a [`PatchLoader`], both of which must be stopped before this value is
/// dropped from the registry.
pub struct JSONSchema {
    content: Vec<u8>,
    cache: Mutex<Cache>,
    props: SchemaProps,
    enum_loader: EnumLoader,
    patch_loader: PatchLoader,
}

impl JSONSchema {
    /// Loads and parses `schema_path` (physical path), rooting virtual path
    /// resolution at `root`.
    pub fn new_with_root(schema_path: &Path, root: &Path) -> Result<Self, SchemaError> {
        let (content, _stderr) =
            loader::load_config_bytes(schema_path, None).map_err(|e| SchemaError::FileRead {
                path: schema_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let raw: Value = serde_json::from_slice(&content).map_err(|e| SchemaError::ParseError {
            path: schema_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let obj = raw.as_object().ok_or_else(|| SchemaError::ParseError {
            path: schema_path.display().to_string(),
            reason: "schema document is not a JSON object".to_string(),
        })?;

        let config_file = obj
            .get("configFile")
            .and_then(|v| v.as_object())
            .ok_or_else(|| SchemaError::MissingConfigFile {
                path: schema_path.display().to_string(),
            })?;
        let raw_config_path = config_file
            .get("path")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SchemaError::MissingConfigFile {
                path: schema_path.display().to_string(),
            })?;

        let (physical_config_path, config_path) = fake_root_path(root, raw_config_path)
            .map_err(|e| SchemaError::InvalidConfigPath {
                path: schema_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let from_json_command = extract_string_or_string_list(config_file.get("fromJSON"));
        let to_json_command = extract_string_or_string_list(config_file.get("toJSON"));
        let services = extract_string_or_string_list(config_file.get("service")).unwrap_or_default();
        let restart_delay_ms = config_file
            .get("restartDelayMS")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let should_validate = config_file
            .get("validate")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let hide_from_list = config_file
            .get("hide")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let editor = config_file
            .get("editor")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let schema_path_from_root = path_from_root(root, schema_path)?;

        let title = obj.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let (title_translations, description_translations) =
            extract_translations(obj.get("translations"), &title, &description);

        let props = SchemaProps {
            title,
            description,
            config_path,
            schema_path: schema_path_from_root,
            physical_config_path,
            from_json_command,
            to_json_command,
            services,
            restart_delay_ms,
            should_validate,
            hide_from_list,
            editor,
            title_translations,
            description_translations,
        };

        Ok(Self {
            content,
            cache: Mutex::new(Cache {
                parsed: raw,
                preprocessed: None,
                compiled: None,
            }),
            props,
            enum_loader: EnumLoader::new(root.to_path_buf()),
            patch_loader: PatchLoader::new(schema_path),
        })
    }

    pub fn props(&self) -> &SchemaProps {
        &self.props
    }

    pub fn title(&self) -> &str {
        &self.props.title
    }
    pub fn description(&self) -> &str {
        &self.props.description
    }
    pub fn config_path(&self) -> &str {
        &self.props.config_path
    }
    pub fn schema_path(&self) -> &str {
        &self.props.schema_path
    }
    pub fn physical_config_path(&self) -> &Path {
        &self.props.physical_config_path
    }
    pub fn from_json_command(&self) -> Option<&[String]> {
        self.props.from_json_command.as_deref()
    }
    pub fn to_json_command(&self) -> Option<&[String]> {
        self.props.to_json_command.as_deref()
    }
    pub fn services(&self) -> &[String] {
        &self.props.services
    }
    pub fn restart_delay_ms(&self) -> u64 {
        self.props.restart_delay_ms
    }
    pub fn should_validate(&self) -> bool {
        self.props.should_validate
    }
    pub fn hide_from_list(&self) -> bool {
        self.props.hide_from_list
    }
    pub fn editor_hint(&self) -> Option<&str> {
        self.props.editor.as_deref()
    }

    /// Returns the validator-ready tree: patched, then enum/device-definition
    /// expanded. Recomputed iff the patch loader or enum loader is dirty.
    pub fn get_preprocessed(&self) -> Value {
        let mut cache = self.cache.lock().unwrap();

        if self.patch_loader.is_dirty() {
            let patched = self.patch_loader.patch(&self.content);
            if let Ok(value) = serde_json::from_slice::<Value>(&patched) {
                cache.parsed = value;
                cache.preprocessed = None;
                cache.compiled = None;
            }
        }

        if cache.preprocessed.is_none() || self.enum_loader.is_dirty() {
            let preprocessed = self.enum_loader.preprocess(&cache.parsed);
            cache.preprocessed = Some(preprocessed);
            cache.compiled = None;
        }

        cache.preprocessed.clone().unwrap_or(Value::Null)
    }

    /// Returns the cached compiled validator, recompiling from
    /// [`Self::get_preprocessed`] iff either loader is dirty or nothing is
    /// cached yet.
    pub fn get_schema(&self) -> Result<Arc<jsonschema::Validator>, SchemaError> {
        let needs_recompile = {
            let cache = self.cache.lock().unwrap();
            cache.compiled.is_none() || self.patch_loader.is_dirty() || self.enum_loader.is_dirty()
        };

        if needs_recompile {
            let preprocessed = self.get_preprocessed();
            let compiled = jsonschema::options()
                .build(&preprocessed)
                .map_err(|e| SchemaError::CompileError {
                    path: self.props.schema_path.clone(),
                    reason: e.to_string(),
                })?;
            let compiled = Arc::new(compiled);
            self.cache.lock().unwrap().compiled = Some(Arc::clone(&compiled));
            Ok(compiled)
        } else {
            Ok(Arc::clone(self.cache.lock().unwrap().compiled.as_ref().unwrap()))
        }
    }

    pub fn validate_content(&self, bytes: &[u8]) -> Result<ValidationResult, SchemaError> {
        let validator = self.get_schema()?;
        let document: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                return Ok(ValidationResult {
                    valid: false,
                    errors: vec![e.to_string()],
                });
            }
        };

        let errors: Vec<String> = validator.iter_errors(&document).map(|e| e.to_string()).collect();
        Ok(ValidationResult {
            valid: errors.is_empty(),
            errors,
        })
    }

    pub fn validate_file(&self, path: &Path) -> Result<ValidationResult, SchemaError> {
        let (content, _stderr) =
            loader::load_config_bytes(path, None).map_err(|e| SchemaError::FileRead {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        self.validate_content(&content)
    }

    /// Stops the enum loader's and patch loader's directory watchers. Must
    /// be called before this value is dropped from the registry.
    pub fn stop_watching_dependent_files(&self) {
        self.enum_loader.stop_watching();
        self.patch_loader.stop();
    }
}

fn extract_string_or_string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(arr)) => {
            let items: Vec<String> = arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
            if items.is_empty() {
                None
            } else {
                Some(items)
            }
        }
        _ => None,
    }
}

fn extract_translations(
    translations: Option<&Value>,
    title: &str,
    description: &str,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut title_translations = HashMap::new();
    let mut description_translations = HashMap::new();

    let Some(by_lang) = translations.and_then(|v| v.as_object()) else {
        return (title_translations, description_translations);
    };

    for (lang, strings) in by_lang {
        let Some(strings) = strings.as_object() else {
            continue;
        };
        if let Some(translated) = strings.get(title).and_then(|v| v.as_str()) {
            if !title.is_empty() {
                title_translations.insert(lang.clone(), translated.to_string());
            }
        }
        if let Some(translated) = strings.get(description).and_then(|v| v.as_str()) {
            if !description.is_empty() {
                description_translations.insert(lang.clone(), translated.to_string());
            }
        }
    }

    (title_translations, description_translations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_schema(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_minimal_schema() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = write_schema(
            dir.path(),
            "sample.schema.json",
            r#"{
                "title": "Example Config",
                "description": "Just an example",
                "type": "object",
                "configFile": {"path": "/sample.json"}
            }"#,
        );

        let schema = JSONSchema::new_with_root(&schema_path, dir.path()).unwrap();
        assert_eq!(schema.title(), "Example Config");
        assert_eq!(schema.config_path(), "/sample.json");
        assert_eq!(schema.schema_path(), "/sample.schema.json");
        assert!(schema.should_validate());
        schema.stop_watching_dependent_files();
    }

    #[test]
    fn missing_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = write_schema(dir.path(), "bad.schema.json", r#"{"type":"object"}"#);
        let result = JSONSchema::new_with_root(&schema_path, dir.path());
        assert!(matches!(result, Err(SchemaError::MissingConfigFile { .. })));
    }

    #[test]
    fn validates_content_against_compiled_schema() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = write_schema(
            dir.path(),
            "sample.schema.json",
            r#"{
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
                "configFile": {"path": "/sample.json"}
            }"#,
        );
        let schema = JSONSchema::new_with_root(&schema_path, dir.path()).unwrap();

        let ok = schema.validate_content(br#"{"name":"x"}"#).unwrap();
        assert!(ok.valid);

        let bad = schema.validate_content(br#"{"wtf":100}"#).unwrap();
        assert!(!bad.valid);
        schema.stop_watching_dependent_files();
    }
}
