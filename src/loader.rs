//! Config byte loading: optional preprocessor pipe, then JSON-with-comments
//! stripping into strict JSON bytes (C3).

use std::path::Path;
use thiserror::Error;

use crate::command::{self, CommandError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open '{path}': {reason}")]
    Open { path: String, reason: String },
    #[error("preprocessor failed for '{path}': {source}")]
    Preprocess { path: String, source: CommandError },
    #[error("'{path}' is not valid JSON-with-comments: {reason}")]
    JsoncParse { path: String, reason: String },
}

/// Standard parse options for authored config/schema files: comments and
/// trailing commas are allowed, nothing else is relaxed.
fn parse_options() -> jsonc_parser::ParseOptions {
    jsonc_parser::ParseOptions {
        allow_comments: true,
        allow_trailing_commas: true,
        allow_loose_object_property_names: false,
        allow_single_quoted_strings: false,
        allow_hexadecimal_numbers: false,
        allow_missing_commas: false,
        allow_unary_plus_numbers: false,
    }
}

fn strip_jsonc(path: &str, source: &str) -> Result<Vec<u8>, ConfigError> {
    let ast = jsonc_parser::parse_to_ast(source, &Default::default(), &parse_options())
        .map_err(|e| ConfigError::JsoncParse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    let value: serde_json::Value = ast
        .value
        .ok_or_else(|| ConfigError::JsoncParse {
            path: path.to_string(),
            reason: "empty document".to_string(),
        })?
        .into();
    serde_json::to_vec(&value).map_err(|e| ConfigError::JsoncParse {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Opens `path`, optionally piping its bytes through `preprocess_cmd`
/// (`toJSON`-style argv), then strips JSON-with-comments into strict JSON
/// bytes. Returns the stripped content plus any preprocessor stderr for the
/// caller to log.
pub fn load_config_bytes(
    path: &Path,
    preprocess_cmd: Option<&[String]>,
) -> Result<(Vec<u8>, Vec<u8>), ConfigError> {
    let raw = std::fs::read(path).map_err(|e| ConfigError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let (json_input, stderr) = match preprocess_cmd {
        None => (raw, Vec::new()),
        Some(argv) => {
            let output =
                command::ext_preprocess(argv, &raw).map_err(|e| ConfigError::Preprocess {
                    path: path.display().to_string(),
                    source: e,
                })?;
            (output.stdout, output.stderr)
        }
    };

    let text = String::from_utf8_lossy(&json_input).into_owned();
    let content = strip_jsonc(&path.display().to_string(), &text)?;
    Ok((content, stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_plain_json() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"a": 1}}"#).unwrap();
        let (content, stderr) = load_config_bytes(f.path(), None).unwrap();
        assert!(stderr.is_empty());
        let value: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn strips_comments_and_trailing_commas() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{\n // comment\n \"a\": 1,\n}}\n").unwrap();
        let (content, _) = load_config_bytes(f.path(), None).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = load_config_bytes(Path::new("/nonexistent/path.json"), None);
        assert!(matches!(result, Err(ConfigError::Open { .. })));
    }
}
