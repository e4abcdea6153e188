use thiserror::Error;

/// RPC-visible error carrying one of the stable numeric codes clients key off
/// of. Codes are part of the wire contract and must never be renumbered.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EditorError {
    code: i32,
    message: String,
}

impl EditorError {
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_path() -> Self {
        Self::new(1000, "Invalid path")
    }

    pub fn list_dir() -> Self {
        Self::new(1001, "Error listing the directory")
    }

    pub fn write() -> Self {
        Self::new(1002, "Error writing the file")
    }

    pub fn file_not_found() -> Self {
        Self::new(1003, "File not found")
    }

    pub fn remove() -> Self {
        Self::new(1004, "Error removing the file")
    }

    pub fn read() -> Self {
        Self::new(1005, "Error reading the file")
    }

    pub fn invalid_config() -> Self {
        Self::new(1006, "Invalid config file")
    }

    pub fn invalid_schema() -> Self {
        Self::new(1007, "Invalid config schema")
    }

    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
