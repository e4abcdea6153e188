//! Virtual/physical path mapping rooted at a configurable base (C1).

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path '{path}' is not inside root '{root}'")]
    NotRooted { path: String, root: String },
    #[error("failed to resolve path '{path}': {reason}")]
    Resolve { path: String, reason: String },
}

/// Returns the absolute-rooted virtual path of `p` inside `root`: the path
/// relative to `root`, prefixed with `/`.
pub fn path_from_root(root: &Path, p: &Path) -> Result<String, PathError> {
    let abs = absolute(p).map_err(|e| PathError::Resolve {
        path: p.display().to_string(),
        reason: e.to_string(),
    })?;
    let abs_root = absolute(root).map_err(|e| PathError::Resolve {
        path: root.display().to_string(),
        reason: e.to_string(),
    })?;
    let relative = abs.strip_prefix(&abs_root).map_err(|_| PathError::NotRooted {
        path: p.display().to_string(),
        root: root.display().to_string(),
    })?;
    Ok(format!("/{}", relative.to_string_lossy().replace('\\', "/")))
}

/// Strips all leading `/` from `p`, joins it to `root` to form the physical
/// path, then computes the virtual path of that physical path inside `root`.
///
/// Used when a schema declares an absolute-looking config path but the
/// service is rooted under a non-`/` base (testing, chroot-style operation).
pub fn fake_root_path(root: &Path, p: &str) -> Result<(PathBuf, String), PathError> {
    let stripped = p.trim_start_matches('/');
    let physical = root.join(stripped);
    let virtual_path = path_from_root(root, &physical)?;
    Ok((physical, virtual_path))
}

/// Lexically resolve `p` to an absolute path without requiring it to exist
/// (unlike `fs::canonicalize`). Relative paths are resolved against the
/// current working directory.
pub fn absolute(p: &Path) -> std::io::Result<PathBuf> {
    if p.is_absolute() {
        Ok(lexically_normalize(p))
    } else {
        let cwd = std::env::current_dir()?;
        Ok(lexically_normalize(&cwd.join(p)))
    }
}

fn lexically_normalize(p: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in p.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_from_root_basic() {
        let root = Path::new("/srv/confed");
        let p = Path::new("/srv/confed/configs/sample.json");
        assert_eq!(path_from_root(root, p).unwrap(), "/configs/sample.json");
    }

    #[test]
    fn path_from_root_rejects_outside() {
        let root = Path::new("/srv/confed");
        let p = Path::new("/etc/passwd");
        assert!(path_from_root(root, p).is_err());
    }

    #[test]
    fn fake_root_path_strips_leading_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let (physical, virtual_path) = fake_root_path(dir.path(), "/sample.json").unwrap();
        assert_eq!(physical, dir.path().join("sample.json"));
        assert_eq!(virtual_path, "/sample.json");
    }

    #[test]
    fn fake_root_path_handles_multiple_leading_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let (physical, virtual_path) = fake_root_path(dir.path(), "///nested/sample.json").unwrap();
        assert_eq!(physical, dir.path().join("nested/sample.json"));
        assert_eq!(virtual_path, "/nested/sample.json");
    }
}
