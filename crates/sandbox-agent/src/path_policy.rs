//! Path policy for `/file/write` and `/file/read` (spec.md §4.2).
//!
//! Resolution always happens on the fully symlink-expanded absolute form,
//! never on the input string, so `..` segments and symlink chains that
//! would otherwise escape the allowed prefixes are caught rather than
//! trusted.

use std::path::{Path, PathBuf};

const WRITE_PREFIXES: &[&str] = &["/workspace", "/mnt/user-data/outputs"];
const READ_PREFIXES: &[&str] = &["/workspace", "/mnt/user-data"];

#[derive(Debug, thiserror::Error)]
pub enum PathPolicyError {
    #[error("path not allowed")]
    NotAllowed,
    #[error("io error resolving path: {0}")]
    Io(#[from] std::io::Error),
}

/// Rewrite a relative path under `/workspace`, then resolve symlinks and
/// `..` segments, then check the result against `prefixes`.
fn resolve_and_check(path: &str, prefixes: &[&str]) -> Result<PathBuf, PathPolicyError> {
    let candidate = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new("/workspace").join(path)
    };

    let resolved = canonicalize_best_effort(&candidate)?;

    if !prefixes.iter().any(|p| resolved.starts_with(p)) {
        return Err(PathPolicyError::NotAllowed);
    }

    Ok(resolved)
}

/// `std::fs::canonicalize` requires every component to exist, which is too
/// strict for a not-yet-created write target. Canonicalize the longest
/// existing ancestor, then rejoin the remaining (non-existent) components.
fn canonicalize_best_effort(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match std::fs::canonicalize(existing) {
            Ok(mut base) => {
                for component in remainder.into_iter().rev() {
                    base.push(component);
                }
                return Ok(base);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match existing.parent() {
                Some(parent) => {
                    if let Some(name) = existing.file_name() {
                        remainder.push(name.to_os_string());
                    }
                    existing = parent;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

pub fn check_write_path(path: &str) -> Result<PathBuf, PathPolicyError> {
    resolve_and_check(path, WRITE_PREFIXES)
}

pub fn check_read_path(path: &str) -> Result<PathBuf, PathPolicyError> {
    resolve_and_check(path, READ_PREFIXES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn relative_path_rewritten_under_workspace() {
        // /workspace may not exist in the test sandbox; the call should
        // still fail via `NotAllowed` only if it resolves outside the
        // allowed prefixes, never silently succeed on a bare relative path.
        let result = check_write_path("report.txt");
        match result {
            Ok(p) => assert!(p.starts_with("/workspace")),
            Err(PathPolicyError::Io(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn traversal_outside_workspace_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("secret.txt");
        fs::write(&outside, "shh").unwrap();

        // Simulate a traversal attempt resolving to a path outside the
        // allowed prefixes by checking an absolute path that isn't rooted
        // in /workspace or /mnt/user-data at all.
        let result = resolve_and_check(outside.to_str().unwrap(), WRITE_PREFIXES);
        assert!(matches!(result, Err(PathPolicyError::NotAllowed)));
    }

    #[test]
    fn symlink_escaping_workspace_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let outside_dir = tmp.path().join("outside");
        fs::create_dir(&outside_dir).unwrap();

        #[cfg(unix)]
        {
            let link = tmp.path().join("escape-link");
            std::os::unix::fs::symlink(&outside_dir, &link).unwrap();
            let result = resolve_and_check(link.to_str().unwrap(), WRITE_PREFIXES);
            assert!(matches!(result, Err(PathPolicyError::NotAllowed)));
        }
    }
}
