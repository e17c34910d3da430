//! Helper functions to disallow absolute paths or relative paths that goes into
//! parent paths.
//!
//! File operations in an assignment's image spec are written by course staff,
//! but they still must never touch anything outside the build context.

use std::path::{Component, Path, PathBuf};

/// Checks if a path is a relative path that does not navigate to its parent.
/// Returns `Err` if it's not.
pub fn enforce_child_path(path: &Path) -> Result<(), String> {
    let mut depth = 0;
    for part in path.components() {
        match part {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!(
                    "Path {} is an absolute path, which is not allowed",
                    path.to_string_lossy()
                ));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
            }
            Component::Normal(_) => {
                depth += 1;
            }
        }
        if depth < 0 {
            return Err(format!(
                "Path {} navigates into its parents, which is not allowed",
                path.to_string_lossy()
            ));
        }
    }
    Ok(())
}

/// Resolve `relative` against `root`, refusing anything that would land
/// outside of `root` or on `root` itself.
pub fn resolve_child_path(root: &Path, relative: &Path) -> Result<PathBuf, String> {
    enforce_child_path(relative)?;
    let resolved = normalize(&root.join(relative));
    if resolved == normalize(root) {
        return Err(format!(
            "Path {} points at the root of {}, which is not allowed",
            relative.to_string_lossy(),
            root.to_string_lossy()
        ));
    }
    Ok(resolved)
}

/// Lexically drop `.` and fold `..` components, without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
