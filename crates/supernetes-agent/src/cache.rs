//! Agent I/O cache directory handling
//!
//! Job output is collected into one file per job, `<id>.out`, under
//! `<cache>/supernetes/io/`. Paths derived from workload identifiers are
//! normalized and prefix-checked so that a malicious identifier cannot
//! escape the I/O directory.

use std::path::{Component, Path, PathBuf};

use supernetes_common::{Error, Result};

/// Resolve the agent cache directory, `$XDG_CACHE_HOME/supernetes` or
/// `$HOME/.cache/supernetes`.
pub fn dir() -> Result<PathBuf> {
    let base = match std::env::var_os("XDG_CACHE_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME")
                .ok_or_else(|| Error::config("cache directory unresolvable: HOME unset"))?;
            Path::new(&home).join(".cache")
        }
    };

    Ok(base.join("supernetes"))
}

/// Resolve the job I/O directory
pub fn io_dir() -> Result<PathBuf> {
    Ok(dir()?.join("io"))
}

/// Resolve the output file path for the given job identifier.
///
/// The path is normalized lexically (the file may not exist yet, so
/// `canonicalize` is not an option) and must remain under the I/O directory.
pub fn job_output_path(identifier: &str) -> Result<PathBuf> {
    let io_dir = io_dir()?;
    let path = normalize(&io_dir.join(format!("{identifier}.out")));

    if !path.starts_with(&io_dir) {
        return Err(Error::validation(format!(
            "invalid job identifier {identifier:?}"
        )));
    }

    Ok(path)
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem. Absolute paths clamp at the root; relative
/// paths keep their leading `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() && !result.has_root() {
                    result.push(Component::ParentDir);
                }
            }
            other => result.push(other),
        }
    }

    result
}
