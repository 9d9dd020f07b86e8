//! Path normalization and modification-time helpers.
//!
//! Every path that reaches the cache goes through [`normalize_path`] so the
//! same file always maps to the same key, whichever spelling the caller used.

use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Lexically normalize a path.
///
/// Relative paths are resolved against the current directory, `.` components
/// are dropped and `..` pops the previous component. Symlinks are left alone:
/// the walk in `freeze` reports paths the same way, so both sides agree.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// The string key a path is stored and matched under.
pub fn path_key(path: &Path) -> String {
    normalize_path(path).to_string_lossy().into_owned()
}

/// Modification time of `metadata` in epoch millis.
///
/// Times before the epoch come back negative rather than failing.
pub fn modified_millis(metadata: &Metadata) -> io::Result<EpochMillis> {
    let modified = metadata.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_millis() as EpochMillis,
        Err(before) => -(before.duration().as_millis() as EpochMillis),
    })
}
