//! Filesystem operations for staging and target directories.
//!
//! This module handles:
//! - Read-only bind mounts and unmounts
//! - Directory creation with an optional permission mode
//! - Tolerant recursive removal

mod mounts;

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

pub use mounts::{HostMounts, MountOps, Unmounted};

/// Mode applied to newly created directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Create `path` and its parents, then apply `mode` to `path` if given.
///
/// Existing directories are left in place, so calling this twice is fine.
pub fn create_dir_all_with_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DEFAULT_DIR_MODE)
        .create(path)?;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Recursively remove `path`. A missing path counts as removed.
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_nested_directories_with_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/c");

        create_dir_all_with_mode(&path, Some(0o750)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);

        // Second call is a no-op.
        create_dir_all_with_mode(&path, None).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn removing_missing_directory_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stage");
        fs::create_dir_all(path.join("nested")).unwrap();
        fs::write(path.join("nested/config"), "x").unwrap();

        remove_dir_all_if_exists(&path).unwrap();
        assert!(!path.exists());
        remove_dir_all_if_exists(&path).unwrap();
    }
}
