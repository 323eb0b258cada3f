//! Mount operations.

use std::path::Path;

use confsync_common::ConfsyncResult;

use crate::mountinfo::MountTable;

/// Outcome of an unmount request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmounted {
    /// A mount was removed.
    Unmounted,
    /// Nothing was mounted there, or the path does not exist.
    NotMounted,
}

/// Mount-related host operations used by the lifecycle manager.
///
/// Production code uses [`HostMounts`]; tests substitute an in-memory
/// implementation so the lifecycle can be exercised without privileges.
pub trait MountOps: Send + Sync {
    /// Read the live mount table.
    fn read_mount_table(&self) -> ConfsyncResult<MountTable>;

    /// Bind-mount `source` onto `target` read-only.
    fn bind_mount_readonly(&self, source: &Path, target: &Path) -> ConfsyncResult<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> ConfsyncResult<Unmounted>;
}

/// [`MountOps`] backed by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMounts;

impl MountOps for HostMounts {
    fn read_mount_table(&self) -> ConfsyncResult<MountTable> {
        MountTable::read()
    }

    #[cfg(target_os = "linux")]
    fn bind_mount_readonly(&self, source: &Path, target: &Path) -> ConfsyncResult<()> {
        use rustix::mount::{MountFlags, mount, mount_remount};

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "Creating read-only bind mount"
        );

        let flags = MountFlags::BIND | MountFlags::RDONLY;
        mount(source, target, "", flags, None::<&std::ffi::CStr>)
            .map_err(|e| confsync_common::ConfsyncError::Io(e.into()))?;

        // The initial bind ignores RDONLY; only the remount applies it.
        mount_remount(target, flags, "")
            .map_err(|e| confsync_common::ConfsyncError::Io(e.into()))?;

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_mount_readonly(&self, _source: &Path, _target: &Path) -> ConfsyncResult<()> {
        Err(confsync_common::ConfsyncError::Unimplemented {
            feature: "bind mounts".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    fn unmount(&self, target: &Path) -> ConfsyncResult<Unmounted> {
        use rustix::io::Errno;
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Unmounting");

        match unmount(target, UnmountFlags::empty()) {
            Ok(()) => Ok(Unmounted::Unmounted),
            Err(Errno::INVAL | Errno::NOENT) => Ok(Unmounted::NotMounted),
            Err(e) => Err(confsync_common::ConfsyncError::Io(e.into())),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount(&self, _target: &Path) -> ConfsyncResult<Unmounted> {
        Err(confsync_common::ConfsyncError::Unimplemented {
            feature: "unmount".to_string(),
        })
    }
}
