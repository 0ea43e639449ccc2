// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filesystem adapter: bring a medium online, account space, sync it.

use crate::error::{LrsError, Result};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Space accounting returned by `statfs`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsSpace {
    pub used: u64,
    pub free: u64,
    /// Filesystem is mounted read-only.
    pub read_only: bool,
}

/// Capability set of a media filesystem.
///
/// `device_path` designates the drive-side resource (tape device node,
/// directory root); `mount_point` is where the medium becomes visible.
pub trait FsAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the medium online at `mount_point`.
    fn mount(&self, device_path: &str, mount_point: &Path) -> Result<()>;

    /// Take the medium offline.
    fn umount(&self, device_path: &str, mount_point: &Path) -> Result<()>;

    /// Create an empty filesystem labelled `label` on the medium.
    fn format(&self, device_path: &str, label: &str) -> Result<()>;

    /// Space accounting of a mounted medium.
    fn statfs(&self, path: &Path) -> Result<FsSpace>;

    /// Flush everything written to the medium since the last sync.
    fn sync(&self, path: &Path) -> Result<()>;
}

// ============================================================================
// POSIX directories
// ============================================================================

/// POSIX directory filesystem: the medium is a directory root; mounting
/// publishes it under the configured prefix through a symlink.
pub struct PosixFs;

impl PosixFs {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PosixFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FsAdapter for PosixFs {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn mount(&self, device_path: &str, mount_point: &Path) -> Result<()> {
        let root = Path::new(device_path);
        if !root.is_dir() {
            return Err(LrsError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("medium root {} is not a directory", device_path),
            )));
        }
        if let Some(parent) = mount_point.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::read_link(mount_point) {
            // Remount of the same medium on the same point is idempotent.
            Ok(target) if target == root => return Ok(()),
            Ok(_) => fs::remove_file(mount_point)?,
            Err(_) => {}
        }
        std::os::unix::fs::symlink(root, mount_point)?;
        log::debug!(
            "[PosixFs::mount] {} -> {}",
            mount_point.display(),
            device_path
        );
        Ok(())
    }

    fn umount(&self, _device_path: &str, mount_point: &Path) -> Result<()> {
        match fs::remove_file(mount_point) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn format(&self, device_path: &str, label: &str) -> Result<()> {
        fs::create_dir_all(device_path)?;
        // The label file doubles as the formatted marker.
        fs::write(Path::new(device_path).join(".phobos_label"), label)?;
        log::debug!("[PosixFs::format] {} labelled {}", device_path, label);
        Ok(())
    }

    fn statfs(&self, path: &Path) -> Result<FsSpace> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LrsError::InvalidRequest(format!("bad path {}", path.display())))?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is a valid NUL-terminated path, vfs is zeroed output.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(LrsError::Io(std::io::Error::last_os_error()));
        }
        let block = if vfs.f_frsize > 0 {
            vfs.f_frsize
        } else {
            vfs.f_bsize
        };
        let frsize = block as u64;
        Ok(FsSpace {
            used: (vfs.f_blocks.saturating_sub(vfs.f_bfree) as u64) * frsize,
            free: (vfs.f_bavail as u64) * frsize,
            read_only: (vfs.f_flag & libc::ST_RDONLY as libc::c_ulong) != 0,
        })
    }

    fn sync(&self, path: &Path) -> Result<()> {
        let dir = fs::File::open(path)?;
        // SAFETY: fd is a live file descriptor owned by `dir`.
        let rc = unsafe { libc::syncfs(dir.as_raw_fd()) };
        if rc != 0 {
            return Err(LrsError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
