// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-instance lock file.
//!
//! Created with `O_CREAT | O_EXCL` and holding the daemon pid. A leftover
//! file whose pid is no longer alive is reclaimed; a live pid means another
//! daemon instance owns this host and startup must abort. The file is
//! removed on drop (clean shutdown).

use anyhow::{anyhow, bail};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for the daemon's lifetime; removes the file on drop.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> anyhow::Result<LockFile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::holder_pid(path) {
                    Some(pid) if crate::pid_is_alive(pid) => {
                        bail!("another phobos-lrsd (pid {}) holds {}", pid, path.display());
                    }
                    holder => {
                        tracing::warn!(
                            "reclaiming stale lock file {} (pid {:?})",
                            path.display(),
                            holder
                        );
                        std::fs::remove_file(path)?;
                        Self::try_create(path).map_err(|e| anyhow!(e))
                    }
                }
            }
            Err(e) => Err(anyhow!(e)),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<LockFile> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(LockFile {
            path: path.to_path_buf(),
        })
    }

    fn holder_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path)
            .ok()?
            .trim()
            .parse::<u32>()
            .ok()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("lock file {} not removed: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_with_live_pid_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("phobosd.lock");
        let lock = LockFile::acquire(&path).unwrap();
        assert!(path.exists());

        // Our own pid is alive, so a second acquire must fail.
        assert!(LockFile::acquire(&path).is_err());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("phobosd.lock");
        // A pid far above pid_max is never alive.
        std::fs::write(&path, "999999999\n").unwrap();
        let lock = LockFile::acquire(&path).unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn unreadable_pid_counts_as_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("phobosd.lock");
        std::fs::write(&path, "garbage\n").unwrap();
        assert!(LockFile::acquire(&path).is_ok());
    }
}
