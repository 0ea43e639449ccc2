// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device adapter: drive-side operations (lookup, query, load, eject).

use crate::error::{LrsError, Result};
use std::path::Path;

/// State reported by a drive query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevInfo {
    pub serial: String,
    pub model: Option<String>,
    /// A medium is physically present in the drive.
    pub medium_present: bool,
}

/// Capability set of a drive family.
pub trait DeviceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve a serial number to a device path.
    fn lookup(&self, serial: &str) -> Result<String>;

    /// Query the drive state at `path`.
    fn query(&self, path: &str) -> Result<DevInfo>;

    /// Thread the named medium into the drive (after the library move).
    fn load(&self, path: &str, medium_name: &str) -> Result<()>;

    /// Unthread the current medium so the library can move it away.
    fn eject(&self, path: &str) -> Result<()>;
}

// ============================================================================
// POSIX directories
// ============================================================================

/// Directory "drive": serial and path coincide, the medium is always
/// present, load/eject are no-ops.
pub struct PosixDirDevice;

impl PosixDirDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PosixDirDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAdapter for PosixDirDevice {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn lookup(&self, serial: &str) -> Result<String> {
        if !Path::new(serial).is_dir() {
            return Err(LrsError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("directory device {} does not exist", serial),
            )));
        }
        Ok(serial.to_string())
    }

    fn query(&self, path: &str) -> Result<DevInfo> {
        if !Path::new(path).is_dir() {
            return Err(LrsError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("directory device {} does not exist", path),
            )));
        }
        Ok(DevInfo {
            serial: path.to_string(),
            model: None,
            medium_present: true,
        })
    }

    fn load(&self, _path: &str, _medium_name: &str) -> Result<()> {
        Ok(())
    }

    fn eject(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_identity_for_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_str().unwrap();
        let dev = PosixDirDevice::new();
        assert_eq!(dev.lookup(path).unwrap(), path);
        assert!(dev.query(path).unwrap().medium_present);
        assert!(dev.lookup("/nonexistent/phobos/dev").is_err());
    }
}
