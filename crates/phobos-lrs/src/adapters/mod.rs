// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Adapter capability sets.
//!
//! Each external collaborator family is a trait: device nodes
//! ([`DeviceAdapter`]), media filesystems ([`FsAdapter`]) and library
//! changers ([`LibraryAdapter`]). Variants register by name at startup and
//! are resolved from the [`AdapterRegistry`] held by the process context.
//! The POSIX directory variants ship here; LTFS/SCSI/RADOS variants are
//! external and plug into the same registry.

mod device;
mod fs;
mod library;

pub use device::{DevInfo, DeviceAdapter, PosixDirDevice};
pub use fs::{FsAdapter, FsSpace, PosixFs};
pub use library::{ElementAddress, LibListing, LibraryAdapter, NoopLibrary};
pub use library::{LIB_MOVE_TIMEOUT, LIB_QUERY_TIMEOUT};

use crate::error::{LrsError, Result};
use crate::types::{Family, FsType};
use dashmap::DashMap;
use std::sync::Arc;

/// Named adapter variants, resolved per family / filesystem type.
pub struct AdapterRegistry {
    fs: DashMap<String, Arc<dyn FsAdapter>>,
    device: DashMap<String, Arc<dyn DeviceAdapter>>,
    library: DashMap<String, Arc<dyn LibraryAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AdapterRegistry {
    /// Empty registry; callers register every variant themselves.
    pub fn empty() -> Self {
        Self {
            fs: DashMap::new(),
            device: DashMap::new(),
            library: DashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in POSIX directory variants.
    pub fn with_defaults() -> Self {
        let reg = Self::empty();
        reg.register_fs("posix", Arc::new(PosixFs::new()));
        reg.register_device(Family::Dir.as_str(), Arc::new(PosixDirDevice::new()));
        reg.register_library(Family::Dir.as_str(), Arc::new(NoopLibrary::new()));
        reg
    }

    pub fn register_fs(&self, name: &str, adapter: Arc<dyn FsAdapter>) {
        self.fs.insert(name.to_string(), adapter);
    }

    pub fn register_device(&self, name: &str, adapter: Arc<dyn DeviceAdapter>) {
        self.device.insert(name.to_string(), adapter);
    }

    pub fn register_library(&self, name: &str, adapter: Arc<dyn LibraryAdapter>) {
        self.library.insert(name.to_string(), adapter);
    }

    /// Filesystem adapter for a medium's fs type.
    pub fn fs(&self, fs_type: FsType) -> Result<Arc<dyn FsAdapter>> {
        self.fs
            .get(fs_type.as_str())
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| {
                LrsError::InvalidRequest(format!("no fs adapter registered for {}", fs_type.as_str()))
            })
    }

    /// Device adapter for a family.
    pub fn device(&self, family: Family) -> Result<Arc<dyn DeviceAdapter>> {
        self.device
            .get(family.as_str())
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| {
                LrsError::InvalidRequest(format!("no device adapter registered for {}", family))
            })
    }

    /// Library adapter for a family.
    pub fn library(&self, family: Family) -> Result<Arc<dyn LibraryAdapter>> {
        self.library
            .get(family.as_str())
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| {
                LrsError::InvalidRequest(format!("no library adapter registered for {}", family))
            })
    }
}
