// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DSS cooperative lock coordinator.
//!
//! Device locks are taken at daemon start for every device configured for
//! this host and held until the admin removes the device. Medium locks are
//! taken lazily at allocation time as *early* locks (the resource is
//! reserved before it is usable), converted to normal locks once the medium
//! is ready, and released at release time. Locks are pid-scoped; after a
//! DSS reconnect the coordinator re-locks, treating "already held by me" as
//! success.

use crate::dss::{Dss, DssError, LockOwner};
use crate::error::{LrsError, Result};
use crate::types::ResourceId;

/// Takes, converts and releases the daemon's cooperative locks.
pub struct LockCoordinator {
    owner: LockOwner,
}

impl LockCoordinator {
    pub fn new(owner: LockOwner) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// True when the conflict is with ourselves (stale row from a previous
    /// connect of this same process).
    fn conflict_is_self(&self, err: &DssError) -> bool {
        match err {
            DssError::LockConflict {
                owner: Some(rec), ..
            } => rec.is_owned_by(&self.owner.hostname, self.owner.pid),
            _ => false,
        }
    }

    /// Lock every device of this daemon at startup. A conflict with another
    /// owner aborts the startup; a conflict with ourselves is idempotent.
    pub fn lock_devices(&self, dss: &dyn Dss, devices: &[ResourceId]) -> Result<()> {
        for id in devices {
            match dss.device_lock(std::slice::from_ref(id), &self.owner) {
                Ok(()) => {}
                Err(e) if self.conflict_is_self(&e) => {
                    log::debug!("[LockCoordinator::lock_devices] {} already ours", id);
                }
                Err(e) => {
                    log::error!("[LockCoordinator::lock_devices] {}: {}", id, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Release the device locks on clean shutdown.
    pub fn unlock_devices(&self, dss: &dyn Dss, devices: &[ResourceId]) {
        for id in devices {
            match dss.device_unlock(std::slice::from_ref(id), &self.owner) {
                Ok(()) | Err(DssError::NotLocked(_)) => {}
                Err(e) => log::warn!("[LockCoordinator::unlock_devices] {}: {}", id, e),
            }
        }
    }

    /// Reserve a medium for a multi-step allocation (early lock).
    pub fn early_lock_medium(&self, dss: &dyn Dss, id: &ResourceId) -> Result<()> {
        dss.media_lock(std::slice::from_ref(id), &self.owner, true)
            .map_err(LrsError::from)
    }

    /// Convert an early medium lock to a normal one once the medium is
    /// mounted and usable.
    pub fn convert_medium_lock(&self, dss: &dyn Dss, id: &ResourceId) -> Result<()> {
        dss.media_lock_convert(std::slice::from_ref(id), &self.owner)
            .map_err(LrsError::from)
    }

    /// Release a medium lock (allocation abort or release time).
    pub fn unlock_medium(&self, dss: &dyn Dss, id: &ResourceId) {
        match dss.media_unlock(std::slice::from_ref(id), &self.owner) {
            Ok(()) | Err(DssError::NotLocked(_)) => {}
            Err(e) => log::warn!("[LockCoordinator::unlock_medium] {}: {}", id, e),
        }
    }

    /// Re-take locks after a transient DSS reconnect.
    pub fn relock(&self, dss: &dyn Dss, devices: &[ResourceId], media: &[ResourceId]) -> Result<()> {
        self.lock_devices(dss, devices)?;
        for id in media {
            match dss.media_lock(std::slice::from_ref(id), &self.owner, false) {
                Ok(()) => {}
                Err(e) if self.conflict_is_self(&e) => {}
                Err(e) => {
                    log::error!("[LockCoordinator::relock] {}: {}", id, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Hostname currently holding a medium lock, for locate redirection.
    pub fn medium_lock_host(&self, dss: &dyn Dss, id: &ResourceId) -> Option<String> {
        match dss.media_lock_owner(id) {
            Ok(Some(rec)) => Some(rec.hostname),
            Ok(None) => None,
            Err(e) => {
                log::warn!("[LockCoordinator::medium_lock_host] {}: {}", id, e);
                None
            }
        }
    }
}
