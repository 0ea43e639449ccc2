// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource registry: the in-memory catalog of one family's resources.
//!
//! Devices live here as shared handles; medium rows live in the media cache
//! and the registry only brokers their lifecycle (insertion, failure,
//! eviction). Invariants maintained:
//!
//! - every registered device has a matching DSS device row;
//! - a resource is failed iff its health is zero or an admin failed it;
//! - the device-to-loaded-medium mapping is injective (one tape, one
//!   drive), enforced by the per-device workers and checked on lookup.

use crate::cache::MediaCache;
use crate::device::DeviceHandle;
use crate::dss::{DeviceFilter, Dss, LockOwner, MediaFilter};
use crate::error::{LrsError, Result};
use crate::health::HealthTracker;
use crate::types::{AdmStatus, Device, Family, Medium, ResourceId};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-family catalog of device handles and medium lifecycle operations.
pub struct Registry {
    family: Family,
    devices: HashMap<ResourceId, Arc<DeviceHandle>>,
}

impl Registry {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            devices: HashMap::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    /// Register a device. The DSS row must exist (it is the source of
    /// truth); a fresh handle starts in the empty state with no medium.
    pub fn add_device(&mut self, dss: &dyn Dss, device: Device) -> Result<Arc<DeviceHandle>> {
        if self.devices.contains_key(&device.id) {
            return Err(LrsError::AlreadyInitialized(format!("device {}", device.id)));
        }
        let rows = dss.device_get(&DeviceFilter::one(&device.id))?;
        if !rows.iter().any(|d| d.id == device.id) {
            return Err(LrsError::NotFound(device.id.clone()));
        }
        let id = device.id.clone();
        let handle = DeviceHandle::new(device);
        self.devices.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn lookup_device(&self, id: &ResourceId) -> Option<Arc<DeviceHandle>> {
        self.devices.get(id).cloned()
    }

    pub fn remove_device(&mut self, id: &ResourceId) -> Option<Arc<DeviceHandle>> {
        self.devices.remove(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<DeviceHandle>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The device currently holding `medium`, if any. The mapping is
    /// injective; a second holder would be a worker bug.
    pub fn device_hosting(&self, medium: &ResourceId) -> Option<Arc<DeviceHandle>> {
        let mut holder = None;
        for handle in self.devices.values() {
            if handle.loaded_medium().as_ref() == Some(medium) {
                debug_assert!(
                    holder.is_none(),
                    "medium {} loaded on two devices",
                    medium
                );
                holder = Some(Arc::clone(handle));
            }
        }
        holder
    }

    /// Snapshot of every registered device record.
    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.values().map(|h| h.snapshot()).collect()
    }

    /// Admin failure of a device: health forced to zero, state failed. The
    /// DSS lock is deliberately retained until the device is removed.
    pub fn fail_device(&self, dss: &dyn Dss, id: &ResourceId) -> Result<()> {
        let handle = self
            .lookup_device(id)
            .ok_or_else(|| LrsError::NotFound(id.clone()))?;
        handle.force_fail();
        dss.device_update(&handle.snapshot())?;
        log::warn!("[Registry::fail_device] {} failed by admin", id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------------

    /// Create a medium row (admin add): inserted locked until formatted,
    /// then seeded into the cache.
    pub fn add_medium(&self, dss: &dyn Dss, cache: &MediaCache, mut medium: Medium) -> Result<()> {
        if medium.id.family != self.family {
            return Err(LrsError::InvalidRequest(format!(
                "medium {} does not belong to family {}",
                medium.id, self.family
            )));
        }
        medium.adm_status = AdmStatus::Locked;
        dss.media_insert(&medium)?;
        cache.insert(medium);
        Ok(())
    }

    /// Pull an existing DSS medium row into the cache (notify add).
    pub fn absorb_medium(&self, dss: &dyn Dss, cache: &MediaCache, id: &ResourceId) -> Result<()> {
        let rows = dss.media_get(&MediaFilter::one(id))?;
        let row = rows
            .into_iter()
            .find(|m| &m.id == id)
            .ok_or_else(|| LrsError::NotFound(id.clone()))?;
        cache.insert(row);
        Ok(())
    }

    /// Admin failure of a medium: health zero, failed, DSS lock released.
    pub fn fail_medium(
        &self,
        dss: &dyn Dss,
        owner: &LockOwner,
        cache: &Arc<MediaCache>,
        id: &ResourceId,
    ) -> Result<()> {
        let entry = cache.acquire(dss, id)?;
        {
            let tracker = HealthTracker::new(1);
            let mut row = entry.record.write();
            while row.health > 0 {
                tracker.decrease_medium(dss, owner, &mut row);
            }
            if row.adm_status != AdmStatus::Failed {
                row.adm_status = AdmStatus::Failed;
                let snapshot = row.clone();
                drop(row);
                dss.media_update(&snapshot)?;
            }
        }
        log::warn!("[Registry::fail_medium] {} failed by admin", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dss::MemoryDssFactory;
    use crate::types::{DeviceState, FsType};

    fn drive(name: &str) -> Device {
        Device::new(
            ResourceId::new(Family::Tape, name, "legacy"),
            "node-test",
            format!("/dev/{}", name),
            2,
        )
    }

    #[test]
    fn add_device_requires_a_dss_row() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        let mut registry = Registry::new(Family::Tape);

        let orphan = drive("d0");
        assert!(matches!(
            registry.add_device(&dss, orphan.clone()),
            Err(LrsError::NotFound(_))
        ));

        dss.device_insert(&orphan).unwrap();
        let handle = registry.add_device(&dss, orphan.clone()).unwrap();
        assert_eq!(handle.id().name, "d0");
        assert!(matches!(
            registry.add_device(&dss, orphan),
            Err(LrsError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn hosting_lookup_finds_the_loader() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        let mut registry = Registry::new(Family::Tape);
        let mut row = drive("d0");
        row.loaded_medium = Some(ResourceId::new(Family::Tape, "P1", "legacy"));
        dss.device_insert(&row).unwrap();
        registry.add_device(&dss, row).unwrap();

        let p1 = ResourceId::new(Family::Tape, "P1", "legacy");
        assert!(registry.device_hosting(&p1).is_some());
        let p2 = ResourceId::new(Family::Tape, "P2", "legacy");
        assert!(registry.device_hosting(&p2).is_none());
    }

    #[test]
    fn fail_device_keeps_lock_fail_medium_releases_it() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        let owner = LockOwner::new("node-test", 1);
        let mut registry = Registry::new(Family::Tape);

        let row = drive("d0");
        dss.device_insert(&row).unwrap();
        dss.device_lock(&[row.id.clone()], &owner).unwrap();
        registry.add_device(&dss, row.clone()).unwrap();
        registry.fail_device(&dss, &row.id).unwrap();
        let stored = dss.device_get(&DeviceFilter::one(&row.id)).unwrap();
        assert_eq!(stored[0].state, DeviceState::Failed);
        assert!(stored[0].lock.is_some(), "device lock is retained");

        let m_id = ResourceId::new(Family::Tape, "P1", "legacy");
        let mut medium = Medium::new(m_id.clone(), FsType::Ltfs, 2);
        medium.adm_status = AdmStatus::Unlocked;
        dss.media_insert(&medium).unwrap();
        dss.media_lock(&[m_id.clone()], &owner, false).unwrap();
        let cache = MediaCache::new(Family::Tape);
        registry.fail_medium(&dss, &owner, &cache, &m_id).unwrap();
        assert!(dss.media_lock_owner(&m_id).unwrap().is_none());
        assert_eq!(dss.medium_health(&m_id).unwrap(), 0);
    }

    #[test]
    fn add_medium_starts_locked() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        let registry = Registry::new(Family::Tape);
        let cache = MediaCache::new(Family::Tape);

        let mut medium = Medium::new(
            ResourceId::new(Family::Tape, "P1", "legacy"),
            FsType::Ltfs,
            2,
        );
        medium.adm_status = AdmStatus::Unlocked;
        registry.add_medium(&dss, &cache, medium.clone()).unwrap();
        let rows = dss.media_get(&MediaFilter::one(&medium.id)).unwrap();
        assert_eq!(rows[0].adm_status, AdmStatus::Locked);

        let wrong_family = Medium::new(
            ResourceId::new(Family::Dir, "/srv/m", "legacy"),
            FsType::Posix,
            2,
        );
        assert!(registry.add_medium(&dss, &cache, wrong_family).is_err());
    }
}
