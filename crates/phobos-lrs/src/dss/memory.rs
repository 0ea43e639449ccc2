// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory DSS backend.
//!
//! One shared store, many cheap handles: the factory clones an `Arc` to the
//! store for each "connection", which mirrors how the SQLite backend opens
//! one connection per thread against one database. Used by tests and by
//! single-host development wiring; it provides the same lock semantics as a
//! real backend (atomic list locking, owner checks, conflict reporting).

use super::{
    DeviceFilter, Dss, DssError, DssFactory, DssResult, ExtentInfo, LayoutInfo, LockOwner,
    MediaFilter, ObjectInfo,
};
use crate::types::{Device, LockRecord, Medium, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Store {
    media: Mutex<HashMap<ResourceId, Medium>>,
    devices: Mutex<HashMap<ResourceId, Device>>,
    media_locks: Mutex<HashMap<ResourceId, LockRecord>>,
    device_locks: Mutex<HashMap<ResourceId, LockRecord>>,
    objects: Mutex<HashMap<String, ObjectInfo>>,
    deprecated: Mutex<HashMap<String, Vec<ObjectInfo>>>,
    layouts: Mutex<HashMap<String, LayoutInfo>>,
    config: Mutex<HashMap<(String, String), String>>,
}

/// Handle over the shared in-memory store.
pub struct MemoryDss {
    store: Arc<Store>,
}

/// Factory producing [`MemoryDss`] handles over one shared store.
#[derive(Clone)]
pub struct MemoryDssFactory {
    store: Arc<Store>,
}

impl Default for MemoryDssFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDssFactory {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::default()),
        }
    }

    /// Direct handle, bypassing `connect` for test setup.
    pub fn handle(&self) -> MemoryDss {
        MemoryDss {
            store: Arc::clone(&self.store),
        }
    }
}

impl DssFactory for MemoryDssFactory {
    fn connect(&self) -> DssResult<Box<dyn Dss>> {
        Ok(Box::new(self.handle()))
    }
}

/// Atomic list lock: verify every id is free, then write every record.
fn lock_all(
    table: &Mutex<HashMap<ResourceId, LockRecord>>,
    ids: &[ResourceId],
    owner: &LockOwner,
    is_early: bool,
) -> DssResult<()> {
    let mut locks = table.lock();
    for id in ids {
        if let Some(existing) = locks.get(id) {
            return Err(DssError::LockConflict {
                resource: id.clone(),
                owner: Some(existing.clone()),
            });
        }
    }
    for id in ids {
        locks.insert(id.clone(), owner.record(is_early));
    }
    Ok(())
}

/// Atomic list unlock with owner verification.
fn unlock_all(
    table: &Mutex<HashMap<ResourceId, LockRecord>>,
    ids: &[ResourceId],
    owner: &LockOwner,
) -> DssResult<()> {
    let mut locks = table.lock();
    for id in ids {
        match locks.get(id) {
            None => return Err(DssError::NotLocked(id.clone())),
            Some(rec) if !rec.is_owned_by(&owner.hostname, owner.pid) => {
                return Err(DssError::LockConflict {
                    resource: id.clone(),
                    owner: Some(rec.clone()),
                })
            }
            Some(_) => {}
        }
    }
    for id in ids {
        locks.remove(id);
    }
    Ok(())
}

impl Dss for MemoryDss {
    fn media_get(&self, filter: &MediaFilter) -> DssResult<Vec<Medium>> {
        let media = self.store.media.lock();
        let locks = self.store.media_locks.lock();
        let mut rows: Vec<Medium> = media
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .map(|mut m| {
                m.lock = locks.get(&m.id).cloned();
                m
            })
            .collect();
        rows.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        Ok(rows)
    }

    fn media_insert(&self, medium: &Medium) -> DssResult<()> {
        let mut media = self.store.media.lock();
        if media.contains_key(&medium.id) {
            return Err(DssError::Query(format!("duplicate medium {}", medium.id)));
        }
        media.insert(medium.id.clone(), medium.clone());
        Ok(())
    }

    fn media_update(&self, medium: &Medium) -> DssResult<()> {
        let mut media = self.store.media.lock();
        match media.get_mut(&medium.id) {
            None => Err(DssError::NotFound(medium.id.clone())),
            Some(row) => {
                let mut updated = medium.clone();
                // The lock column is owned by the lock table, not the caller.
                updated.lock = None;
                *row = updated;
                Ok(())
            }
        }
    }

    fn media_lock(&self, ids: &[ResourceId], owner: &LockOwner, is_early: bool) -> DssResult<()> {
        lock_all(&self.store.media_locks, ids, owner, is_early)
    }

    fn media_unlock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        unlock_all(&self.store.media_locks, ids, owner)
    }

    fn media_lock_convert(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        let mut locks = self.store.media_locks.lock();
        for id in ids {
            match locks.get(id) {
                Some(rec) if rec.is_owned_by(&owner.hostname, owner.pid) => {}
                Some(rec) => {
                    return Err(DssError::LockConflict {
                        resource: id.clone(),
                        owner: Some(rec.clone()),
                    })
                }
                None => return Err(DssError::NotLocked(id.clone())),
            }
        }
        for id in ids {
            if let Some(rec) = locks.get_mut(id) {
                rec.is_early = false;
            }
        }
        Ok(())
    }

    fn media_lock_owner(&self, id: &ResourceId) -> DssResult<Option<LockRecord>> {
        Ok(self.store.media_locks.lock().get(id).cloned())
    }

    fn device_get(&self, filter: &DeviceFilter) -> DssResult<Vec<Device>> {
        let devices = self.store.devices.lock();
        let locks = self.store.device_locks.lock();
        let mut rows: Vec<Device> = devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .map(|mut d| {
                d.lock = locks.get(&d.id).cloned();
                d
            })
            .collect();
        rows.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        Ok(rows)
    }

    fn device_insert(&self, device: &Device) -> DssResult<()> {
        let mut devices = self.store.devices.lock();
        if devices.contains_key(&device.id) {
            return Err(DssError::Query(format!("duplicate device {}", device.id)));
        }
        devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    fn device_update(&self, device: &Device) -> DssResult<()> {
        let mut devices = self.store.devices.lock();
        match devices.get_mut(&device.id) {
            None => Err(DssError::NotFound(device.id.clone())),
            Some(row) => {
                let mut updated = device.clone();
                updated.lock = None;
                *row = updated;
                Ok(())
            }
        }
    }

    fn device_lock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        lock_all(&self.store.device_locks, ids, owner, false)
    }

    fn device_unlock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        unlock_all(&self.store.device_locks, ids, owner)
    }

    fn medium_health(&self, id: &ResourceId) -> DssResult<u32> {
        self.store
            .media
            .lock()
            .get(id)
            .map(|m| m.health)
            .ok_or_else(|| DssError::NotFound(id.clone()))
    }

    fn medium_health_set(&self, id: &ResourceId, health: u32) -> DssResult<()> {
        match self.store.media.lock().get_mut(id) {
            None => Err(DssError::NotFound(id.clone())),
            Some(m) => {
                m.health = health;
                Ok(())
            }
        }
    }

    fn object_get(&self, oid: &str) -> DssResult<ObjectInfo> {
        self.store
            .objects
            .lock()
            .get(oid)
            .cloned()
            .ok_or_else(|| DssError::ObjectNotFound(oid.to_string()))
    }

    fn object_insert(&self, object: &ObjectInfo) -> DssResult<()> {
        let mut objects = self.store.objects.lock();
        if let Some(previous) = objects.insert(object.oid.clone(), object.clone()) {
            // Overwritten generations become deprecated rows.
            self.store
                .deprecated
                .lock()
                .entry(object.oid.clone())
                .or_default()
                .push(previous);
        }
        Ok(())
    }

    fn deprecated_object_get(&self, oid: &str) -> DssResult<Vec<ObjectInfo>> {
        Ok(self
            .store
            .deprecated
            .lock()
            .get(oid)
            .cloned()
            .unwrap_or_default())
    }

    fn layout_get(&self, oid: &str) -> DssResult<LayoutInfo> {
        self.store
            .layouts
            .lock()
            .get(oid)
            .cloned()
            .ok_or_else(|| DssError::ObjectNotFound(oid.to_string()))
    }

    fn config_get(&self, section: &str, key: &str) -> DssResult<Option<String>> {
        Ok(self
            .store
            .config
            .lock()
            .get(&(section.to_string(), key.to_string()))
            .cloned())
    }

    fn config_set(&self, section: &str, key: &str, value: &str) -> DssResult<()> {
        self.store
            .config
            .lock()
            .insert((section.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

impl MemoryDss {
    /// Seed a layout row (test helper; a real DSS gets these from the store
    /// daemon's put path).
    pub fn layout_insert(&self, oid: &str, extents: Vec<ExtentInfo>) {
        self.store.layouts.lock().insert(
            oid.to_string(),
            LayoutInfo {
                oid: oid.to_string(),
                extents,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Family, FsType};

    fn owner(host: &str, pid: u32) -> LockOwner {
        LockOwner::new(host, pid)
    }

    fn tape(name: &str) -> ResourceId {
        ResourceId::new(Family::Tape, name, "legacy")
    }

    fn seeded() -> MemoryDssFactory {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        for name in ["P00001", "P00002"] {
            dss.media_insert(&Medium::new(tape(name), FsType::Ltfs, 2))
                .unwrap();
        }
        factory
    }

    #[test]
    fn lock_conflict_reports_owner() {
        let factory = seeded();
        let dss = factory.handle();
        let a = owner("node-a", 100);
        let b = owner("node-b", 200);
        dss.media_lock(&[tape("P00001")], &a, false).unwrap();

        match dss.media_lock(&[tape("P00001")], &b, false) {
            Err(DssError::LockConflict { owner, .. }) => {
                assert_eq!(owner.unwrap().hostname, "node-a");
            }
            other => panic!("expected conflict, got {:?}", other.err()),
        }
    }

    #[test]
    fn list_lock_is_atomic() {
        let factory = seeded();
        let dss = factory.handle();
        let a = owner("node-a", 100);
        let b = owner("node-b", 200);
        dss.media_lock(&[tape("P00002")], &b, false).unwrap();

        // P00001 is free but the batch must fail as a whole.
        assert!(dss
            .media_lock(&[tape("P00001"), tape("P00002")], &a, false)
            .is_err());
        assert!(dss.media_lock_owner(&tape("P00001")).unwrap().is_none());
    }

    #[test]
    fn unlock_checks_ownership() {
        let factory = seeded();
        let dss = factory.handle();
        let a = owner("node-a", 100);
        let b = owner("node-b", 200);
        dss.media_lock(&[tape("P00001")], &a, false).unwrap();

        assert!(matches!(
            dss.media_unlock(&[tape("P00001")], &b),
            Err(DssError::LockConflict { .. })
        ));
        dss.media_unlock(&[tape("P00001")], &a).unwrap();
        assert!(matches!(
            dss.media_unlock(&[tape("P00001")], &a),
            Err(DssError::NotLocked(_))
        ));
    }

    #[test]
    fn early_lock_converts_in_place() {
        let factory = seeded();
        let dss = factory.handle();
        let a = owner("node-a", 100);
        dss.media_lock(&[tape("P00001")], &a, true).unwrap();
        assert!(dss.media_lock_owner(&tape("P00001")).unwrap().unwrap().is_early);

        dss.media_lock_convert(&[tape("P00001")], &a).unwrap();
        assert!(!dss.media_lock_owner(&tape("P00001")).unwrap().unwrap().is_early);
    }

    #[test]
    fn media_get_joins_lock_column() {
        let factory = seeded();
        let dss = factory.handle();
        let a = owner("node-a", 100);
        dss.media_lock(&[tape("P00001")], &a, false).unwrap();

        let rows = dss.media_get(&MediaFilter::family(Family::Tape)).unwrap();
        let locked = rows.iter().find(|m| m.id.name == "P00001").unwrap();
        assert_eq!(locked.lock.as_ref().unwrap().hostname, "node-a");
        assert!(rows.iter().find(|m| m.id.name == "P00002").unwrap().lock.is_none());
    }

    #[test]
    fn object_overwrite_moves_previous_to_deprecated() {
        let factory = seeded();
        let dss = factory.handle();
        let v1 = ObjectInfo {
            oid: "obj1".into(),
            user_md: "{}".into(),
            version: 1,
        };
        let v2 = ObjectInfo {
            version: 2,
            ..v1.clone()
        };
        dss.object_insert(&v1).unwrap();
        dss.object_insert(&v2).unwrap();

        assert_eq!(dss.object_get("obj1").unwrap().version, 2);
        let old = dss.deprecated_object_get("obj1").unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].version, 1);
    }

    #[test]
    fn handles_share_one_store() {
        let factory = seeded();
        let h1 = factory.handle();
        let h2 = factory.handle();
        h1.config_set("lrs", "policy", "first_fit").unwrap();
        assert_eq!(
            h2.config_get("lrs", "policy").unwrap().as_deref(),
            Some("first_fit")
        );
    }
}
