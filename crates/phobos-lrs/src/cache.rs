// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Media cache: refcounted, keyed lookup with at-most-one-builder-per-key.
//!
//! The cache maps a medium identifier to its row. On a miss, exactly one
//! caller becomes the builder and queries the DSS (medium row + persisted
//! health); every concurrent acquirer of the same key blocks on the entry's
//! condvar and shares the result. A builder failure is handed to every
//! blocked caller and nothing is cached, so the next acquire retries.
//!
//! `update` marks an entry stale: current holders keep their reference, the
//! next acquire rebuilds. `insert` seeds an entry from a row the caller
//! already has (notify flows).

use crate::dss::{Dss, DssError, MediaFilter};
use crate::error::{LrsError, Result};
use crate::types::{Family, Medium, ResourceId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared, lockable medium row as held by cache users.
pub struct CachedMedium {
    pub record: RwLock<Medium>,
}

impl CachedMedium {
    fn new(medium: Medium) -> Arc<Self> {
        Arc::new(Self {
            record: RwLock::new(medium),
        })
    }

    /// Identifier snapshot (cheap clone, avoids holding the row lock).
    pub fn id(&self) -> ResourceId {
        self.record.read().id.clone()
    }
}

enum EntryState {
    /// One builder is querying the DSS; `waiters` callers are blocked.
    Building { waiters: u32 },
    /// Build failed; each of `remaining` blocked callers consumes the error,
    /// the last one removes the entry (no poisoning survives).
    Failed { error: DssError, remaining: u32 },
    /// Live entry. `stale` forces a rebuild on the next acquire.
    Ready {
        value: Arc<CachedMedium>,
        refs: u32,
        stale: bool,
    },
}

/// Per-family medium cache.
pub struct MediaCache {
    family: Family,
    entries: Mutex<HashMap<ResourceId, EntryState>>,
    cond: Condvar,
}

/// Borrowed view of a cached medium; releases its reference on drop.
pub struct MediaRef {
    cache: Arc<MediaCache>,
    value: Arc<CachedMedium>,
}

impl std::ops::Deref for MediaRef {
    type Target = CachedMedium;

    fn deref(&self) -> &CachedMedium {
        &self.value
    }
}

impl MediaRef {
    /// Escape hatch for handing the row to a worker thread.
    pub fn shared(&self) -> Arc<CachedMedium> {
        Arc::clone(&self.value)
    }
}

impl Drop for MediaRef {
    fn drop(&mut self) {
        self.cache.release(&self.value);
    }
}

impl MediaCache {
    pub fn new(family: Family) -> Arc<Self> {
        Arc::new(Self {
            family,
            entries: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Acquire a reference to the medium row, building it from the DSS on a
    /// miss. The calling thread's DSS handle performs the build.
    pub fn acquire(self: &Arc<Self>, dss: &dyn Dss, id: &ResourceId) -> Result<MediaRef> {
        enum Action {
            StartBuild,
            Wait,
            Fail { error: DssError, drained: bool },
            Take(Arc<CachedMedium>),
        }

        let mut counted = false;
        let mut entries = self.entries.lock();
        loop {
            let action = match entries.get_mut(id) {
                None => Action::StartBuild,
                Some(EntryState::Building { waiters }) => {
                    if !counted {
                        *waiters += 1;
                        counted = true;
                    }
                    Action::Wait
                }
                Some(EntryState::Failed { error, remaining }) => {
                    if counted {
                        *remaining -= 1;
                        Action::Fail {
                            error: error.clone(),
                            drained: *remaining == 0,
                        }
                    } else {
                        // Not one of the blocked callers: wait for the
                        // drain, then rebuild from scratch.
                        Action::Wait
                    }
                }
                Some(EntryState::Ready { value, refs, stale }) => {
                    if *stale {
                        // Displace the stale value; current holders keep
                        // their Arc, we become the builder of the fresh row.
                        Action::StartBuild
                    } else {
                        *refs += 1;
                        Action::Take(Arc::clone(value))
                    }
                }
            };
            match action {
                Action::StartBuild => {
                    entries.insert(id.clone(), EntryState::Building { waiters: 0 });
                    drop(entries);
                    return self.build(dss, id);
                }
                Action::Wait => self.cond.wait(&mut entries),
                Action::Fail { error, drained } => {
                    if drained {
                        entries.remove(id);
                        self.cond.notify_all();
                    }
                    return Err(error.into());
                }
                Action::Take(value) => {
                    return Ok(MediaRef {
                        cache: Arc::clone(self),
                        value,
                    })
                }
            }
        }
    }

    fn build(self: &Arc<Self>, dss: &dyn Dss, id: &ResourceId) -> Result<MediaRef> {
        let built = self.query_row(dss, id);
        let mut entries = self.entries.lock();
        let waiters = match entries.remove(id) {
            Some(EntryState::Building { waiters }) => waiters,
            // The entry cannot change under a live builder.
            _ => 0,
        };
        match built {
            Ok(medium) => {
                let value = CachedMedium::new(medium);
                // Waiters count themselves into `refs` as they wake and
                // take the entry; only the builder's reference starts here.
                entries.insert(
                    id.clone(),
                    EntryState::Ready {
                        value: Arc::clone(&value),
                        refs: 1,
                        stale: false,
                    },
                );
                self.cond.notify_all();
                Ok(MediaRef {
                    cache: Arc::clone(self),
                    value,
                })
            }
            Err(error) => {
                log::warn!("[MediaCache::acquire] build of {} failed: {}", id, error);
                if waiters > 0 {
                    entries.insert(
                        id.clone(),
                        EntryState::Failed {
                            error: error.clone(),
                            remaining: waiters,
                        },
                    );
                }
                self.cond.notify_all();
                Err(error.into())
            }
        }
    }

    fn query_row(&self, dss: &dyn Dss, id: &ResourceId) -> std::result::Result<Medium, DssError> {
        let rows = dss.media_get(&MediaFilter::one(id))?;
        let mut medium = rows
            .into_iter()
            .next()
            .ok_or_else(|| DssError::NotFound(id.clone()))?;
        medium.health = dss.medium_health(id)?;
        Ok(medium)
    }

    /// Drop one reference; a stale entry with no holders left is reclaimed.
    fn release(&self, released: &Arc<CachedMedium>) {
        let id = released.id();
        let mut entries = self.entries.lock();
        let mut reclaim = false;
        if let Some(EntryState::Ready { value, refs, stale }) = entries.get_mut(&id) {
            if Arc::ptr_eq(value, released) {
                *refs = refs.saturating_sub(1);
                reclaim = *refs == 0 && *stale;
            }
        }
        if reclaim {
            entries.remove(&id);
        }
        // A displaced Arc just drops; its storage dies with the last holder.
    }

    /// Force a rebuild on the next acquire; current holders stay valid.
    pub fn update(&self, id: &ResourceId) {
        let mut entries = self.entries.lock();
        if let Some(EntryState::Ready { stale, .. }) = entries.get_mut(id) {
            *stale = true;
        }
    }

    /// Seed an entry from a row the caller already holds (notify flows).
    pub fn insert(&self, medium: Medium) {
        let id = medium.id.clone();
        let mut entries = self.entries.lock();
        // A live builder will fetch the fresh row anyway.
        let building = matches!(
            entries.get(&id),
            Some(EntryState::Building { .. }) | Some(EntryState::Failed { .. })
        );
        if !building {
            entries.insert(
                id,
                EntryState::Ready {
                    value: CachedMedium::new(medium),
                    refs: 0,
                    stale: false,
                },
            );
        }
    }

    /// Drop an unreferenced entry (medium removal). Fails when held.
    pub fn evict(&self, id: &ResourceId) -> Result<()> {
        let mut entries = self.entries.lock();
        let removable = match entries.get(id) {
            None => return Ok(()),
            Some(EntryState::Ready { refs: 0, .. }) => true,
            Some(_) => false,
        };
        if !removable {
            return Err(LrsError::Busy(id.clone()));
        }
        entries.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dss::{DssResult, MemoryDssFactory};
    use crate::types::FsType;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn dir_medium(name: &str) -> Medium {
        let mut m = Medium::new(
            ResourceId::new(Family::Dir, name, "legacy"),
            FsType::Posix,
            2,
        );
        m.adm_status = crate::types::AdmStatus::Unlocked;
        m
    }

    /// DSS wrapper counting builds and optionally slowing them down.
    struct CountingDss {
        inner: Box<dyn Dss>,
        builds: Arc<AtomicU32>,
        delay: Duration,
    }

    impl Dss for CountingDss {
        fn media_get(&self, filter: &MediaFilter) -> DssResult<Vec<Medium>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.media_get(filter)
        }
        fn media_insert(&self, m: &Medium) -> DssResult<()> {
            self.inner.media_insert(m)
        }
        fn media_update(&self, m: &Medium) -> DssResult<()> {
            self.inner.media_update(m)
        }
        fn media_lock(
            &self,
            ids: &[ResourceId],
            owner: &crate::dss::LockOwner,
            is_early: bool,
        ) -> DssResult<()> {
            self.inner.media_lock(ids, owner, is_early)
        }
        fn media_unlock(&self, ids: &[ResourceId], owner: &crate::dss::LockOwner) -> DssResult<()> {
            self.inner.media_unlock(ids, owner)
        }
        fn media_lock_convert(
            &self,
            ids: &[ResourceId],
            owner: &crate::dss::LockOwner,
        ) -> DssResult<()> {
            self.inner.media_lock_convert(ids, owner)
        }
        fn media_lock_owner(
            &self,
            id: &ResourceId,
        ) -> DssResult<Option<crate::types::LockRecord>> {
            self.inner.media_lock_owner(id)
        }
        fn device_get(
            &self,
            filter: &crate::dss::DeviceFilter,
        ) -> DssResult<Vec<crate::types::Device>> {
            self.inner.device_get(filter)
        }
        fn device_insert(&self, d: &crate::types::Device) -> DssResult<()> {
            self.inner.device_insert(d)
        }
        fn device_update(&self, d: &crate::types::Device) -> DssResult<()> {
            self.inner.device_update(d)
        }
        fn device_lock(&self, ids: &[ResourceId], owner: &crate::dss::LockOwner) -> DssResult<()> {
            self.inner.device_lock(ids, owner)
        }
        fn device_unlock(&self, ids: &[ResourceId], owner: &crate::dss::LockOwner) -> DssResult<()> {
            self.inner.device_unlock(ids, owner)
        }
        fn medium_health(&self, id: &ResourceId) -> DssResult<u32> {
            self.inner.medium_health(id)
        }
        fn medium_health_set(&self, id: &ResourceId, health: u32) -> DssResult<()> {
            self.inner.medium_health_set(id, health)
        }
        fn object_get(&self, oid: &str) -> DssResult<crate::dss::ObjectInfo> {
            self.inner.object_get(oid)
        }
        fn object_insert(&self, o: &crate::dss::ObjectInfo) -> DssResult<()> {
            self.inner.object_insert(o)
        }
        fn deprecated_object_get(&self, oid: &str) -> DssResult<Vec<crate::dss::ObjectInfo>> {
            self.inner.deprecated_object_get(oid)
        }
        fn layout_get(&self, oid: &str) -> DssResult<crate::dss::LayoutInfo> {
            self.inner.layout_get(oid)
        }
        fn config_get(&self, section: &str, key: &str) -> DssResult<Option<String>> {
            self.inner.config_get(section, key)
        }
        fn config_set(&self, section: &str, key: &str, value: &str) -> DssResult<()> {
            self.inner.config_set(section, key, value)
        }
    }

    #[test]
    fn concurrent_acquires_run_one_builder() {
        let factory = MemoryDssFactory::new();
        factory.handle().media_insert(&dir_medium("d0")).unwrap();
        let builds = Arc::new(AtomicU32::new(0));
        let cache = MediaCache::new(Family::Dir);
        let id = ResourceId::new(Family::Dir, "d0", "legacy");

        let mut joins = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            let dss = CountingDss {
                inner: Box::new(factory.handle()),
                builds: Arc::clone(&builds),
                delay: Duration::from_millis(30),
            };
            joins.push(std::thread::spawn(move || {
                cache.acquire(&dss, &id).map(|r| r.id())
            }));
        }
        for j in joins {
            assert_eq!(j.join().unwrap().unwrap().name, "d0");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_failure_reaches_all_waiters_and_is_not_cached() {
        let factory = MemoryDssFactory::new();
        // No row inserted: every build fails with NotFound.
        let cache = MediaCache::new(Family::Dir);
        let id = ResourceId::new(Family::Dir, "missing", "legacy");

        let mut joins = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            let dss = factory.handle();
            joins.push(std::thread::spawn(move || cache.acquire(&dss, &id).err()));
        }
        for j in joins {
            assert!(j.join().unwrap().is_some());
        }

        // Nothing poisoned: a later acquire after the row exists succeeds.
        factory.handle().media_insert(&dir_medium("missing")).unwrap();
        let dss = factory.handle();
        assert!(cache.acquire(&dss, &id).is_ok());
    }

    #[test]
    fn update_keeps_current_holders_valid() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        dss.media_insert(&dir_medium("d0")).unwrap();
        let cache = MediaCache::new(Family::Dir);
        let id = ResourceId::new(Family::Dir, "d0", "legacy");

        let held = cache.acquire(&dss, &id).unwrap();
        held.record.write().stats.phys_spc_used = 42;

        cache.update(&id);
        // Holder still sees its row.
        assert_eq!(held.record.read().stats.phys_spc_used, 42);

        // New acquire rebuilds from the DSS (fresh row, used = 0).
        let fresh = cache.acquire(&dss, &id).unwrap();
        assert_eq!(fresh.record.read().stats.phys_spc_used, 0);
    }

    #[test]
    fn evict_refuses_held_entries() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        dss.media_insert(&dir_medium("d0")).unwrap();
        let cache = MediaCache::new(Family::Dir);
        let id = ResourceId::new(Family::Dir, "d0", "legacy");

        let held = cache.acquire(&dss, &id).unwrap();
        assert!(matches!(cache.evict(&id), Err(LrsError::Busy(_))));
        drop(held);
        assert!(cache.evict(&id).is_ok());
    }
}
