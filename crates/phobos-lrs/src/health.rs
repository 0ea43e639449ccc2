// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Health counters: decrement-on-error, fail-and-release at zero.
//!
//! Every device and medium carries an integer health in `[0, max_health]`.
//! Successful operations credit it back (saturating); non-retryable failures
//! debit it. A medium reaching zero is failed and its DSS lock released so
//! another host can still read surviving copies elsewhere; a device reaching
//! zero is failed locally and keeps its lock until an admin removes it.

use crate::dss::{Dss, LockOwner};
use crate::types::{AdmStatus, Device, DeviceState, Medium};

/// Applies health credit/debit and the fail-at-zero transitions.
#[derive(Clone, Copy, Debug)]
pub struct HealthTracker {
    max_health: u32,
}

impl HealthTracker {
    pub fn new(max_health: u32) -> Self {
        Self {
            max_health: max_health.max(1),
        }
    }

    pub fn max_health(&self) -> u32 {
        self.max_health
    }

    /// Saturating credit after a successful operation.
    pub fn increase_medium(&self, dss: &dyn Dss, medium: &mut Medium) -> u32 {
        if medium.adm_status == AdmStatus::Failed {
            return medium.health;
        }
        let next = (medium.health + 1).min(self.max_health);
        if next != medium.health {
            medium.health = next;
            if let Err(e) = dss.medium_health_set(&medium.id, next) {
                log::warn!("[HealthTracker::increase_medium] {}: {}", medium.id, e);
            }
        }
        medium.health
    }

    /// Debit after a non-retryable failure; at zero the medium is failed and
    /// its DSS lock released. Returns the new health.
    pub fn decrease_medium(
        &self,
        dss: &dyn Dss,
        owner: &LockOwner,
        medium: &mut Medium,
    ) -> u32 {
        if medium.health == 0 {
            return 0;
        }
        medium.health -= 1;
        if let Err(e) = dss.medium_health_set(&medium.id, medium.health) {
            log::warn!("[HealthTracker::decrease_medium] {}: {}", medium.id, e);
        }
        if medium.health == 0 {
            log::error!(
                "[HealthTracker::decrease_medium] {} exhausted its health, failing it",
                medium.id
            );
            medium.adm_status = AdmStatus::Failed;
            if let Err(e) = dss.media_update(medium) {
                log::warn!("[HealthTracker::decrease_medium] {}: {}", medium.id, e);
            }
            match dss.media_unlock(&[medium.id.clone()], owner) {
                Ok(()) => medium.lock = None,
                // Not locked by us right now: nothing to release.
                Err(crate::dss::DssError::NotLocked(_)) => {}
                Err(e) => {
                    log::warn!("[HealthTracker::decrease_medium] unlock {}: {}", medium.id, e)
                }
            }
        }
        medium.health
    }

    /// Saturating credit for a device.
    pub fn increase_device(&self, dss: &dyn Dss, device: &mut Device) -> u32 {
        if device.is_failed() {
            return device.health;
        }
        let next = (device.health + 1).min(self.max_health);
        if next != device.health {
            device.health = next;
            if let Err(e) = dss.device_update(device) {
                log::warn!("[HealthTracker::increase_device] {}: {}", device.id, e);
            }
        }
        device.health
    }

    /// Debit for a device; at zero the device transitions to failed locally.
    /// Its DSS lock is retained until the admin removes the device.
    pub fn decrease_device(&self, dss: &dyn Dss, device: &mut Device) -> u32 {
        if device.health == 0 {
            return 0;
        }
        device.health -= 1;
        if device.health == 0 {
            log::error!(
                "[HealthTracker::decrease_device] {} exhausted its health, failing it",
                device.id
            );
            device.state = DeviceState::Failed;
        }
        if let Err(e) = dss.device_update(device) {
            log::warn!("[HealthTracker::decrease_device] {}: {}", device.id, e);
        }
        device.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dss::{Dss, MemoryDssFactory};
    use crate::types::{Family, FsType, ResourceId};

    fn setup() -> (MemoryDssFactory, Medium, LockOwner) {
        let factory = MemoryDssFactory::new();
        let id = ResourceId::new(Family::Tape, "P00001", "legacy");
        let mut medium = Medium::new(id.clone(), FsType::Ltfs, 2);
        medium.adm_status = AdmStatus::Unlocked;
        factory.handle().media_insert(&medium).unwrap();
        let owner = LockOwner::new("node-a", 42);
        factory
            .handle()
            .media_lock(&[id], &owner, false)
            .unwrap();
        (factory, medium, owner)
    }

    #[test]
    fn two_failures_fail_the_medium_and_release_its_lock() {
        let (factory, mut medium, owner) = setup();
        let dss = factory.handle();
        let tracker = HealthTracker::new(2);

        assert_eq!(tracker.decrease_medium(&dss, &owner, &mut medium), 1);
        assert_eq!(medium.adm_status, AdmStatus::Unlocked);
        assert!(dss.media_lock_owner(&medium.id).unwrap().is_some());

        assert_eq!(tracker.decrease_medium(&dss, &owner, &mut medium), 0);
        assert!(medium.is_failed());
        assert!(dss.media_lock_owner(&medium.id).unwrap().is_none());
        assert_eq!(dss.medium_health(&medium.id).unwrap(), 0);
    }

    #[test]
    fn increase_saturates_at_max() {
        let (factory, mut medium, _) = setup();
        let dss = factory.handle();
        let tracker = HealthTracker::new(2);
        assert_eq!(tracker.increase_medium(&dss, &mut medium), 2);
        assert_eq!(tracker.increase_medium(&dss, &mut medium), 2);
    }

    #[test]
    fn decrease_at_zero_stays_zero() {
        let (factory, mut medium, owner) = setup();
        let dss = factory.handle();
        let tracker = HealthTracker::new(2);
        tracker.decrease_medium(&dss, &owner, &mut medium);
        tracker.decrease_medium(&dss, &owner, &mut medium);
        assert_eq!(tracker.decrease_medium(&dss, &owner, &mut medium), 0);
    }

    #[test]
    fn failed_device_keeps_its_lock() {
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        let id = ResourceId::new(Family::Tape, "drive0", "legacy");
        let mut device = Device::new(id.clone(), "node-a", "/dev/st0", 1);
        dss.device_insert(&device).unwrap();
        let owner = LockOwner::new("node-a", 42);
        dss.device_lock(&[id.clone()], &owner).unwrap();

        let tracker = HealthTracker::new(1);
        assert_eq!(tracker.decrease_device(&dss, &mut device), 0);
        assert_eq!(device.state, DeviceState::Failed);

        // The device lock is deliberately retained.
        let rows = dss
            .device_get(&crate::dss::DeviceFilter::one(&device.id))
            .unwrap();
        assert_eq!(rows[0].lock.as_ref().unwrap().hostname, "node-a");
    }
}
