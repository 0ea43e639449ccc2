// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O scheduling: pluggable algorithms over per-scheduler device sets.
//!
//! Each family runs three scheduler instances (read, write, format), each
//! owning a share of the family's devices. An algorithm orders its pending
//! requests and answers the central question: which `(device, medium)` pair
//! serves the next sub-request. Devices migrate between schedulers through
//! the dispatcher, proportionally to pending work, with hysteresis (a busy
//! device is never reclaimed mid-operation).
//!
//! Algorithms register by name: `fifo` (all kinds) and `grouped_read`
//! (reads), selected per family through `io_sched_<family>` configuration.

pub mod dispatch;
pub mod fifo;
pub mod grouped_read;
pub mod read_media;

pub use dispatch::dispatch_devices;
pub use fifo::Fifo;
pub use grouped_read::GroupedRead;

use crate::cache::{CachedMedium, MediaCache};
use crate::config::WritePolicy;
use crate::device::DeviceHandle;
use crate::dss::{Dss, MediaFilter};
use crate::error::{LrsError, Result};
use crate::lock::LockCoordinator;
use crate::request::RequestContainer;
use crate::types::{DeviceState, Family, Medium, ResourceId};
use std::sync::Arc;

// ============================================================================
// Scheduler interface
// ============================================================================

/// Request kind served by one scheduler instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedKind {
    Read,
    Write,
    Format,
}

impl SchedKind {
    /// Configuration key selecting the algorithm for this kind.
    pub fn algo_key(&self) -> &'static str {
        match self {
            SchedKind::Read => "read_algo",
            SchedKind::Write => "write_algo",
            SchedKind::Format => "format_algo",
        }
    }
}

/// How the dispatcher claims a device from a scheduler.
pub enum DeviceClaim {
    /// Remove and return one (idle) device.
    Take,
    /// Return a device without removing it.
    Borrow,
    /// Swap the offered device against one of the scheduler's, preserving
    /// its share.
    Exchange(Arc<DeviceHandle>),
}

/// Everything an allocation decision may touch, owned by the calling
/// scheduler-loop thread.
pub struct SchedResources<'a> {
    pub dss: &'a dyn Dss,
    pub cache: &'a Arc<MediaCache>,
    pub locker: &'a LockCoordinator,
    pub policy: WritePolicy,
    pub family: Family,
}

/// A scheduling decision: which device executes which medium slot.
pub struct DeviceMediumPair {
    pub device: Arc<DeviceHandle>,
    /// Slot index inside the request container.
    pub medium_index: usize,
    pub medium: Arc<CachedMedium>,
}

/// Interface every scheduling algorithm exports.
pub trait IoScheduler: Send {
    fn name(&self) -> &'static str;
    fn kind(&self) -> SchedKind;

    /// Enqueue a request in the algorithm's internal ordering.
    fn push(&mut self, req: Arc<RequestContainer>);

    /// Next schedulable request, without removing it.
    fn peek(&self) -> Option<Arc<RequestContainer>>;

    /// Remove a consumed (fully dispatched or failed) request.
    fn remove(&mut self, req: &Arc<RequestContainer>);

    /// Re-insert a request after a transient failure.
    fn requeue(&mut self, req: Arc<RequestContainer>);

    /// The central decision: pick `(device, medium)` for the request's next
    /// slot. `Ok(None)` means "not now, keep waiting"; an error is
    /// definitive and fails the request.
    fn get_device_medium_pair(
        &mut self,
        res: &SchedResources<'_>,
        req: &Arc<RequestContainer>,
        is_retry: bool,
    ) -> Result<Option<DeviceMediumPair>>;

    // -- device-set management ----------------------------------------------

    fn add_device(&mut self, device: Arc<DeviceHandle>);
    fn remove_device(&mut self, id: &ResourceId) -> Option<Arc<DeviceHandle>>;
    fn claim_device(&mut self, claim: DeviceClaim) -> Option<Arc<DeviceHandle>>;
    fn devices(&self) -> &[Arc<DeviceHandle>];

    fn queue_len(&self) -> usize;
}

// ============================================================================
// Shared decision helpers
// ============================================================================

/// Rank of a device as a host for `medium`: holding it mounted beats
/// holding it loaded beats an idle empty drive beats the shortest queue.
fn device_rank(device: &DeviceHandle, medium: &ResourceId) -> (u8, usize) {
    let snap = device.snapshot();
    let holds = snap.loaded_medium.as_ref() == Some(medium);
    let class = match (holds, snap.state, device.is_idle()) {
        (true, DeviceState::Mounted, _) => 0,
        (true, DeviceState::Loaded, _) => 1,
        (false, DeviceState::Empty, true) => 2,
        (false, _, true) => 3,
        _ => 4,
    };
    (class, device.queue_len())
}

/// Best schedulable device for a medium, or `None` when every owned device
/// is failed, admin-locked or pinned to another medium by a live session.
pub fn select_device(
    devices: &[Arc<DeviceHandle>],
    medium: &ResourceId,
) -> Option<Arc<DeviceHandle>> {
    devices
        .iter()
        .filter(|d| d.is_schedulable())
        .filter(|d| d.active_sessions() == 0 || d.loaded_medium().as_ref() == Some(medium))
        .min_by_key(|d| device_rank(d, medium))
        .cloned()
}

/// True when another device currently holds the medium (exclusive
/// occupancy: one tape in one drive).
pub fn medium_is_hosted_elsewhere(
    devices: &[Arc<DeviceHandle>],
    device: &DeviceHandle,
    medium: &ResourceId,
) -> bool {
    let device_id = device.id();
    devices
        .iter()
        .any(|d| d.id() != device_id && d.loaded_medium().as_ref() == Some(medium))
}

/// Candidate filter and ordering for one write slot. Returns the candidate
/// rows in placement order (no locks taken yet).
fn write_candidates(
    res: &SchedResources<'_>,
    devices: &[Arc<DeviceHandle>],
    size: u64,
    tags: &[String],
    grouping: Option<&str>,
    library: Option<&str>,
    exclude: &[ResourceId],
) -> Result<Vec<Medium>> {
    let filter = MediaFilter {
        family: Some(res.family),
        library: library.map(|s| s.to_string()),
        names: None,
        adm_status: Some(crate::types::AdmStatus::Unlocked),
    };
    let rows = res.dss.media_get(&filter)?;

    let matching: Vec<Medium> = rows
        .into_iter()
        .filter(|m| m.is_writable())
        .filter(|m| m.matches_tags(tags))
        .filter(|m| m.matches_grouping(grouping))
        .filter(|m| !exclude.contains(&m.id))
        .collect();
    if matching.is_empty() {
        // Nothing in the catalog can ever satisfy this slot.
        return Err(LrsError::NoMediumAvailable);
    }

    let mut fitting: Vec<Medium> = matching
        .into_iter()
        .filter(|m| m.stats.phys_spc_free >= size)
        .filter(|m| m.lock.is_none())
        .collect();

    // Media already sitting in an idle drive come first; inside each class
    // the configured policy orders by free space (best fit) or by catalog
    // order (first fit).
    let loaded_idle: Vec<ResourceId> = devices
        .iter()
        .filter(|d| d.is_idle() && d.is_schedulable())
        .filter_map(|d| d.loaded_medium())
        .collect();
    match res.policy {
        WritePolicy::BestFit => {
            fitting.sort_by_key(|m| (!loaded_idle.contains(&m.id), m.stats.phys_spc_free))
        }
        WritePolicy::FirstFit => fitting.sort_by_key(|m| !loaded_idle.contains(&m.id)),
    }
    Ok(fitting)
}

/// Pick, early-lock and return the medium for one write slot.
///
/// `Ok(None)` when matching media exist but none is currently free (locked
/// elsewhere, no space right now): the request waits.
pub fn select_write_medium(
    res: &SchedResources<'_>,
    devices: &[Arc<DeviceHandle>],
    size: u64,
    tags: &[String],
    grouping: Option<&str>,
    library: Option<&str>,
    exclude: &[ResourceId],
) -> Result<Option<DeviceMediumPair>> {
    if devices.is_empty() {
        // The dispatcher has not assigned drives to this scheduler yet.
        return Ok(None);
    }
    if !devices.iter().any(|d| d.is_schedulable()) {
        return Err(LrsError::NoDeviceAvailable);
    }
    let candidates = write_candidates(res, devices, size, tags, grouping, library, exclude)?;
    for row in candidates {
        let Some(device) = select_device(devices, &row.id) else {
            // Every usable drive is pinned elsewhere right now: wait.
            continue;
        };
        if medium_is_hosted_elsewhere(devices, &device, &row.id) {
            continue;
        }
        match res.locker.early_lock_medium(res.dss, &row.id) {
            Ok(()) => {}
            Err(LrsError::LockConflict { .. }) => continue,
            Err(e) => return Err(e),
        }
        match res.cache.acquire(res.dss, &row.id) {
            Ok(entry) => {
                return Ok(Some(DeviceMediumPair {
                    device,
                    medium_index: 0,
                    medium: entry.shared(),
                }))
            }
            Err(e) => {
                res.locker.unlock_medium(res.dss, &row.id);
                return Err(e);
            }
        }
    }
    Ok(None)
}

/// Mount-state rank of a read candidate (mounted > loaded > unloaded),
/// ties broken by name for determinism.
pub fn read_candidate_rank(devices: &[Arc<DeviceHandle>], id: &ResourceId) -> (u8, String) {
    let class = devices
        .iter()
        .filter_map(|d| {
            let snap = d.snapshot();
            if snap.loaded_medium.as_ref() == Some(id) {
                Some(if snap.state == DeviceState::Mounted { 0 } else { 1 })
            } else {
                None
            }
        })
        .min()
        .unwrap_or(2);
    (class, id.name.clone())
}

/// Walk the Free section of a read request's candidates, early-lock the
/// first hostable one and swap it to Allocated.
///
/// Candidates locked by another host move to Unavailable. `Ok(None)` when
/// Free is exhausted but Unavailable entries remain (a later requeue resets
/// them); a fully errored list is a definitive failure.
pub fn select_read_medium(
    res: &SchedResources<'_>,
    devices: &[Arc<DeviceHandle>],
    req: &Arc<RequestContainer>,
) -> Result<Option<DeviceMediumPair>> {
    let list_lock = req
        .read_media
        .as_ref()
        .ok_or_else(|| LrsError::InvalidRequest("read request without candidates".into()))?;
    let mut list = list_lock.lock();

    loop {
        // Preference order over the current Free section.
        let mut free: Vec<(usize, ResourceId)> =
            list.free().iter().cloned().enumerate().collect();
        free.sort_by_key(|(_, id)| read_candidate_rank(devices, id));

        let Some((free_index, id)) = free.into_iter().next() else {
            if list.n_unavailable() > 0 {
                // Owners may go away; wait for a requeue reset.
                return Ok(None);
            }
            return Err(LrsError::NoMediumAvailable);
        };

        if devices.is_empty() {
            return Ok(None);
        }
        if !devices.iter().any(|d| d.is_schedulable()) {
            return Err(LrsError::NoDeviceAvailable);
        }
        let Some(device) = select_device(devices, &id) else {
            // Usable drives are pinned to live sessions: wait, the
            // candidate stays free.
            return Ok(None);
        };
        if medium_is_hosted_elsewhere(devices, &device, &id) {
            list.mark_unavailable(free_index);
            continue;
        }

        match res.locker.early_lock_medium(res.dss, &id) {
            Ok(()) => {}
            Err(LrsError::LockConflict { owner, .. }) => {
                log::debug!(
                    "[sched::select_read_medium] {} locked by {:?}, marking unavailable",
                    id,
                    owner
                );
                list.mark_unavailable(free_index);
                continue;
            }
            Err(e) => return Err(e),
        }

        match res.cache.acquire(res.dss, &id) {
            Ok(entry) => {
                let row_failed = entry.record.read().is_failed();
                if row_failed || !entry.record.read().is_readable() {
                    res.locker.unlock_medium(res.dss, &id);
                    list.allocate(free_index);
                    list.fail_allocated(&id);
                    continue;
                }
                list.allocate(free_index);
                return Ok(Some(DeviceMediumPair {
                    device,
                    medium_index: 0,
                    medium: entry.shared(),
                }));
            }
            Err(e) => {
                log::warn!("[sched::select_read_medium] cache build {}: {}", id, e);
                res.locker.unlock_medium(res.dss, &id);
                list.allocate(free_index);
                list.fail_allocated(&id);
                continue;
            }
        }
    }
}

/// Format decision: early-lock the single target medium; refuse when a
/// worker currently holds it mounted.
pub fn select_format_medium(
    res: &SchedResources<'_>,
    devices: &[Arc<DeviceHandle>],
    target: &ResourceId,
) -> Result<Option<DeviceMediumPair>> {
    if devices
        .iter()
        .any(|d| d.mounted_medium().as_ref() == Some(target))
    {
        return Err(LrsError::Busy(target.clone()));
    }
    if devices.is_empty() {
        return Ok(None);
    }
    if !devices.iter().any(|d| d.is_schedulable()) {
        return Err(LrsError::NoDeviceAvailable);
    }
    let Some(device) = select_device(devices, target) else {
        return Ok(None);
    };
    res.locker.early_lock_medium(res.dss, target)?;
    match res.cache.acquire(res.dss, target) {
        Ok(entry) => Ok(Some(DeviceMediumPair {
            device,
            medium_index: 0,
            medium: entry.shared(),
        })),
        Err(e) => {
            res.locker.unlock_medium(res.dss, target);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Device;

    fn handle(name: &str, state: DeviceState, medium: Option<&str>) -> Arc<DeviceHandle> {
        let mut dev = Device::new(
            ResourceId::new(Family::Tape, name, "legacy"),
            "node-test",
            format!("/dev/{}", name),
            1,
        );
        dev.state = state;
        dev.loaded_medium = medium.map(|m| ResourceId::new(Family::Tape, m, "legacy"));
        DeviceHandle::new(dev)
    }

    #[test]
    fn select_device_prefers_holder_of_the_medium() {
        let devices = vec![
            handle("d0", DeviceState::Empty, None),
            handle("d1", DeviceState::Mounted, Some("P1")),
            handle("d2", DeviceState::Loaded, Some("P2")),
        ];
        let p1 = ResourceId::new(Family::Tape, "P1", "legacy");
        assert_eq!(select_device(&devices, &p1).unwrap().id().name, "d1");

        let p2 = ResourceId::new(Family::Tape, "P2", "legacy");
        assert_eq!(select_device(&devices, &p2).unwrap().id().name, "d2");

        // Unknown medium: the empty idle drive wins.
        let p9 = ResourceId::new(Family::Tape, "P9", "legacy");
        assert_eq!(select_device(&devices, &p9).unwrap().id().name, "d0");
    }

    #[test]
    fn failed_devices_are_never_selected() {
        let mut rec = Device::new(
            ResourceId::new(Family::Tape, "d0", "legacy"),
            "node-test",
            "/dev/d0",
            1,
        );
        rec.state = DeviceState::Failed;
        rec.health = 0;
        let dev = DeviceHandle::new(rec);
        let p = ResourceId::new(Family::Tape, "P1", "legacy");
        assert!(select_device(&[dev], &p).is_none());
    }

    #[test]
    fn exclusive_occupancy_is_detected() {
        let devices = vec![
            handle("d0", DeviceState::Empty, None),
            handle("d1", DeviceState::Loaded, Some("P1")),
        ];
        let p1 = ResourceId::new(Family::Tape, "P1", "legacy");
        assert!(medium_is_hosted_elsewhere(&devices, &devices[0], &p1));
        assert!(!medium_is_hosted_elsewhere(&devices, &devices[1], &p1));
    }

    #[test]
    fn read_rank_orders_mounted_then_loaded_then_name() {
        let devices = vec![
            handle("d0", DeviceState::Mounted, Some("P2")),
            handle("d1", DeviceState::Loaded, Some("P3")),
        ];
        let rank = |name: &str| {
            read_candidate_rank(&devices, &ResourceId::new(Family::Tape, name, "legacy"))
        };
        assert!(rank("P2") < rank("P3"));
        assert!(rank("P3") < rank("P1"));
        assert!(rank("P1") < rank("P4"));
    }
}
