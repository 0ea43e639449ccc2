// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device worker: one thread per drive.
//!
//! The worker owns its drive's state machine and drains a per-device FIFO of
//! sub-requests. Scheduling is strictly serial per device; parallelism comes
//! from having many device threads. The head sub-request determines the
//! required medium: when a different medium is present the worker flushes
//! the pending sync batch, unmounts, unloads, then loads and mounts the
//! required one before executing.
//!
//! # State Machine
//!
//! ```text
//!       empty  -load->  loaded  -mount->  mounted
//!         ^               |                  |
//!         +----unload-----+                  |
//!        (any) --fail-->  failed  <---fail---+
//! ```
//!
//! Transient errors (busy, interrupted) are retried with bounded attempts
//! and exponential pacing (50 -> 100 -> 200 ms). Non-retryable errors debit
//! the relevant health counters and surface to the owning sub-request.

use crate::cache::CachedMedium;
use crate::config::SyncParams;
use crate::context::Context;
use crate::dss::Dss;
use crate::error::{LrsError, Result};
use crate::health::HealthTracker;
use crate::lock::LockCoordinator;
use crate::protocol::{ReadMediumAlloc, ReleaseKind, Request, WriteMediumAlloc};
use crate::request::{Completion, CompletionPayload, SubRequest, SubRequestKind};
use crate::sync_batch::SyncBatcher;
use crate::types::{AdmStatus, Device, DeviceState, FsStatus, Family, ResourceId};
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bounded retry attempts for transient adapter errors.
const RETRY_ATTEMPTS: u32 = 3;

/// Base pacing delay, doubled per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Idle condvar wait when no sync deadline is armed.
const IDLE_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Shared device handle
// ============================================================================

/// Shared view of one drive: record, sub-request FIFO, busy flag.
///
/// The worker thread is the only writer of the record's state machine
/// fields; the scheduler loop reads snapshots and appends sub-requests.
pub struct DeviceHandle {
    record: Mutex<Device>,
    queue: Mutex<VecDeque<SubRequest>>,
    cond: Condvar,
    busy: AtomicBool,
    /// Client sessions (allocated, not yet released) on the mounted medium.
    /// While nonzero the drive must keep its medium: exchanging it would
    /// pull the filesystem out from under a writing client.
    sessions: AtomicU32,
}

impl DeviceHandle {
    pub fn new(device: Device) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(device),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            busy: AtomicBool::new(false),
            sessions: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.record.lock().id.clone()
    }

    /// Point-in-time copy of the record (monitoring, scheduling decisions).
    pub fn snapshot(&self) -> Device {
        self.record.lock().clone()
    }

    pub fn state(&self) -> DeviceState {
        self.record.lock().state
    }

    pub fn loaded_medium(&self) -> Option<ResourceId> {
        self.record.lock().loaded_medium.clone()
    }

    /// Loaded medium when it is actually mounted.
    pub fn mounted_medium(&self) -> Option<ResourceId> {
        let rec = self.record.lock();
        if rec.state == DeviceState::Mounted {
            rec.loaded_medium.clone()
        } else {
            None
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// No sub-request in flight, no live session, an empty queue.
    pub fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
            && self.sessions.load(Ordering::Acquire) == 0
            && self.queue.lock().is_empty()
    }

    /// Live client sessions on the mounted medium.
    pub fn active_sessions(&self) -> u32 {
        self.sessions.load(Ordering::Acquire)
    }

    pub fn session_begin(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn session_end(&self) {
        // Saturating: a spurious release must not wrap the counter.
        let _ = self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    pub fn is_schedulable(&self) -> bool {
        self.record.lock().is_schedulable()
    }

    /// Force the record into the failed state (admin fail); the DSS lock
    /// stays in place until the device is removed.
    pub fn force_fail(&self) {
        let mut rec = self.record.lock();
        rec.health = 0;
        rec.adm_status = AdmStatus::Failed;
        rec.state = DeviceState::Failed;
    }

    /// Append a sub-request and wake the worker.
    pub fn push(&self, sub: SubRequest) {
        self.queue.lock().push_back(sub);
        self.cond.notify_one();
    }

    /// Wake the worker without queueing (stop flag, sync deadline).
    pub fn wake(&self) {
        self.cond.notify_one();
    }

    fn with_record_mut<R>(&self, f: impl FnOnce(&mut Device) -> R) -> R {
        f(&mut self.record.lock())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Join handle of a spawned worker thread.
pub struct WorkerJoin {
    pub handle: Arc<DeviceHandle>,
    join: JoinHandle<()>,
}

impl WorkerJoin {
    pub fn join(self) {
        if self.join.join().is_err() {
            log::error!("[DeviceWorker] worker thread panicked");
        }
    }
}

/// Spawn the worker thread for one device.
pub fn spawn_worker(
    ctx: Arc<Context>,
    handle: Arc<DeviceHandle>,
    dss: Box<dyn Dss>,
    locker: Arc<LockCoordinator>,
    completions: Sender<Completion>,
    sync_params: SyncParams,
    stop: Arc<AtomicBool>,
) -> std::io::Result<WorkerJoin> {
    let id = handle.id();
    let max_health = ctx.config().max_health();
    let worker = DeviceWorker {
        handle: Arc::clone(&handle),
        ctx,
        dss,
        locker,
        health: HealthTracker::new(max_health),
        completions,
        stop,
        batcher: SyncBatcher::new(sync_params),
        loaded: None,
    };
    let join = std::thread::Builder::new()
        .name(format!("lrs-dev-{}", id.name))
        .spawn(move || worker.run())?;
    Ok(WorkerJoin { handle, join })
}

struct DeviceWorker {
    handle: Arc<DeviceHandle>,
    ctx: Arc<Context>,
    dss: Box<dyn Dss>,
    locker: Arc<LockCoordinator>,
    health: HealthTracker,
    completions: Sender<Completion>,
    stop: Arc<AtomicBool>,
    batcher: SyncBatcher,
    /// Row of the currently loaded medium, borrowed while it stays in the
    /// drive.
    loaded: Option<Arc<CachedMedium>>,
}

impl DeviceWorker {
    fn run(mut self) {
        let id = self.handle.id();
        log::info!("[DeviceWorker::run] {} starting", id);
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if let Some(sub) = self.next_sub() {
                self.handle.busy.store(true, Ordering::Release);
                self.process(sub);
                self.handle.busy.store(false, Ordering::Release);
            }
            if self.batcher.is_due(Instant::now()) {
                self.flush_sync();
            }
        }
        self.drain();
        log::info!("[DeviceWorker::run] {} stopped", id);
    }

    /// Pop the next sub-request, sleeping until work, a sync deadline or the
    /// stop flag. The stop checks sit under the queue mutex: a sub-request
    /// enqueued after the stop flag was raised is left for the drain path.
    fn next_sub(&mut self) -> Option<SubRequest> {
        let mut queue = self.handle.queue.lock();
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        if let Some(sub) = queue.pop_front() {
            return Some(sub);
        }
        let wait = self.batcher.wait_budget(Instant::now(), IDLE_WAIT);
        let _ = self.handle.cond.wait_for(&mut queue, wait);
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        queue.pop_front()
    }

    fn send_completion(&self, sub: SubRequest, result: Result<CompletionPayload>) {
        let completion = Completion {
            device: self.handle.id(),
            sub,
            result,
        };
        if self.completions.send(completion).is_err() {
            log::warn!("[DeviceWorker] completion channel closed, dropping result");
        }
    }

    fn process(&mut self, sub: SubRequest) {
        if sub.container.is_failed() {
            // A sibling slot already failed the container; roll back the
            // reservation taken by the scheduler.
            self.locker.unlock_medium(&*self.dss, &sub.medium_id());
            return;
        }
        match self.execute(&sub) {
            Ok(Some(payload)) => self.send_completion(sub, Ok(payload)),
            // Parked in the sync batch; the completion leaves at sync time.
            Ok(None) => {}
            Err(e) => {
                log::warn!(
                    "[DeviceWorker::process] {} sub-request on {} failed: {}",
                    self.handle.id(),
                    sub.medium_id(),
                    e
                );
                self.locker.unlock_medium(&*self.dss, &sub.medium_id());
                self.send_completion(sub, Err(e));
            }
        }
    }

    fn execute(&mut self, sub: &SubRequest) -> Result<Option<CompletionPayload>> {
        match sub.kind.clone() {
            SubRequestKind::WriteAlloc { size } => self.exec_write_alloc(sub, size).map(Some),
            SubRequestKind::ReadAlloc => self.exec_read_alloc(sub).map(Some),
            SubRequestKind::Format { fs, unlock, force } => {
                self.exec_format(sub, fs, unlock, force).map(Some)
            }
            SubRequestKind::Release {
                size_written,
                nb_extents_written,
                to_sync,
                partial,
            } => self.exec_release(sub, size_written, nb_extents_written, to_sync, partial),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    fn exec_write_alloc(&mut self, sub: &SubRequest, size: u64) -> Result<CompletionPayload> {
        let mount_point = self.ensure_mounted(&sub.medium)?;
        let space = self.refresh_stats(&sub.medium, &mount_point)?;

        if space.read_only {
            // Quota or read-only remount: stop placing writes here, keep
            // the health untouched.
            self.set_put_flag(&sub.medium, false);
            return Err(LrsError::ReadOnly);
        }
        if space.free < size {
            return Err(LrsError::NoSpace);
        }

        let id = sub.medium_id();
        self.locker.convert_medium_lock(&*self.dss, &id)?;
        let (fs_type, addr_type) = {
            let row = sub.medium.record.read();
            (row.fs_type, row.addr_type)
        };
        self.handle.session_begin();
        Ok(CompletionPayload::Write(WriteMediumAlloc {
            medium: id,
            root_path: mount_point.to_string_lossy().into_owned(),
            fs_type,
            addr_type,
            avail_size: space.free,
        }))
    }

    fn exec_read_alloc(&mut self, sub: &SubRequest) -> Result<CompletionPayload> {
        let mount_point = self.ensure_mounted(&sub.medium)?;
        let id = sub.medium_id();
        self.locker.convert_medium_lock(&*self.dss, &id)?;
        let (fs_type, addr_type) = {
            let row = sub.medium.record.read();
            (row.fs_type, row.addr_type)
        };
        self.handle.session_begin();
        Ok(CompletionPayload::Read(ReadMediumAlloc {
            medium: id,
            root_path: mount_point.to_string_lossy().into_owned(),
            fs_type,
            addr_type,
        }))
    }

    fn exec_format(
        &mut self,
        sub: &SubRequest,
        fs: crate::types::FsType,
        unlock: bool,
        force: bool,
    ) -> Result<CompletionPayload> {
        let id = sub.medium_id();
        {
            let row = sub.medium.record.read();
            if row.fs_status != FsStatus::Blank && !force {
                return Err(LrsError::AlreadyInitialized(format!(
                    "filesystem on {}",
                    id
                )));
            }
        }

        self.ensure_loaded(&sub.medium)?;
        let fs_adapter = self.ctx.adapters().fs(fs)?;
        let device_path = self.fs_device_path(&sub.medium);
        let label = id.name.replace('/', "_");

        let format_result = self.with_retry("format", || fs_adapter.format(&device_path, &label));
        if let Err(e) = format_result {
            self.debit_medium(&sub.medium);
            return Err(e);
        }

        {
            let mut row = sub.medium.record.write();
            row.fs_type = fs;
            row.fs_status = FsStatus::Empty;
            if unlock {
                row.adm_status = AdmStatus::Unlocked;
            }
        }
        self.push_row(&sub.medium);
        // The format session ends here; give the reservation back.
        self.locker.unlock_medium(&*self.dss, &id);
        log::info!("[DeviceWorker::format] {} formatted as {}", id, fs.as_str());
        Ok(CompletionPayload::Format)
    }

    fn exec_release(
        &mut self,
        sub: &SubRequest,
        size_written: u64,
        nb_extents_written: u32,
        to_sync: bool,
        partial: bool,
    ) -> Result<Option<CompletionPayload>> {
        let id = sub.medium_id();
        let is_write = matches!(
            &sub.container.req,
            Request::Release(r) if r.kind == ReleaseKind::Write
        );

        if is_write && size_written > 0 {
            let mut row = sub.medium.record.write();
            row.stats.phys_spc_used = row.stats.phys_spc_used.saturating_add(size_written);
            row.stats.phys_spc_free = row.stats.phys_spc_free.saturating_sub(size_written);
            row.stats.nb_obj = row.stats.nb_obj.saturating_add(u64::from(nb_extents_written));
            row.dirty_copies += 1;
        }
        if is_write {
            self.push_row(&sub.medium);
        }

        if is_write && to_sync && !partial {
            // Parked until the next sync point; the acknowledgement follows
            // the sync in arrival order.
            self.batcher.push(
                SubRequest {
                    container: Arc::clone(&sub.container),
                    medium_index: sub.medium_index,
                    kind: sub.kind.clone(),
                    medium: Arc::clone(&sub.medium),
                },
                size_written,
            );
            return Ok(None);
        }

        if !partial {
            // Session over: the medium lock goes back.
            self.locker.unlock_medium(&*self.dss, &id);
            self.handle.session_end();
        }
        Ok(Some(CompletionPayload::Release { medium: id }))
    }

    // ------------------------------------------------------------------------
    // Sync batching
    // ------------------------------------------------------------------------

    /// Sync the mounted medium and acknowledge the whole pending batch.
    fn flush_sync(&mut self) {
        if self.batcher.is_empty() {
            return;
        }
        let batch = self.batcher.take_batch();
        let sync_result = self.do_sync();
        match sync_result {
            Ok(()) => {
                log::debug!(
                    "[DeviceWorker::flush_sync] {} synced, acking {} releases",
                    self.handle.id(),
                    batch.len()
                );
                for sub in batch {
                    let id = sub.medium_id();
                    {
                        let mut row = sub.medium.record.write();
                        row.dirty_copies = 0;
                    }
                    self.push_row(&sub.medium);
                    self.locker.unlock_medium(&*self.dss, &id);
                    self.handle.session_end();
                    self.send_completion(sub, Ok(CompletionPayload::Release { medium: id.clone() }));
                }
            }
            Err(e) => {
                // In-flight writes may be lost: the medium is failed outright.
                log::error!(
                    "[DeviceWorker::flush_sync] {} sync failed: {}; failing medium",
                    self.handle.id(),
                    e
                );
                for sub in batch {
                    let id = sub.medium_id();
                    self.fail_medium(&sub.medium);
                    self.handle.session_end();
                    self.send_completion(sub, Err(LrsError::MediumFailed(id)));
                }
            }
        }
    }

    fn do_sync(&mut self) -> Result<()> {
        let Some(loaded) = self.loaded.clone() else {
            return Err(LrsError::InvalidRequest(
                "sync batch with no loaded medium".into(),
            ));
        };
        let Some(mount_point) = self.handle.record.lock().mount_point.clone() else {
            return Err(LrsError::InvalidRequest(
                "sync batch with no mounted medium".into(),
            ));
        };
        let fs_type = loaded.record.read().fs_type;
        let fs_adapter = self.ctx.adapters().fs(fs_type)?;
        self.with_retry("sync", || fs_adapter.sync(&mount_point))?;
        // Refresh the accounting from the filesystem after the barrier.
        let _ = self.refresh_stats(&loaded, &mount_point);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Medium exchange (load / mount / umount / unload)
    // ------------------------------------------------------------------------

    /// Bring `medium` mounted on this drive, exchanging the current medium
    /// when needed. Returns the mount point.
    fn ensure_mounted(&mut self, medium: &Arc<CachedMedium>) -> Result<PathBuf> {
        let needed = medium.id();
        {
            let rec = self.handle.record.lock();
            if rec.state == DeviceState::Failed {
                return Err(LrsError::DeviceFailed(rec.id.clone()));
            }
            if rec.state == DeviceState::Mounted && rec.loaded_medium.as_ref() == Some(&needed) {
                if let Some(mp) = rec.mount_point.clone() {
                    return Ok(mp);
                }
            }
        }
        self.ensure_loaded(medium)?;
        self.mount(medium)
    }

    /// Bring `medium` loaded (not necessarily mounted) on this drive.
    fn ensure_loaded(&mut self, medium: &Arc<CachedMedium>) -> Result<()> {
        let needed = medium.id();
        let (state, current) = {
            let rec = self.handle.record.lock();
            if rec.state == DeviceState::Failed {
                return Err(LrsError::DeviceFailed(rec.id.clone()));
            }
            (rec.state, rec.loaded_medium.clone())
        };

        if current.as_ref() == Some(&needed) {
            if state == DeviceState::Mounted {
                self.umount()?;
            }
            return Ok(());
        }

        // A different medium occupies the drive.
        if state == DeviceState::Mounted {
            self.umount()?;
        }
        if self.handle.state() == DeviceState::Loaded {
            self.unload()?;
        }
        self.load(medium)
    }

    fn load(&mut self, medium: &Arc<CachedMedium>) -> Result<()> {
        let id = medium.id();
        let (dev_id, dev_path) = {
            let rec = self.handle.record.lock();
            (rec.id.clone(), rec.path.clone())
        };
        let library = self.ctx.adapters().library(dev_id.family)?;
        let dev_adapter = self.ctx.adapters().device(dev_id.family)?;

        let moved = self.with_retry("load", || {
            let source = library.media_lookup(&id.name)?;
            let dest = library.drive_lookup(&dev_path)?;
            library.media_move(source, dest)?;
            dev_adapter.load(&dev_path, &id.name)
        });
        if let Err(e) = moved {
            self.debit_medium(medium);
            self.debit_device();
            return Err(e);
        }

        self.handle.with_record_mut(|rec| {
            rec.state = DeviceState::Loaded;
            rec.loaded_medium = Some(id.clone());
        });
        self.loaded = Some(Arc::clone(medium));
        self.push_device_row();
        log::debug!("[DeviceWorker::load] {} loaded on {}", id, dev_id);
        Ok(())
    }

    fn mount(&mut self, medium: &Arc<CachedMedium>) -> Result<PathBuf> {
        let id = medium.id();
        let fs_type = medium.record.read().fs_type;
        let fs_adapter = self.ctx.adapters().fs(fs_type)?;
        let mount_point = self.mount_point_for(&id);
        let device_path = self.fs_device_path(medium);

        let mounted =
            self.with_retry("mount", || fs_adapter.mount(&device_path, &mount_point));
        if let Err(e) = mounted {
            self.debit_medium(medium);
            let failed = medium.record.read().is_failed();
            return Err(if failed { LrsError::MediumFailed(id) } else { e });
        }

        self.handle.with_record_mut(|rec| {
            rec.state = DeviceState::Mounted;
            rec.mount_point = Some(mount_point.clone());
        });
        self.push_device_row();

        match self.refresh_stats(medium, &mount_point) {
            Ok(space) if space.read_only => self.set_put_flag(medium, false),
            Ok(_) => {}
            Err(e) => log::warn!("[DeviceWorker::mount] statfs {}: {}", id, e),
        }
        log::debug!(
            "[DeviceWorker::mount] {} mounted at {}",
            id,
            mount_point.display()
        );
        Ok(mount_point)
    }

    fn umount(&mut self) -> Result<()> {
        // Pending acknowledgements must not outlive the mount.
        self.flush_sync();

        let Some(loaded) = self.loaded.clone() else {
            return Ok(());
        };
        let Some(mount_point) = self.handle.record.lock().mount_point.clone() else {
            return Ok(());
        };
        let fs_type = loaded.record.read().fs_type;
        let fs_adapter = self.ctx.adapters().fs(fs_type)?;
        let device_path = self.fs_device_path(&loaded);

        let done = self.with_retry("umount", || fs_adapter.umount(&device_path, &mount_point));
        if let Err(e) = done {
            self.debit_medium(&loaded);
            return Err(e);
        }
        self.handle.with_record_mut(|rec| {
            rec.state = DeviceState::Loaded;
            rec.mount_point = None;
        });
        self.push_device_row();
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        let Some(loaded) = self.loaded.clone() else {
            return Ok(());
        };
        let id = loaded.id();
        let (dev_id, dev_path) = {
            let rec = self.handle.record.lock();
            (rec.id.clone(), rec.path.clone())
        };
        let library = self.ctx.adapters().library(dev_id.family)?;
        let dev_adapter = self.ctx.adapters().device(dev_id.family)?;

        let done = self.with_retry("unload", || {
            dev_adapter.eject(&dev_path)?;
            let source = library.drive_lookup(&dev_path)?;
            let dest = library.media_lookup(&id.name)?;
            library.media_move(source, dest)
        });
        if let Err(e) = done {
            self.debit_medium(&loaded);
            self.debit_device();
            return Err(e);
        }

        self.handle.with_record_mut(|rec| {
            rec.state = DeviceState::Empty;
            rec.loaded_medium = None;
        });
        self.loaded = None;
        self.push_device_row();
        log::debug!("[DeviceWorker::unload] {} ejected from {}", id, dev_id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Mount point under the configured prefix.
    fn mount_point_for(&self, id: &ResourceId) -> PathBuf {
        let prefix = self.ctx.config().mount_prefix();
        PathBuf::from(format!("{}{}", prefix, id.name.replace('/', "_")))
    }

    /// Drive-side path the filesystem adapter operates on. Directory media
    /// are their own device; other families go through the drive node.
    fn fs_device_path(&self, medium: &Arc<CachedMedium>) -> String {
        let row = medium.record.read();
        if row.id.family == Family::Dir {
            row.id.name.clone()
        } else {
            self.handle.record.lock().path.clone()
        }
    }

    /// statfs the mount point and fold the result into the medium row.
    fn refresh_stats(
        &self,
        medium: &Arc<CachedMedium>,
        mount_point: &std::path::Path,
    ) -> Result<crate::adapters::FsSpace> {
        let fs_type = medium.record.read().fs_type;
        let fs_adapter = self.ctx.adapters().fs(fs_type)?;
        let space = fs_adapter.statfs(mount_point)?;
        {
            let mut row = medium.record.write();
            row.stats.phys_spc_used = space.used;
            row.stats.phys_spc_free = space.free;
        }
        self.push_row(medium);
        Ok(space)
    }

    fn set_put_flag(&self, medium: &Arc<CachedMedium>, put: bool) {
        {
            let mut row = medium.record.write();
            if row.flags.put == put {
                return;
            }
            row.flags.put = put;
            if !put {
                row.fs_status = FsStatus::Full;
            }
        }
        log::warn!(
            "[DeviceWorker::set_put_flag] {} switched to read-only",
            medium.id()
        );
        self.push_row(medium);
    }

    /// Persist the medium row (best effort; the DSS refreshes it anyway on
    /// the next cache rebuild).
    fn push_row(&self, medium: &Arc<CachedMedium>) {
        let row = medium.record.read().clone();
        if let Err(e) = self.dss.media_update(&row) {
            log::warn!("[DeviceWorker::push_row] {}: {}", row.id, e);
        }
    }

    fn push_device_row(&self) {
        let row = self.handle.record.lock().clone();
        if let Err(e) = self.dss.device_update(&row) {
            log::warn!("[DeviceWorker::push_device_row] {}: {}", row.id, e);
        }
    }

    fn debit_medium(&self, medium: &Arc<CachedMedium>) {
        let mut row = medium.record.write();
        let health = self
            .health
            .decrease_medium(&*self.dss, self.locker.owner(), &mut row);
        log::warn!(
            "[DeviceWorker::debit_medium] {} health now {}",
            row.id,
            health
        );
    }

    fn fail_medium(&self, medium: &Arc<CachedMedium>) {
        let mut row = medium.record.write();
        while row.health > 0 {
            self.health
                .decrease_medium(&*self.dss, self.locker.owner(), &mut row);
        }
    }

    fn debit_device(&self) {
        self.handle.with_record_mut(|rec| {
            let health = self.health.decrease_device(&*self.dss, rec);
            log::warn!(
                "[DeviceWorker::debit_device] {} health now {}",
                rec.id,
                health
            );
        });
    }

    fn with_retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    log::debug!(
                        "[DeviceWorker::with_retry] {} attempt {} failed ({}), pacing {:?}",
                        what,
                        attempt,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn drain(&mut self) {
        // 1. Pending acknowledgements leave before anything is torn down.
        self.flush_sync();

        // 2. Outstanding sub-requests are failed with ESHUTDOWN.
        let outstanding: Vec<SubRequest> = {
            let mut queue = self.handle.queue.lock();
            queue.drain(..).collect()
        };
        for sub in outstanding {
            self.locker.unlock_medium(&*self.dss, &sub.medium_id());
            self.send_completion(sub, Err(LrsError::Shutdown));
        }

        // 3. Leave the drive empty when it is safe to do so.
        if self.handle.state() == DeviceState::Mounted {
            if let Err(e) = self.umount() {
                log::warn!("[DeviceWorker::drain] umount: {}", e);
            }
        }
        if self.handle.state() == DeviceState::Loaded {
            if let Err(e) = self.unload() {
                log::warn!("[DeviceWorker::drain] unload: {}", e);
            }
        }
        if let Some(loaded) = self.loaded.take() {
            self.locker.unlock_medium(&*self.dss, &loaded.id());
        }
        self.handle.sessions.store(0, Ordering::Release);
    }
}

fn is_transient(e: &LrsError) -> bool {
    match e {
        LrsError::Busy(_) => true,
        LrsError::Dss(crate::dss::DssError::Connection(_)) => true,
        LrsError::Io(io) => matches!(
            io.raw_os_error(),
            Some(code) if code == libc::EAGAIN || code == libc::EBUSY || code == libc::EINTR
        ),
        _ => false,
    }
}
