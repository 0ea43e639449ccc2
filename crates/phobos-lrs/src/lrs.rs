// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Family scheduler loops and daemon core assembly.
//!
//! [`Lrs::new`] wires the whole daemon: it binds the request socket, locks
//! this host's devices in the DSS, spawns one worker thread per device, one
//! scheduler-loop thread per family and the router thread. Each family loop
//! runs the iteration of spec fame:
//!
//! 1. drain inbound requests into the per-kind schedulers;
//! 2. rebalance device ownership across schedulers;
//! 3. walk schedulers in priority order (write > read > format, read
//!    elevated every K iterations) and hand `(device, medium)` sub-requests
//!    to workers;
//! 4. collect completions, assemble responses, emit through the router;
//! 5. sleep on the request channel with a short bounded timeout.
//!
//! Requests from one client are scheduled FIFO within a kind; across kinds
//! no ordering is promised.

use crate::cache::MediaCache;
use crate::context::Context;
use crate::device::{spawn_worker, WorkerJoin};
use crate::dss::{DeviceFilter, Dss, DssFactory};
use crate::error::{LrsError, Result};
use crate::lock::LockCoordinator;
use crate::protocol::{NotifyOp, ReleaseKind, Request, Response};
use crate::registry::Registry;
use crate::request::{
    Completion, CompletionPayload, OutboundResponse, RequestContainer, SubRequest, SubRequestKind,
};
use crate::router::spawn_router;
use crate::sched::{
    dispatch_devices, Fifo, GroupedRead, IoScheduler, SchedKind, SchedResources,
};
use crate::transport::{ListenAddr, SocketServer};
use crate::types::{Family, ResourceId};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Transient scheduling failures tolerated before a write request is failed.
const WRITE_RETRY_MAX: u32 = 3;

// ============================================================================
// Daemon core
// ============================================================================

/// The assembled daemon core.
pub struct Lrs {
    ctx: Arc<Context>,
    server: Arc<SocketServer>,
    stop: Arc<AtomicBool>,
    router_join: Option<JoinHandle<()>>,
    family_joins: Vec<JoinHandle<()>>,
    dss_factory: Arc<dyn DssFactory>,
    locker: Arc<LockCoordinator>,
    locked_devices: Vec<ResourceId>,
}

impl Lrs {
    /// Assemble and start the daemon: socket, device locks, workers, family
    /// loops, router.
    pub fn new(
        ctx: Arc<Context>,
        dss_factory: Arc<dyn DssFactory>,
        listen: ListenAddr,
    ) -> Result<Lrs> {
        let stop = Arc::new(AtomicBool::new(false));
        let server = Arc::new(SocketServer::bind(listen)?);
        let locker = Arc::new(LockCoordinator::new(ctx.owner().clone()));

        let (resp_tx, resp_rx) = unbounded::<OutboundResponse>();
        let mut family_txs = HashMap::new();
        let mut family_joins = Vec::new();
        let mut locked_devices = Vec::new();

        let families = ctx.config().families();
        if families.is_empty() {
            return Err(LrsError::InvalidRequest(
                "no family configured for this daemon".into(),
            ));
        }
        for family in families {
            let dss = dss_factory.connect()?;
            let rows = dss.device_get(&DeviceFilter::for_host(
                family,
                ctx.owner().hostname.clone(),
            ))?;
            let ids: Vec<ResourceId> = rows.iter().map(|d| d.id.clone()).collect();
            locker.lock_devices(&*dss, &ids)?;
            locked_devices.extend(ids);

            let (req_tx, req_rx) = unbounded();
            family_txs.insert(family, req_tx);
            let family_loop = FamilyLoop::start(
                family,
                Arc::clone(&ctx),
                Arc::clone(&dss_factory),
                dss,
                Arc::clone(&locker),
                rows,
                req_rx,
                resp_tx.clone(),
                Arc::clone(&stop),
            )?;
            family_joins.push(family_loop);
        }
        drop(resp_tx);

        let router_join = spawn_router(
            Arc::clone(&ctx),
            dss_factory.connect()?,
            Arc::clone(&server),
            family_txs,
            resp_rx,
            Arc::clone(&stop),
        )?;

        log::info!(
            "[Lrs::new] daemon up as {}:{}",
            ctx.owner().hostname,
            ctx.owner().pid
        );
        Ok(Lrs {
            ctx,
            server,
            stop,
            router_join: Some(router_join),
            family_joins,
            dss_factory,
            locker,
            locked_devices,
        })
    }

    /// Flag polled by every loop; raise it from a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Block until the stop flag is raised, then tear everything down.
    pub fn run(mut self) {
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(100));
        }
        self.teardown();
    }

    /// Orderly teardown: family loops (which drain their workers) first,
    /// then the router, the socket and the device locks.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        self.teardown();
    }

    fn teardown(&mut self) {
        self.stop.store(true, Ordering::Release);
        for join in self.family_joins.drain(..) {
            if join.join().is_err() {
                log::error!("[Lrs::teardown] family loop panicked");
            }
        }
        if let Some(join) = self.router_join.take() {
            if join.join().is_err() {
                log::error!("[Lrs::teardown] router panicked");
            }
        }
        match self.dss_factory.connect() {
            Ok(dss) => self.locker.unlock_devices(&*dss, &self.locked_devices),
            Err(e) => log::warn!("[Lrs::teardown] device unlock skipped: {}", e),
        }
        if let Some(server) = Arc::get_mut(&mut self.server) {
            server.shutdown();
        }
        log::info!("[Lrs::teardown] daemon stopped");
    }
}

// ============================================================================
// Family loop
// ============================================================================

struct WorkerBundle {
    stop: Arc<AtomicBool>,
    join: Option<WorkerJoin>,
}

struct FamilyLoop {
    family: Family,
    ctx: Arc<Context>,
    dss_factory: Arc<dyn DssFactory>,
    dss: Box<dyn Dss>,
    locker: Arc<LockCoordinator>,
    cache: Arc<MediaCache>,
    /// Device handle catalog (C1); `workers` only tracks thread lifecycle.
    registry: Registry,
    scheds: [Option<Box<dyn IoScheduler>>; 3],
    workers: HashMap<ResourceId, WorkerBundle>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    req_rx: Receiver<Arc<RequestContainer>>,
    resp_tx: Sender<OutboundResponse>,
    /// Media with a live allocation session (write or read).
    sessions: HashSet<ResourceId>,
    iteration: u64,
    read_boost_every: u32,
    sched_retry: Duration,
    stop: Arc<AtomicBool>,
}

/// Index into `FamilyLoop::scheds`.
fn sched_index(kind: SchedKind) -> usize {
    match kind {
        SchedKind::Write => 0,
        SchedKind::Read => 1,
        SchedKind::Format => 2,
    }
}

/// Build the configured algorithm for one kind; unknown names fall back to
/// fifo with a warning.
fn build_scheduler(ctx: &Context, family: Family, kind: SchedKind) -> Box<dyn IoScheduler> {
    let algo = ctx.config().io_sched_algo(family, kind.algo_key());
    match (algo.as_str(), kind) {
        ("fifo", _) => Box::new(Fifo::new(kind)),
        ("grouped_read", SchedKind::Read) => Box::new(GroupedRead::new()),
        (other, _) => {
            log::warn!(
                "[FamilyLoop] unknown {} algorithm '{}' for {}, using fifo",
                kind.algo_key(),
                other,
                family
            );
            Box::new(Fifo::new(kind))
        }
    }
}

impl FamilyLoop {
    #[allow(clippy::too_many_arguments)]
    fn start(
        family: Family,
        ctx: Arc<Context>,
        dss_factory: Arc<dyn DssFactory>,
        dss: Box<dyn Dss>,
        locker: Arc<LockCoordinator>,
        devices: Vec<crate::types::Device>,
        req_rx: Receiver<Arc<RequestContainer>>,
        resp_tx: Sender<OutboundResponse>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let (completions_tx, completions_rx) = unbounded();
        let cfg = ctx.config();
        let mut family_loop = FamilyLoop {
            family,
            cache: ctx.cache(family),
            registry: Registry::new(family),
            scheds: [
                Some(build_scheduler(&ctx, family, SchedKind::Write)),
                Some(build_scheduler(&ctx, family, SchedKind::Read)),
                Some(build_scheduler(&ctx, family, SchedKind::Format)),
            ],
            workers: HashMap::new(),
            completions_tx,
            completions_rx,
            req_rx,
            resp_tx,
            sessions: HashSet::new(),
            iteration: 0,
            read_boost_every: cfg.read_boost_every(),
            sched_retry: cfg.sched_retry(),
            ctx,
            dss_factory,
            dss,
            locker,
            stop,
        };
        for device in devices {
            family_loop.spawn_device(device)?;
        }
        let name = format!("lrs-{}", family.as_str());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || family_loop.run())
            .map_err(LrsError::from)
    }

    /// Register the device, spawn its worker and give the drive to the
    /// write scheduler (the dispatcher rebalances from there).
    fn spawn_device(&mut self, device: crate::types::Device) -> Result<()> {
        let id = device.id.clone();
        let handle = self.registry.add_device(&*self.dss, device)?;
        let worker_stop = Arc::new(AtomicBool::new(false));
        let join = spawn_worker(
            Arc::clone(&self.ctx),
            Arc::clone(&handle),
            self.dss_factory.connect()?,
            Arc::clone(&self.locker),
            self.completions_tx.clone(),
            self.ctx.config().sync_params(self.family),
            Arc::clone(&worker_stop),
        )?;
        if let Some(sched) = self.scheds[sched_index(SchedKind::Write)].as_mut() {
            sched.add_device(handle);
        }
        self.workers.insert(
            id,
            WorkerBundle {
                stop: worker_stop,
                join: Some(join),
            },
        );
        Ok(())
    }

    fn run(mut self) {
        log::info!(
            "[FamilyLoop::run] {} loop up with {} devices",
            self.family,
            self.registry.len()
        );
        loop {
            // 1. Ingest, sleeping up to the poll timeout for the first one.
            match self.req_rx.recv_timeout(self.sched_retry) {
                Ok(container) => self.ingest(container),
                Err(_) => {}
            }
            while let Ok(container) = self.req_rx.try_recv() {
                self.ingest(container);
            }

            // 2. Completions feed response assembly and retries.
            while let Ok(completion) = self.completions_rx.try_recv() {
                self.handle_completion(completion);
            }

            // 3. Rebalance drives over pending work.
            self.dispatch();

            // 4. Schedule, priority-ordered with periodic read elevation.
            self.iteration += 1;
            let order = if self.iteration % u64::from(self.read_boost_every) == 0 {
                [SchedKind::Read, SchedKind::Write, SchedKind::Format]
            } else {
                [SchedKind::Write, SchedKind::Read, SchedKind::Format]
            };
            for kind in order {
                self.schedule_kind(kind);
            }

            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
        self.shutdown_workers();
        log::info!("[FamilyLoop::run] {} loop stopped", self.family);
    }

    fn dispatch(&mut self) {
        let mut write = self.scheds[0].take();
        let mut read = self.scheds[1].take();
        let mut format = self.scheds[2].take();
        {
            let mut set: Vec<&mut dyn IoScheduler> = Vec::with_capacity(3);
            if let Some(s) = write.as_mut() {
                set.push(s.as_mut());
            }
            if let Some(s) = read.as_mut() {
                set.push(s.as_mut());
            }
            if let Some(s) = format.as_mut() {
                set.push(s.as_mut());
            }
            dispatch_devices(set.as_mut_slice());
        }
        self.scheds[0] = write;
        self.scheds[1] = read;
        self.scheds[2] = format;
    }

    fn respond(&self, container: &Arc<RequestContainer>, response: Response) {
        if let Some(response) = container.respond_now(response) {
            let _ = self.resp_tx.send(OutboundResponse {
                reply: container.reply,
                response,
            });
        }
    }

    fn fail_container(&self, container: &Arc<RequestContainer>, err: &LrsError) {
        log::warn!(
            "[FamilyLoop::fail_container] {} request failed: {}",
            container.req.kind(),
            err
        );
        if let Some(response) = container.fail(err) {
            let _ = self.resp_tx.send(OutboundResponse {
                reply: container.reply,
                response,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------------

    fn ingest(&mut self, container: Arc<RequestContainer>) {
        match &container.req {
            Request::Write(_) => self.enqueue(SchedKind::Write, container),
            Request::Read(_) => self.enqueue(SchedKind::Read, container),
            Request::Format(_) => self.enqueue(SchedKind::Format, container),
            Request::Release(_) => self.handle_release(container),
            Request::Notify(_) => self.handle_notify(container),
            Request::Monitor(_) => self.handle_monitor(&container),
            _ => {
                let e = LrsError::InvalidRequest("request kind not handled by family loop".into());
                self.fail_container(&container, &e);
            }
        }
    }

    fn enqueue(&mut self, kind: SchedKind, container: Arc<RequestContainer>) {
        if let Some(sched) = self.scheds[sched_index(kind)].as_mut() {
            sched.push(container);
        }
    }

    /// Route a release to the worker hosting each medium; media no longer
    /// loaded anywhere are settled inline (their sync happened at unmount).
    fn handle_release(&mut self, container: Arc<RequestContainer>) {
        let Request::Release(release) = &container.req else {
            return;
        };

        // Reject double releases before touching anything.
        for m in &release.media {
            if !self.sessions.contains(&m.medium) {
                let e = LrsError::InvalidRequest(format!(
                    "no live allocation session on {}",
                    m.medium
                ));
                self.fail_container(&container, &e);
                return;
            }
        }

        let is_write = release.kind == ReleaseKind::Write;
        for (index, m) in release.media.iter().enumerate() {
            let hosting = self.registry.device_hosting(&m.medium);

            let row = match self.cache.acquire(&*self.dss, &m.medium) {
                Ok(entry) => entry.shared(),
                Err(e) => {
                    self.fail_container(&container, &e);
                    return;
                }
            };

            match hosting {
                Some(handle) => {
                    handle.push(SubRequest {
                        container: Arc::clone(&container),
                        medium_index: index,
                        kind: SubRequestKind::Release {
                            size_written: m.size_written,
                            nb_extents_written: m.nb_extents_written,
                            to_sync: m.to_sync,
                            partial: release.partial,
                        },
                        medium: row,
                    });
                }
                None => {
                    // Already unmounted: the unmount path synced it.
                    if is_write && m.size_written > 0 {
                        let mut rec = row.record.write();
                        rec.stats.phys_spc_used =
                            rec.stats.phys_spc_used.saturating_add(m.size_written);
                        rec.stats.phys_spc_free =
                            rec.stats.phys_spc_free.saturating_sub(m.size_written);
                        let snapshot = rec.clone();
                        drop(rec);
                        if let Err(e) = self.dss.media_update(&snapshot) {
                            log::warn!("[FamilyLoop::handle_release] {}: {}", m.medium, e);
                        }
                    }
                    if !release.partial {
                        self.locker.unlock_medium(&*self.dss, &m.medium);
                        self.sessions.remove(&m.medium);
                    }
                    if let Some(response) = container.complete_slot(
                        index,
                        CompletionPayload::Release {
                            medium: m.medium.clone(),
                        },
                    ) {
                        let _ = self.resp_tx.send(OutboundResponse {
                            reply: container.reply,
                            response,
                        });
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Notify
    // ------------------------------------------------------------------------

    fn handle_notify(&mut self, container: Arc<RequestContainer>) {
        let Request::Notify(notify) = &container.req else {
            return;
        };
        let op = notify.op;
        let resource = notify.resource.clone();
        let result = match op {
            NotifyOp::DeviceAdd => self.notify_device_add(&resource),
            NotifyOp::DeviceRemove => self.notify_device_remove(&resource),
            NotifyOp::MediumAdd => self.notify_medium_add(&resource),
            NotifyOp::MediumRemove => self.notify_medium_remove(&resource),
        };
        match result {
            Ok(()) => self.respond(&container, Response::Notify { op, resource }),
            Err(e) => self.fail_container(&container, &e),
        }
    }

    fn notify_device_add(&mut self, id: &ResourceId) -> Result<()> {
        if self.registry.lookup_device(id).is_some() {
            return Err(LrsError::AlreadyInitialized(format!("device {}", id)));
        }
        let rows = self.dss.device_get(&DeviceFilter::one(id))?;
        let row = rows
            .into_iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| LrsError::NotFound(id.clone()))?;
        if row.host != self.ctx.owner().hostname {
            return Err(LrsError::InvalidRequest(format!(
                "device {} is assigned to host {}",
                id, row.host
            )));
        }
        self.locker
            .lock_devices(&*self.dss, std::slice::from_ref(id))?;
        self.spawn_device(row)?;
        log::info!("[FamilyLoop::notify_device_add] {} joined", id);
        Ok(())
    }

    fn notify_device_remove(&mut self, id: &ResourceId) -> Result<()> {
        let mut bundle = self
            .workers
            .remove(id)
            .ok_or_else(|| LrsError::NotFound(id.clone()))?;
        // Retire the worker: its drain path answers queued sub-requests
        // with ESHUTDOWN and leaves the drive empty.
        bundle.stop.store(true, Ordering::Release);
        if let Some(handle) = self.registry.lookup_device(id) {
            handle.wake();
        }
        if let Some(join) = bundle.join.take() {
            join.join();
        }
        self.registry.remove_device(id);
        for sched in self.scheds.iter_mut().flatten() {
            sched.remove_device(id);
        }
        self.locker
            .unlock_devices(&*self.dss, std::slice::from_ref(id));
        log::info!("[FamilyLoop::notify_device_remove] {} retired", id);
        Ok(())
    }

    fn notify_medium_add(&mut self, id: &ResourceId) -> Result<()> {
        self.registry.absorb_medium(&*self.dss, &self.cache, id)
    }

    fn notify_medium_remove(&mut self, id: &ResourceId) -> Result<()> {
        if self.registry.device_hosting(id).is_some() {
            return Err(LrsError::Busy(id.clone()));
        }
        self.cache.evict(id)
    }

    // ------------------------------------------------------------------------
    // Monitor
    // ------------------------------------------------------------------------

    fn handle_monitor(&self, container: &Arc<RequestContainer>) {
        let devices: Vec<serde_json::Value> = self
            .registry
            .devices()
            .map(|handle| {
                let snap = handle.snapshot();
                serde_json::json!({
                    "name": snap.id.name,
                    "library": snap.id.library,
                    "state": snap.state.to_string(),
                    "adm_status": snap.adm_status,
                    "health": snap.health,
                    "loaded_medium": snap.loaded_medium.map(|m| m.name),
                    "mount_point": snap.mount_point,
                    "queue_len": handle.queue_len(),
                    "sessions": handle.active_sessions(),
                })
            })
            .collect();
        let queues: Vec<serde_json::Value> = self
            .scheds
            .iter()
            .flatten()
            .map(|s| {
                serde_json::json!({
                    "kind": format!("{:?}", s.kind()).to_lowercase(),
                    "algo": s.name(),
                    "pending": s.queue_len(),
                    "devices": s.devices().len(),
                })
            })
            .collect();
        let status = serde_json::json!({
            "family": self.family.as_str(),
            "devices": devices,
            "schedulers": queues,
        });
        self.respond(container, Response::Monitor { status: status.to_string() });
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    fn schedule_kind(&mut self, kind: SchedKind) {
        let Some(mut sched) = self.scheds[sched_index(kind)].take() else {
            return;
        };
        let cfg = self.ctx.config();
        let res = SchedResources {
            dss: &*self.dss,
            cache: &self.cache,
            locker: &self.locker,
            policy: cfg.policy(),
            family: self.family,
        };

        'requests: while let Some(container) = sched.peek() {
            if container.is_failed() {
                sched.remove(&container);
                continue;
            }
            loop {
                match sched.get_device_medium_pair(&res, &container, false) {
                    Ok(Some(pair)) => {
                        let sub = match self.build_sub(&container, pair.medium_index, &pair.medium)
                        {
                            Ok(sub) => sub,
                            Err(e) => {
                                self.locker.unlock_medium(&*self.dss, &pair.medium.id());
                                sched.remove(&container);
                                self.fail_container(&container, &e);
                                break;
                            }
                        };
                        container.note_reserved(pair.medium.id());
                        container.note_dispatched();
                        pair.device.push(sub);
                        if container.fully_dispatched() {
                            sched.remove(&container);
                            break;
                        }
                    }
                    Ok(None) => {
                        // A read whose Free section drained into
                        // Unavailable goes back through requeue, which
                        // resets those candidates for the next pass.
                        let all_unavailable = container.read_media.as_ref().is_some_and(|l| {
                            let list = l.lock();
                            list.n_free() == 0 && list.n_unavailable() > 0
                        });
                        if all_unavailable {
                            sched.remove(&container);
                            sched.requeue(container);
                        }
                        // Head of line cannot be served right now.
                        break 'requests;
                    }
                    Err(e) => {
                        sched.remove(&container);
                        self.fail_container(&container, &e);
                        break;
                    }
                }
            }
        }
        self.scheds[sched_index(kind)] = Some(sched);
    }

    fn build_sub(
        &self,
        container: &Arc<RequestContainer>,
        medium_index: usize,
        medium: &Arc<crate::cache::CachedMedium>,
    ) -> Result<SubRequest> {
        let kind = match &container.req {
            Request::Write(w) => {
                let size = if w.no_split {
                    w.media.iter().map(|s| s.size).sum()
                } else {
                    w.media
                        .get(medium_index)
                        .map(|s| s.size)
                        .ok_or_else(|| {
                            LrsError::InvalidRequest(format!(
                                "write slot {} out of range",
                                medium_index
                            ))
                        })?
                };
                SubRequestKind::WriteAlloc { size }
            }
            Request::Read(_) => SubRequestKind::ReadAlloc,
            Request::Format(f) => SubRequestKind::Format {
                fs: f.fs,
                unlock: f.unlock,
                force: f.force,
            },
            other => {
                return Err(LrsError::InvalidRequest(format!(
                    "{} request cannot become a sub-request",
                    other.kind()
                )))
            }
        };
        Ok(SubRequest {
            container: Arc::clone(container),
            medium_index,
            kind,
            medium: Arc::clone(medium),
        })
    }

    // ------------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        let container = Arc::clone(&completion.sub.container);
        let medium_id = completion.sub.medium_id();

        match completion.result {
            Ok(payload) => {
                if container.is_failed() {
                    // A sibling slot failed after this one succeeded: the
                    // client never sees this allocation, roll it back.
                    if matches!(
                        payload,
                        CompletionPayload::Write(_) | CompletionPayload::Read(_)
                    ) {
                        self.locker.unlock_medium(&*self.dss, &medium_id);
                        if let Some(handle) = self.registry.lookup_device(&completion.device) {
                            handle.session_end();
                        }
                        self.sessions.remove(&medium_id);
                    }
                    return;
                }
                match &payload {
                    CompletionPayload::Write(alloc) => {
                        self.sessions.insert(alloc.medium.clone());
                    }
                    CompletionPayload::Read(alloc) => {
                        self.sessions.insert(alloc.medium.clone());
                    }
                    CompletionPayload::Release { medium } => {
                        let partial = matches!(
                            &container.req,
                            Request::Release(r) if r.partial
                        );
                        if !partial {
                            self.sessions.remove(medium);
                        }
                    }
                    CompletionPayload::Format => {
                        // Holders see the shared row; later acquirers get a
                        // fresh build.
                        self.cache.update(&medium_id);
                    }
                }
                if let Some(response) =
                    container.complete_slot(completion.sub.medium_index, payload)
                {
                    let _ = self.resp_tx.send(OutboundResponse {
                        reply: container.reply,
                        response,
                    });
                }
            }
            Err(e) => self.handle_failed_completion(completion.sub, e),
        }
    }

    fn handle_failed_completion(&mut self, sub: SubRequest, err: LrsError) {
        let container = Arc::clone(&sub.container);
        let medium_id = sub.medium_id();

        // Definitive failures surface immediately.
        let definitive = matches!(
            err,
            LrsError::Shutdown
                | LrsError::InvalidRequest(_)
                | LrsError::AlreadyInitialized(_)
                | LrsError::LockConflict { .. }
                | LrsError::ProtocolVersion(_)
                | LrsError::BadMessage(_)
        );
        if definitive {
            self.fail_container(&container, &err);
            return;
        }

        match &container.req {
            Request::Read(_) => {
                let exhausted = {
                    let Some(list_lock) = &container.read_media else {
                        self.fail_container(&container, &err);
                        return;
                    };
                    let mut list = list_lock.lock();
                    list.fail_allocated(&medium_id);
                    list.n_free() == 0 && list.n_unavailable() == 0
                };
                if exhausted {
                    // No copy left to try.
                    self.fail_container(&container, &err);
                    return;
                }
                self.retry(SchedKind::Read, container, &medium_id);
            }
            Request::Write(_) => {
                if container.bump_retry() > WRITE_RETRY_MAX {
                    self.fail_container(&container, &err);
                    return;
                }
                self.retry(SchedKind::Write, container, &medium_id);
            }
            // Formats and releases do not redirect.
            _ => self.fail_container(&container, &err),
        }
    }

    /// Reopen the failed slot and put the container back in front of the
    /// algorithm when it had already left the queue.
    fn retry(&mut self, kind: SchedKind, container: Arc<RequestContainer>, medium: &ResourceId) {
        let was_removed = container.fully_dispatched();
        container.undo_dispatched();
        container.forget_reserved(medium);
        log::debug!(
            "[FamilyLoop::retry] {} slot on {} reopened",
            container.req.kind(),
            medium
        );
        if was_removed {
            if let Some(sched) = self.scheds[sched_index(kind)].as_mut() {
                sched.requeue(container);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn shutdown_workers(&mut self) {
        for bundle in self.workers.values() {
            bundle.stop.store(true, Ordering::Release);
        }
        for handle in self.registry.devices() {
            handle.wake();
        }
        for bundle in self.workers.values_mut() {
            if let Some(join) = bundle.join.take() {
                join.join();
            }
        }
        // Workers drained with ESHUTDOWN errors; answer the containers.
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.handle_completion(completion);
        }
        // Anything still queued in the schedulers dies the same way.
        for index in 0..self.scheds.len() {
            let Some(mut sched) = self.scheds[index].take() else {
                continue;
            };
            while let Some(container) = sched.peek() {
                sched.remove(&container);
                self.fail_container(&container, &LrsError::Shutdown);
            }
            self.scheds[index] = Some(sched);
        }
        while let Ok(container) = self.req_rx.try_recv() {
            self.fail_container(&container, &LrsError::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::config::Config;
    use crate::dss::LockOwner;

    #[test]
    fn scheduler_selection_honors_config_and_falls_back() {
        let cfg = Config::from_toml_str(
            "[io_sched_tape]\nread_algo = \"grouped_read\"\nwrite_algo = \"bogus\"\n",
        )
        .unwrap();
        let ctx = Context::new(
            cfg,
            AdapterRegistry::with_defaults(),
            LockOwner::new("node-test", 1),
        );
        assert_eq!(
            build_scheduler(&ctx, Family::Tape, SchedKind::Read).name(),
            "grouped_read"
        );
        assert_eq!(
            build_scheduler(&ctx, Family::Tape, SchedKind::Write).name(),
            "fifo"
        );
        assert_eq!(
            build_scheduler(&ctx, Family::Dir, SchedKind::Format).name(),
            "fifo"
        );
    }

    #[test]
    fn sched_index_is_stable() {
        assert_eq!(sched_index(SchedKind::Write), 0);
        assert_eq!(sched_index(SchedKind::Read), 1);
        assert_eq!(sched_index(SchedKind::Format), 2);
    }
}
