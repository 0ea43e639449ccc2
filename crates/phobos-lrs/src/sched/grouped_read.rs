// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Grouped-read scheduler: batch reads that target already-present media.
//!
//! Read requests whose best candidate is currently mounted on an owned
//! device jump the queue, so a tape that is already in a drive serves every
//! waiting read before it is exchanged. Candidate ordering inside a request
//! is the shared read preference (mounted > loaded > unloaded, then name
//! ascending); across requests this scheduler reorders, FIFO breaks ties.

use super::{
    read_candidate_rank, select_read_medium, DeviceClaim, DeviceMediumPair, IoScheduler,
    SchedKind, SchedResources,
};
use crate::device::DeviceHandle;
use crate::error::{LrsError, Result};
use crate::request::RequestContainer;
use crate::types::ResourceId;
use std::collections::VecDeque;
use std::sync::Arc;

/// Mount-state-aware read scheduler.
pub struct GroupedRead {
    queue: VecDeque<Arc<RequestContainer>>,
    devices: Vec<Arc<DeviceHandle>>,
}

impl Default for GroupedRead {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupedRead {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            devices: Vec::new(),
        }
    }

    /// Best (lowest) candidate rank of a request's Free section.
    fn request_rank(&self, req: &Arc<RequestContainer>) -> (u8, String) {
        let Some(list) = &req.read_media else {
            return (u8::MAX, String::new());
        };
        let list = list.lock();
        list.free()
            .iter()
            .map(|id| read_candidate_rank(&self.devices, id))
            .min()
            .unwrap_or((u8::MAX, String::new()))
    }

    fn take_idle_device(&mut self) -> Option<Arc<DeviceHandle>> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.is_idle() && d.is_schedulable())?;
        Some(self.devices.remove(pos))
    }
}

impl IoScheduler for GroupedRead {
    fn name(&self) -> &'static str {
        "grouped_read"
    }

    fn kind(&self) -> SchedKind {
        SchedKind::Read
    }

    fn push(&mut self, req: Arc<RequestContainer>) {
        self.queue.push_back(req);
    }

    /// A request whose best candidate is already mounted wins; queue order
    /// breaks ties so a group drains in arrival order.
    fn peek(&self) -> Option<Arc<RequestContainer>> {
        self.queue
            .iter()
            .min_by_key(|req| self.request_rank(req).0)
            .cloned()
    }

    fn remove(&mut self, req: &Arc<RequestContainer>) {
        self.queue.retain(|r| !Arc::ptr_eq(r, req));
    }

    fn requeue(&mut self, req: Arc<RequestContainer>) {
        if let Some(list) = &req.read_media {
            list.lock().reset_unavailable();
        }
        self.queue.push_back(req);
    }

    fn get_device_medium_pair(
        &mut self,
        res: &SchedResources<'_>,
        req: &Arc<RequestContainer>,
        _is_retry: bool,
    ) -> Result<Option<DeviceMediumPair>> {
        if !matches!(req.req, crate::protocol::Request::Read(_)) {
            return Err(LrsError::InvalidRequest(format!(
                "{} request in {} scheduler",
                req.req.kind(),
                self.name()
            )));
        }
        let slot = req.dispatched();
        let pair = select_read_medium(res, &self.devices, req)?;
        Ok(pair.map(|mut p| {
            p.medium_index = slot;
            p
        }))
    }

    fn add_device(&mut self, device: Arc<DeviceHandle>) {
        self.devices.push(device);
    }

    fn remove_device(&mut self, id: &ResourceId) -> Option<Arc<DeviceHandle>> {
        let pos = self.devices.iter().position(|d| &d.id() == id)?;
        Some(self.devices.remove(pos))
    }

    fn claim_device(&mut self, claim: DeviceClaim) -> Option<Arc<DeviceHandle>> {
        match claim {
            DeviceClaim::Take => self.take_idle_device(),
            DeviceClaim::Borrow => self
                .devices
                .iter()
                .find(|d| d.is_idle() && d.is_schedulable())
                .cloned(),
            DeviceClaim::Exchange(offered) => match self.take_idle_device() {
                Some(given) => {
                    self.devices.push(offered);
                    Some(given)
                }
                None => None,
            },
        }
    }

    fn devices(&self) -> &[Arc<DeviceHandle>] {
        &self.devices
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
