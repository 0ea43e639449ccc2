// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FIFO scheduler: requests leave in arrival order.
//!
//! The default algorithm for all three request kinds. Ordering applies per
//! client stream by construction: the router enqueues in reception order
//! and the queue is drained from the front.

use super::{
    select_format_medium, select_read_medium, select_write_medium, DeviceClaim, DeviceMediumPair,
    IoScheduler, SchedKind, SchedResources,
};
use crate::device::DeviceHandle;
use crate::error::{LrsError, Result};
use crate::request::RequestContainer;
use crate::types::ResourceId;
use std::collections::VecDeque;
use std::sync::Arc;

/// Arrival-order scheduler.
pub struct Fifo {
    kind: SchedKind,
    queue: VecDeque<Arc<RequestContainer>>,
    devices: Vec<Arc<DeviceHandle>>,
}

impl Fifo {
    pub fn new(kind: SchedKind) -> Self {
        Self {
            kind,
            queue: VecDeque::new(),
            devices: Vec::new(),
        }
    }

    fn take_idle_device(&mut self) -> Option<Arc<DeviceHandle>> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.is_idle() && d.is_schedulable())?;
        Some(self.devices.remove(pos))
    }
}

impl IoScheduler for Fifo {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn kind(&self) -> SchedKind {
        self.kind
    }

    fn push(&mut self, req: Arc<RequestContainer>) {
        self.queue.push_back(req);
    }

    fn peek(&self) -> Option<Arc<RequestContainer>> {
        self.queue.front().cloned()
    }

    fn remove(&mut self, req: &Arc<RequestContainer>) {
        self.queue.retain(|r| !Arc::ptr_eq(r, req));
    }

    fn requeue(&mut self, req: Arc<RequestContainer>) {
        // Unavailable read candidates get another chance on the next pass.
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
        let slot = req.dispatched();
        match (&self.kind, &req.req) {
            (SchedKind::Write, crate::protocol::Request::Write(w)) => {
                let (size, tags): (u64, Vec<String>) = if w.no_split {
                    // One medium carries the whole write.
                    (
                        w.media.iter().map(|s| s.size).sum(),
                        w.media.iter().flat_map(|s| s.tags.clone()).collect(),
                    )
                } else {
                    let spec = w.media.get(slot).ok_or_else(|| {
                        LrsError::InvalidRequest(format!("write slot {} out of range", slot))
                    })?;
                    (spec.size, spec.tags.clone())
                };
                let exclude = if w.prevent_duplicate {
                    req.reserved_media()
                } else {
                    Vec::new()
                };
                let pair = select_write_medium(
                    res,
                    &self.devices,
                    size,
                    &tags,
                    w.grouping.as_deref(),
                    w.library.as_deref(),
                    &exclude,
                )?;
                Ok(pair.map(|mut p| {
                    p.medium_index = slot;
                    p
                }))
            }
            (SchedKind::Read, crate::protocol::Request::Read(_)) => {
                let pair = select_read_medium(res, &self.devices, req)?;
                Ok(pair.map(|mut p| {
                    p.medium_index = slot;
                    p
                }))
            }
            (SchedKind::Format, crate::protocol::Request::Format(f)) => {
                let pair = select_format_medium(res, &self.devices, &f.medium)?;
                Ok(pair.map(|mut p| {
                    p.medium_index = slot;
                    p
                }))
            }
            _ => Err(LrsError::InvalidRequest(format!(
                "{} request in {} scheduler",
                req.req.kind(),
                self.name()
            ))),
        }
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
            DeviceClaim::Exchange(offered) => {
                // Keep the share constant: accept one, hand one back.
                match self.take_idle_device() {
                    Some(given) => {
                        self.devices.push(offered);
                        Some(given)
                    }
                    None => None,
                }
            }
        }
    }

    fn devices(&self) -> &[Arc<DeviceHandle>] {
        &self.devices
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReadReq, Request};
    use crate::request::ReplyHandle;
    use crate::types::{Device, Family};

    fn read_container(token: u64) -> Arc<RequestContainer> {
        RequestContainer::new(
            ReplyHandle { client: 1, token },
            Request::Read(ReadReq {
                family: Family::Dir,
                media: vec![ResourceId::new(Family::Dir, "m0", "legacy")],
                n_required: 1,
            }),
        )
    }

    fn device(name: &str) -> Arc<DeviceHandle> {
        DeviceHandle::new(Device::new(
            ResourceId::new(Family::Dir, name, "legacy"),
            "node-test",
            format!("/srv/{}", name),
            1,
        ))
    }

    #[test]
    fn queue_is_first_in_first_out() {
        let mut fifo = Fifo::new(SchedKind::Read);
        let a = read_container(1);
        let b = read_container(2);
        fifo.push(Arc::clone(&a));
        fifo.push(Arc::clone(&b));

        assert!(Arc::ptr_eq(&fifo.peek().unwrap(), &a));
        fifo.remove(&a);
        assert!(Arc::ptr_eq(&fifo.peek().unwrap(), &b));
    }

    #[test]
    fn requeue_goes_to_the_back() {
        let mut fifo = Fifo::new(SchedKind::Read);
        let a = read_container(1);
        let b = read_container(2);
        fifo.push(Arc::clone(&a));
        fifo.push(Arc::clone(&b));
        fifo.remove(&a);
        fifo.requeue(Arc::clone(&a));
        assert!(Arc::ptr_eq(&fifo.peek().unwrap(), &b));
        assert_eq!(fifo.queue_len(), 2);
    }

    #[test]
    fn claim_take_returns_only_idle_devices() {
        let mut fifo = Fifo::new(SchedKind::Write);
        fifo.add_device(device("d0"));
        assert!(fifo.claim_device(DeviceClaim::Take).is_some());
        assert!(fifo.claim_device(DeviceClaim::Take).is_none());
    }

    #[test]
    fn exchange_preserves_the_device_share() {
        let mut fifo = Fifo::new(SchedKind::Write);
        fifo.add_device(device("d0"));
        let offered = device("d9");
        let got = fifo.claim_device(DeviceClaim::Exchange(offered)).unwrap();
        assert_eq!(got.id().name, "d0");
        assert_eq!(fifo.devices().len(), 1);
        assert_eq!(fifo.devices()[0].id().name, "d9");
    }
}
