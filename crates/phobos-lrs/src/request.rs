// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request containers and sub-requests.
//!
//! A container wraps one client request together with the transport handle
//! needed to route its response. The scheduler carves `(device, medium)`
//! sub-requests out of it; the container tracks dispatch and completion so
//! the response is emitted exactly once: when every slot completed, or as
//! soon as one slot definitively failed.

use crate::cache::CachedMedium;
use crate::error::LrsError;
use crate::protocol::{
    ReadMediumAlloc, ReleaseKind, Request, Response, Token, WriteMediumAlloc,
};
use crate::sched::read_media::ReadMediaList;
use crate::types::{FsType, ResourceId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// Reply routing
// ============================================================================

/// Transport coordinates of a response: connection plus echoed token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReplyHandle {
    pub client: u64,
    pub token: Token,
}

/// A response ready to leave through the transport.
#[derive(Debug)]
pub struct OutboundResponse {
    pub reply: ReplyHandle,
    pub response: Response,
}

// ============================================================================
// Sub-requests
// ============================================================================

/// Work carried by one sub-request on a device.
#[derive(Clone, Debug)]
pub enum SubRequestKind {
    /// Prepare the medium for writing `size` bytes and report its root.
    WriteAlloc { size: u64 },
    /// Bring the medium online for reading and report its root.
    ReadAlloc,
    /// Format the medium; optionally unlock it for scheduling afterwards.
    Format {
        fs: FsType,
        unlock: bool,
        force: bool,
    },
    /// Account a write release and gate its acknowledgement behind a sync.
    Release {
        size_written: u64,
        nb_extents_written: u32,
        to_sync: bool,
        partial: bool,
    },
}

/// A one-(device, medium) slice of a client request.
pub struct SubRequest {
    pub container: Arc<RequestContainer>,
    /// Slot index inside the container.
    pub medium_index: usize,
    pub kind: SubRequestKind,
    /// Borrowed medium row, shared with the cache.
    pub medium: Arc<CachedMedium>,
}

impl SubRequest {
    pub fn medium_id(&self) -> ResourceId {
        self.medium.id()
    }
}

/// What a finished sub-request hands back to the scheduler loop.
#[derive(Clone, Debug)]
pub enum CompletionPayload {
    Write(WriteMediumAlloc),
    Read(ReadMediumAlloc),
    Format,
    Release { medium: ResourceId },
}

/// Completion message from a device worker.
pub struct Completion {
    pub device: ResourceId,
    pub sub: SubRequest,
    pub result: Result<CompletionPayload, LrsError>,
}

// ============================================================================
// Containers
// ============================================================================

struct Progress {
    slots: Vec<Option<CompletionPayload>>,
    dispatched: usize,
    n_done: usize,
    /// Media reserved (early-locked) for already-dispatched slots.
    reserved: Vec<ResourceId>,
    /// Transient-failure retries consumed so far.
    retries: u32,
    /// A response (success or error) left already; nothing further may go
    /// out for this container.
    responded: bool,
    failed: bool,
}

/// One client request with its routing handle and slot bookkeeping.
pub struct RequestContainer {
    pub reply: ReplyHandle,
    pub req: Request,
    pub received_at: Instant,
    /// Scheduler working state of a read request's candidates.
    pub read_media: Option<Mutex<ReadMediaList>>,
    progress: Mutex<Progress>,
}

impl RequestContainer {
    pub fn new(reply: ReplyHandle, req: Request) -> Arc<Self> {
        let n_slots = match &req {
            Request::Write(w) => {
                if w.no_split {
                    1
                } else {
                    w.media.len()
                }
            }
            Request::Read(r) => r.n_required as usize,
            Request::Release(r) => r.media.len(),
            Request::Format(_) => 1,
            // Routed without sub-requests; a single virtual slot.
            _ => 1,
        };
        let read_media = match &req {
            Request::Read(r) => Some(Mutex::new(ReadMediaList::new(r.media.clone()))),
            _ => None,
        };
        Arc::new(Self {
            reply,
            req,
            received_at: Instant::now(),
            read_media,
            progress: Mutex::new(Progress {
                slots: (0..n_slots).map(|_| None).collect(),
                dispatched: 0,
                n_done: 0,
                reserved: Vec::new(),
                retries: 0,
                responded: false,
                failed: false,
            }),
        })
    }

    pub fn n_slots(&self) -> usize {
        self.progress.lock().slots.len()
    }

    /// Count one slot as handed to a device worker.
    pub fn note_dispatched(&self) -> usize {
        let mut p = self.progress.lock();
        p.dispatched += 1;
        p.dispatched
    }

    /// Undo a dispatch after a transient failure, for requeueing.
    pub fn undo_dispatched(&self) {
        let mut p = self.progress.lock();
        p.dispatched = p.dispatched.saturating_sub(1);
    }

    pub fn dispatched(&self) -> usize {
        self.progress.lock().dispatched
    }

    pub fn fully_dispatched(&self) -> bool {
        let p = self.progress.lock();
        p.dispatched >= p.slots.len()
    }

    /// Remember a medium reserved for a dispatched slot (duplicate
    /// avoidance, rollback on failure).
    pub fn note_reserved(&self, id: ResourceId) {
        self.progress.lock().reserved.push(id);
    }

    pub fn forget_reserved(&self, id: &ResourceId) {
        self.progress.lock().reserved.retain(|r| r != id);
    }

    pub fn reserved_media(&self) -> Vec<ResourceId> {
        self.progress.lock().reserved.clone()
    }

    /// Count one transient retry; returns the new total.
    pub fn bump_retry(&self) -> u32 {
        let mut p = self.progress.lock();
        p.retries += 1;
        p.retries
    }

    pub fn is_failed(&self) -> bool {
        self.progress.lock().failed
    }

    /// Record a finished slot. Returns the assembled success response when
    /// this was the last outstanding slot; `None` otherwise or when the
    /// container already responded.
    pub fn complete_slot(&self, index: usize, payload: CompletionPayload) -> Option<Response> {
        let mut p = self.progress.lock();
        if p.responded || index >= p.slots.len() || p.slots[index].is_some() {
            return None;
        }
        p.slots[index] = Some(payload);
        p.n_done += 1;
        if p.n_done < p.slots.len() {
            return None;
        }
        p.responded = true;
        Some(self.assemble(&p.slots))
    }

    /// Record a definitive failure. Returns the error response exactly once;
    /// later completions and failures are swallowed.
    pub fn fail(&self, err: &LrsError) -> Option<Response> {
        let mut p = self.progress.lock();
        p.failed = true;
        if p.responded {
            return None;
        }
        p.responded = true;
        Some(Response::error(Some(self.req.kind()), err))
    }

    /// Immediate single-shot response (ping, monitor, configure, notify).
    pub fn respond_now(&self, response: Response) -> Option<Response> {
        let mut p = self.progress.lock();
        if p.responded {
            return None;
        }
        p.responded = true;
        Some(response)
    }

    fn assemble(&self, slots: &[Option<CompletionPayload>]) -> Response {
        match &self.req {
            Request::Write(_) => Response::Write {
                media: slots
                    .iter()
                    .filter_map(|s| match s {
                        Some(CompletionPayload::Write(alloc)) => Some(alloc.clone()),
                        _ => None,
                    })
                    .collect(),
            },
            Request::Read(_) => Response::Read {
                media: slots
                    .iter()
                    .filter_map(|s| match s {
                        Some(CompletionPayload::Read(alloc)) => Some(alloc.clone()),
                        _ => None,
                    })
                    .collect(),
            },
            Request::Release(r) => Response::Release {
                kind: r.kind,
                media: slots
                    .iter()
                    .filter_map(|s| match s {
                        Some(CompletionPayload::Release { medium }) => Some(medium.clone()),
                        _ => None,
                    })
                    .collect(),
                partial: r.partial,
            },
            Request::Format(f) => Response::Format {
                medium: f.medium.clone(),
            },
            // Single-shot kinds never reach slot assembly.
            other => Response::error(
                Some(other.kind()),
                &LrsError::InvalidRequest("request kind carries no slots".into()),
            ),
        }
    }
}
