// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sync batching: accumulate write releases until a threshold trips.
//!
//! Each device worker owns one accumulator. A syncing write release parks
//! its sub-request here; when the pending count, the pending byte total or
//! the age of the oldest entry crosses the configured per-family threshold,
//! the worker issues one filesystem sync and acknowledges the whole batch.
//! Acknowledgements keep the per-device arrival order of the releases.

use crate::config::SyncParams;
use crate::request::SubRequest;
use std::time::{Duration, Instant};

/// Per-device accumulator of syncing releases.
pub struct SyncBatcher {
    params: SyncParams,
    pending: Vec<SubRequest>,
    pending_bytes: u64,
    oldest: Option<Instant>,
}

impl SyncBatcher {
    pub fn new(params: SyncParams) -> Self {
        Self {
            params,
            pending: Vec::new(),
            pending_bytes: 0,
            oldest: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_count(&self) -> u32 {
        self.pending.len() as u32
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Park a release until the next sync point.
    pub fn push(&mut self, sub: SubRequest, bytes: u64) {
        if self.pending.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.pending.push(sub);
        self.pending_bytes = self.pending_bytes.saturating_add(bytes);
    }

    /// True when any of the three thresholds is crossed.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        if self.pending_count() >= self.params.nb_req {
            return true;
        }
        if self.pending_bytes >= self.params.written_bytes {
            return true;
        }
        match self.oldest {
            Some(oldest) => now.duration_since(oldest) >= self.params.time,
            None => false,
        }
    }

    /// Instant at which the time threshold will trip, for the worker's
    /// condvar wait.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.oldest.map(|o| o + self.params.time)
    }

    /// How long the worker may sleep before the time threshold trips.
    pub fn wait_budget(&self, now: Instant, idle_wait: Duration) -> Duration {
        match self.next_deadline() {
            None => idle_wait,
            Some(deadline) => deadline.saturating_duration_since(now).min(idle_wait),
        }
    }

    /// Drain the batch for acknowledgement after a sync, zeroing the
    /// accumulator. Entries keep their arrival order.
    pub fn take_batch(&mut self) -> Vec<SubRequest> {
        self.pending_bytes = 0;
        self.oldest = None;
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MediaCache;
    use crate::dss::MemoryDssFactory;
    use crate::protocol::{ReleaseKind, ReleaseMedium, ReleaseReq, Request};
    use crate::request::{ReplyHandle, RequestContainer, SubRequestKind};
    use crate::types::{AdmStatus, Family, FsType, Medium, ResourceId};

    fn release_sub(name: &str, bytes: u64) -> SubRequest {
        let id = ResourceId::new(Family::Dir, name, "legacy");
        let factory = MemoryDssFactory::new();
        let dss = factory.handle();
        let mut medium = Medium::new(id.clone(), FsType::Posix, 1);
        medium.adm_status = AdmStatus::Unlocked;
        crate::dss::Dss::media_insert(&dss, &medium).unwrap();
        let cache = MediaCache::new(Family::Dir);
        let row = cache.acquire(&dss, &id).unwrap().shared();

        let container = RequestContainer::new(
            ReplyHandle {
                client: 1,
                token: 1,
            },
            Request::Release(ReleaseReq {
                kind: ReleaseKind::Write,
                partial: false,
                media: vec![ReleaseMedium {
                    medium: id,
                    size_written: bytes,
                    nb_extents_written: 1,
                    to_sync: true,
                }],
            }),
        );
        SubRequest {
            container,
            medium_index: 0,
            kind: SubRequestKind::Release {
                size_written: bytes,
                nb_extents_written: 1,
                to_sync: true,
                partial: false,
            },
            medium: row,
        }
    }

    fn params(nb_req: u32, bytes: u64, time: Duration) -> SyncParams {
        SyncParams {
            time,
            nb_req,
            written_bytes: bytes,
        }
    }

    #[test]
    fn count_threshold_trips_after_n_releases() {
        let mut b = SyncBatcher::new(params(3, u64::MAX, Duration::from_secs(3600)));
        for i in 0..2 {
            b.push(release_sub(&format!("d{}", i), 10), 10);
            assert!(!b.is_due(Instant::now()));
        }
        b.push(release_sub("d2", 10), 10);
        assert!(b.is_due(Instant::now()));

        let batch = b.take_batch();
        assert_eq!(batch.len(), 3);
        assert!(b.is_empty());
        assert_eq!(b.pending_bytes(), 0);
        assert!(!b.is_due(Instant::now()));
    }

    #[test]
    fn byte_threshold_trips_on_large_release() {
        let mut b = SyncBatcher::new(params(100, 1 << 20, Duration::from_secs(3600)));
        b.push(release_sub("d0", 2 << 20), 2 << 20);
        assert!(b.is_due(Instant::now()));
    }

    #[test]
    fn time_threshold_uses_oldest_entry() {
        let mut b = SyncBatcher::new(params(100, u64::MAX, Duration::from_millis(5)));
        b.push(release_sub("d0", 1), 1);
        assert!(!b.is_due(Instant::now()));
        std::thread::sleep(Duration::from_millis(10));
        assert!(b.is_due(Instant::now()));
    }

    #[test]
    fn batch_preserves_arrival_order() {
        let mut b = SyncBatcher::new(params(10, u64::MAX, Duration::from_secs(3600)));
        for name in ["a", "b", "c"] {
            b.push(release_sub(name, 1), 1);
        }
        let names: Vec<String> = b
            .take_batch()
            .iter()
            .map(|s| s.medium_id().name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn wait_budget_is_capped_by_idle_wait() {
        let b = SyncBatcher::new(params(10, u64::MAX, Duration::from_secs(3600)));
        assert_eq!(
            b.wait_budget(Instant::now(), Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }
}
