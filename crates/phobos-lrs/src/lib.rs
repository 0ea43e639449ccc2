// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Phobos LRS - Local Resource Scheduler
//!
//! Single-host daemon core that owns a fleet of physical storage resources
//! (tape drives, tape cartridges, directories, object pools) and arbitrates
//! their use among concurrent client requests for reading, writing,
//! formatting and releasing media.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Request socket (framed)                      |
//! |                 transport (mio poll loop) -> router                 |
//! +---------------------------------------------------------------------+
//! |                        Family scheduler loop                        |
//! |   I/O schedulers (fifo / grouped_read) -> (device, medium) pairs    |
//! +---------------------------------------------------------------------+
//! |                          Device workers                             |
//! |   one thread per drive: load -> mount -> io -> sync -> unload       |
//! +---------------------------------------------------------------------+
//! |     Registry | Media cache | Health | Lock coordinator | DSS        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! Exclusive physical occupancy is the core invariant: one medium in one
//! drive, one writer per medium, cross-host exclusion through cooperative
//! DSS locks keyed on (hostname, pid).
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Lrs`] | Daemon core: assembles workers, schedulers and the router |
//! | [`dss::Dss`] | Collaborator trait for the shared cluster database |
//! | [`cache::MediaCache`] | Refcounted, single-builder medium lookup |
//! | [`device::DeviceHandle`] | Per-drive record, queue and sync accumulator |
//! | [`protocol::Request`] | Client request model (write/read/release/...) |

/// Adapter capability sets (device, filesystem, library) and POSIX variants.
pub mod adapters;
/// Media cache: refcounted, keyed lookup with at-most-one-builder-per-key.
pub mod cache;
/// Three-level configuration lookup (environment, TOML file, DSS store).
pub mod config;
/// Process-wide context: refcounted init/finish, adapter registry, caches.
pub mod context;
/// Device worker: per-drive thread, state machine and sub-request queue.
pub mod device;
/// DSS collaborator interface and the in-memory reference implementation.
pub mod dss;
/// Error type and errno mapping for wire responses.
pub mod error;
/// Health counters with decrement-on-error and fail-at-zero semantics.
pub mod health;
/// DSS cooperative lock coordinator (hostname, pid, early-lock handling).
pub mod lock;
/// Family scheduler loop and daemon core assembly.
pub mod lrs;
/// Wire protocol: request/response model, cursor codec, length framing.
pub mod protocol;
/// Resource registry: in-memory device/medium catalog synced with the DSS.
pub mod registry;
/// Request containers, sub-requests and completion plumbing.
pub mod request;
/// Request/response router between the transport and family loops.
pub mod router;
/// I/O schedulers: fifo, grouped-read, read-media list, device dispatch.
pub mod sched;
/// Write-release sync batching (count/bytes/time thresholds).
pub mod sync_batch;
/// Socket transport: mio poll loop over the Unix/TCP request socket.
pub mod transport;
/// Resource identifiers, medium and device records, lock records.
pub mod types;

pub use error::{LrsError, Result};
pub use lrs::Lrs;
pub use types::{Device, DeviceState, Family, Medium, ResourceId};
