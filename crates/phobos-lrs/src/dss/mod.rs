// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DSS collaborator interface.
//!
//! The DSS is the shared cluster database: persistent device/medium rows,
//! object and layout metadata, and cooperative locks keyed on
//! `(hostname, pid)`. The LRS never provides its own durability; everything
//! that must survive a restart goes through this interface.
//!
//! Handles are not shared between threads. Each thread that talks to the DSS
//! obtains its own boxed handle from a [`DssFactory`]; the in-memory backend
//! hands out cheap handles over one shared store, the SQLite backend opens
//! one connection per handle.

pub mod memory;

pub use memory::{MemoryDss, MemoryDssFactory};

use crate::types::{AdmStatus, Device, Family, LockRecord, Medium, ResourceId};

// ============================================================================
// Errors
// ============================================================================

/// Errors reported by a DSS backend.
#[derive(Clone, Debug)]
pub enum DssError {
    /// A cooperative lock is already held (possibly by another host).
    LockConflict {
        resource: ResourceId,
        /// The current owner when the backend can report it.
        owner: Option<LockRecord>,
    },
    /// Unlock or convert of a lock this owner does not hold.
    NotLocked(ResourceId),
    /// Row does not exist.
    NotFound(ResourceId),
    /// Object/layout row does not exist.
    ObjectNotFound(String),
    /// Backend connection failure (retryable after reconnect).
    Connection(String),
    /// Malformed query or constraint violation.
    Query(String),
}

impl std::fmt::Display for DssError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DssError::LockConflict { resource, owner } => match owner {
                Some(rec) => write!(
                    f,
                    "lock conflict on {}: held by {}:{}",
                    resource, rec.hostname, rec.owner_pid
                ),
                None => write!(f, "lock conflict on {}", resource),
            },
            DssError::NotLocked(id) => write!(f, "no lock held on {}", id),
            DssError::NotFound(id) => write!(f, "row not found: {}", id),
            DssError::ObjectNotFound(oid) => write!(f, "object not found: {}", oid),
            DssError::Connection(msg) => write!(f, "dss connection: {}", msg),
            DssError::Query(msg) => write!(f, "dss query: {}", msg),
        }
    }
}

impl std::error::Error for DssError {}

/// Result alias for DSS operations.
pub type DssResult<T> = std::result::Result<T, DssError>;

// ============================================================================
// Lock owner
// ============================================================================

/// Identity under which this daemon takes cooperative locks.
///
/// Locks are pid-scoped: the DSS invalidates them when it detects the owning
/// pid is gone, so no renewal protocol is needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOwner {
    pub hostname: String,
    pub pid: u32,
}

impl LockOwner {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    /// Owner for the running process, using the short host name.
    pub fn for_current_process() -> Self {
        Self::new(short_hostname(), std::process::id())
    }

    /// Lock record this owner would write at `now`.
    pub fn record(&self, is_early: bool) -> LockRecord {
        LockRecord {
            hostname: self.hostname.clone(),
            owner_pid: self.pid,
            timestamp: std::time::SystemTime::now(),
            is_early,
        }
    }
}

/// Short form of the local FQDN (everything before the first dot).
pub fn short_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of the advertised length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let full = String::from_utf8_lossy(&buf[..end]).into_owned();
    match full.split('.').next() {
        Some(short) if !short.is_empty() => short.to_string(),
        _ => full,
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Row filter for [`Dss::media_get`].
#[derive(Clone, Debug, Default)]
pub struct MediaFilter {
    pub family: Option<Family>,
    pub library: Option<String>,
    /// Exact names; `None` means any.
    pub names: Option<Vec<String>>,
    pub adm_status: Option<AdmStatus>,
}

impl MediaFilter {
    pub fn family(family: Family) -> Self {
        Self {
            family: Some(family),
            ..Default::default()
        }
    }

    pub fn one(id: &ResourceId) -> Self {
        Self {
            family: Some(id.family),
            library: Some(id.library.clone()),
            names: Some(vec![id.name.clone()]),
            adm_status: None,
        }
    }

    pub fn matches(&self, m: &Medium) -> bool {
        if let Some(f) = self.family {
            if m.id.family != f {
                return false;
            }
        }
        if let Some(ref lib) = self.library {
            if &m.id.library != lib {
                return false;
            }
        }
        if let Some(ref names) = self.names {
            if !names.iter().any(|n| n == &m.id.name) {
                return false;
            }
        }
        if let Some(adm) = self.adm_status {
            if m.adm_status != adm {
                return false;
            }
        }
        true
    }
}

/// Row filter for [`Dss::device_get`].
#[derive(Clone, Debug, Default)]
pub struct DeviceFilter {
    pub family: Option<Family>,
    pub host: Option<String>,
    pub names: Option<Vec<String>>,
}

impl DeviceFilter {
    pub fn for_host(family: Family, host: impl Into<String>) -> Self {
        Self {
            family: Some(family),
            host: Some(host.into()),
            names: None,
        }
    }

    pub fn one(id: &ResourceId) -> Self {
        Self {
            family: Some(id.family),
            host: None,
            names: Some(vec![id.name.clone()]),
        }
    }

    pub fn matches(&self, d: &Device) -> bool {
        if let Some(f) = self.family {
            if d.id.family != f {
                return false;
            }
        }
        if let Some(ref host) = self.host {
            if &d.host != host {
                return false;
            }
        }
        if let Some(ref names) = self.names {
            if !names.iter().any(|n| n == &d.id.name) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Object and layout rows
// ============================================================================

/// Object metadata row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub oid: String,
    /// User metadata blob (JSON).
    pub user_md: String,
    pub version: u32,
}

/// One extent of an object layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtentInfo {
    pub medium: ResourceId,
    /// Adapter address of the extent on the medium.
    pub address: String,
    pub size: u64,
}

/// Layout row: where the extents of an object live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutInfo {
    pub oid: String,
    pub extents: Vec<ExtentInfo>,
}

// ============================================================================
// The DSS trait
// ============================================================================

/// Operations the LRS requires from the shared cluster database.
///
/// Lock calls are atomic over their resource list: either every resource is
/// locked/unlocked or none is, and the first conflicting resource is
/// reported.
pub trait Dss: Send {
    // -- media rows ----------------------------------------------------------

    fn media_get(&self, filter: &MediaFilter) -> DssResult<Vec<Medium>>;
    fn media_insert(&self, medium: &Medium) -> DssResult<()>;
    fn media_update(&self, medium: &Medium) -> DssResult<()>;

    // -- media locks ---------------------------------------------------------

    fn media_lock(&self, ids: &[ResourceId], owner: &LockOwner, is_early: bool) -> DssResult<()>;
    fn media_unlock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()>;
    /// Flip early locks held by `owner` to normal locks.
    fn media_lock_convert(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()>;
    /// Current lock holder of a medium, for locate flows.
    fn media_lock_owner(&self, id: &ResourceId) -> DssResult<Option<LockRecord>>;

    // -- device rows ---------------------------------------------------------

    fn device_get(&self, filter: &DeviceFilter) -> DssResult<Vec<Device>>;
    fn device_insert(&self, device: &Device) -> DssResult<()>;
    fn device_update(&self, device: &Device) -> DssResult<()>;

    // -- device locks --------------------------------------------------------

    fn device_lock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()>;
    fn device_unlock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()>;

    // -- health --------------------------------------------------------------

    /// Persisted health counter of a medium.
    fn medium_health(&self, id: &ResourceId) -> DssResult<u32>;
    fn medium_health_set(&self, id: &ResourceId, health: u32) -> DssResult<()>;

    // -- objects and layouts -------------------------------------------------

    fn object_get(&self, oid: &str) -> DssResult<ObjectInfo>;
    fn object_insert(&self, object: &ObjectInfo) -> DssResult<()>;
    fn deprecated_object_get(&self, oid: &str) -> DssResult<Vec<ObjectInfo>>;
    fn layout_get(&self, oid: &str) -> DssResult<LayoutInfo>;

    // -- global configuration store ------------------------------------------

    fn config_get(&self, section: &str, key: &str) -> DssResult<Option<String>>;
    fn config_set(&self, section: &str, key: &str, value: &str) -> DssResult<()>;
}

/// Per-thread handle factory.
///
/// Each thread that speaks to the DSS holds its own handle; there is no
/// hidden sharing of connections across threads.
pub trait DssFactory: Send + Sync {
    fn connect(&self) -> DssResult<Box<dyn Dss>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FsType;

    #[test]
    fn short_hostname_has_no_dot() {
        assert!(!short_hostname().contains('.'));
        assert!(!short_hostname().is_empty());
    }

    #[test]
    fn media_filter_matches_family_and_name() {
        let id = ResourceId::new(Family::Dir, "d0", "legacy");
        let m = Medium::new(id.clone(), FsType::Posix, 1);
        assert!(MediaFilter::one(&id).matches(&m));
        assert!(MediaFilter::family(Family::Dir).matches(&m));
        assert!(!MediaFilter::family(Family::Tape).matches(&m));
    }
}
