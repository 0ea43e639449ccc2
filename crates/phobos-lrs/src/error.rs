// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type for LRS operations.
//!
//! Every client-visible failure maps to a negative errno-like integer that is
//! carried in the error response next to the original request kind. Internal
//! callers match on the enum; only the wire layer uses [`LrsError::errno`].

use crate::dss::DssError;
use crate::types::ResourceId;
use std::io;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, LrsError>;

/// Errors surfaced by the LRS core.
#[derive(Debug)]
pub enum LrsError {
    // ========================================================================
    // Protocol errors
    // ========================================================================
    /// Request or parameter is malformed.
    InvalidRequest(String),
    /// Unknown protocol version byte in a framed message.
    ProtocolVersion(u8),
    /// Frame payload could not be decoded.
    BadMessage(String),

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// Resource is not known to the registry or the DSS.
    NotFound(ResourceId),
    /// No medium satisfies the allocation constraints right now.
    NoMediumAvailable,
    /// No device can host the selected medium right now.
    NoDeviceAvailable,
    /// Medium has reached health zero or is administratively failed.
    MediumFailed(ResourceId),
    /// Device has reached health zero or is administratively failed.
    DeviceFailed(ResourceId),
    /// Resource is busy (loaded, mounted or queued on a worker).
    Busy(ResourceId),
    /// Medium is full or the filesystem refused the write for space reasons.
    NoSpace,
    /// Medium switched to read-only (EROFS/EDQUOT path).
    ReadOnly,

    // ========================================================================
    // Ownership errors
    // ========================================================================
    /// A DSS lock on the resource is held by another owner.
    LockConflict {
        /// Resource whose lock was contended.
        resource: ResourceId,
        /// Owning hostname when the DSS reported it.
        owner: Option<String>,
    },
    /// Double initialization of the context, daemon or lock file.
    AlreadyInitialized(String),

    // ========================================================================
    // External failures
    // ========================================================================
    /// DSS query or update failed.
    Dss(DssError),
    /// Underlying I/O failure (adapter, mount, sync).
    Io(io::Error),
    /// Transient failure after the bounded retry budget was exhausted.
    RetriesExhausted(String),

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// Daemon is shutting down; in-flight sub-requests are drained with this.
    Shutdown,
}

impl std::fmt::Display for LrsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LrsError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            LrsError::ProtocolVersion(v) => write!(f, "unsupported protocol version {}", v),
            LrsError::BadMessage(msg) => write!(f, "bad message: {}", msg),
            LrsError::NotFound(id) => write!(f, "resource not found: {}", id),
            LrsError::NoMediumAvailable => write!(f, "no medium satisfies the allocation"),
            LrsError::NoDeviceAvailable => write!(f, "no device can host the medium"),
            LrsError::MediumFailed(id) => write!(f, "medium failed: {}", id),
            LrsError::DeviceFailed(id) => write!(f, "device failed: {}", id),
            LrsError::Busy(id) => write!(f, "resource busy: {}", id),
            LrsError::NoSpace => write!(f, "no space left on medium"),
            LrsError::ReadOnly => write!(f, "medium is read-only"),
            LrsError::LockConflict { resource, owner } => match owner {
                Some(host) => write!(f, "lock on {} held by {}", resource, host),
                None => write!(f, "lock on {} held by another owner", resource),
            },
            LrsError::AlreadyInitialized(what) => write!(f, "{} already initialized", what),
            LrsError::Dss(e) => write!(f, "dss: {}", e),
            LrsError::Io(e) => write!(f, "i/o: {}", e),
            LrsError::RetriesExhausted(what) => write!(f, "retries exhausted: {}", what),
            LrsError::Shutdown => write!(f, "daemon is shutting down"),
        }
    }
}

impl std::error::Error for LrsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LrsError::Io(e) => Some(e),
            LrsError::Dss(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LrsError {
    fn from(e: io::Error) -> Self {
        LrsError::Io(e)
    }
}

impl From<DssError> for LrsError {
    fn from(e: DssError) -> Self {
        match e {
            DssError::LockConflict { resource, owner } => LrsError::LockConflict {
                resource,
                owner: owner.map(|o| o.hostname),
            },
            DssError::NotFound(id) => LrsError::NotFound(id),
            other => LrsError::Dss(other),
        }
    }
}

impl LrsError {
    /// Negative errno-like code carried in error responses.
    pub fn errno(&self) -> i32 {
        let code = match self {
            LrsError::InvalidRequest(_) => libc::EINVAL,
            LrsError::ProtocolVersion(_) => libc::EPROTONOSUPPORT,
            LrsError::BadMessage(_) => libc::EBADMSG,
            LrsError::NotFound(_) => libc::ENXIO,
            LrsError::NoMediumAvailable => libc::ENOSPC,
            LrsError::NoDeviceAvailable => libc::EAGAIN,
            LrsError::MediumFailed(_) | LrsError::DeviceFailed(_) => libc::EIO,
            LrsError::Busy(_) => libc::EBUSY,
            LrsError::NoSpace => libc::ENOSPC,
            LrsError::ReadOnly => libc::EROFS,
            LrsError::LockConflict { .. } => libc::EALREADY,
            LrsError::AlreadyInitialized(_) => libc::EEXIST,
            LrsError::Dss(_) => libc::EIO,
            LrsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            LrsError::RetriesExhausted(_) => libc::EAGAIN,
            LrsError::Shutdown => libc::ESHUTDOWN,
        };
        -code
    }

    /// True for transient failures worth retrying on another device/medium.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LrsError::NoDeviceAvailable | LrsError::Busy(_) | LrsError::RetriesExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Family, ResourceId};

    fn tape(name: &str) -> ResourceId {
        ResourceId::new(Family::Tape, name, "legacy")
    }

    #[test]
    fn errno_codes_are_negative() {
        let errs = [
            LrsError::InvalidRequest("x".into()),
            LrsError::ProtocolVersion(9),
            LrsError::NoMediumAvailable,
            LrsError::Shutdown,
        ];
        for e in errs {
            assert!(e.errno() < 0, "{} must map to a negative code", e);
        }
    }

    #[test]
    fn lock_conflict_and_double_init_are_distinct() {
        let conflict = LrsError::LockConflict {
            resource: tape("P00001"),
            owner: Some("node2".into()),
        };
        let double_init = LrsError::AlreadyInitialized("context".into());
        assert_eq!(conflict.errno(), -libc::EALREADY);
        assert_eq!(double_init.errno(), -libc::EEXIST);
        assert_ne!(conflict.errno(), double_init.errno());
    }

    #[test]
    fn io_error_keeps_raw_os_code() {
        let e = LrsError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.errno(), -libc::ENOSPC);
    }
}
