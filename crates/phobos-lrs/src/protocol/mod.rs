// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol of the request socket.
//!
//! Messages are framed as a 4-byte big-endian length followed by the
//! payload. A payload starts with a 1-byte protocol version (current 1) and
//! a 1-byte message kind, then the opaque client token and the fixed-width
//! little-endian fields of the message. Unknown versions are answered with
//! `EPROTONOSUPPORT`; the token is echoed verbatim in every response so the
//! transport can route it back.
//!
//! # Wire Format
//!
//! ```text
//! +----------------+---------+------+-----------+----------------+
//! | Length (4B BE) | version | kind | token 8B  | message fields |
//! +----------------+---------+------+-----------+----------------+
//! ```

pub mod codec;
pub mod frame;

pub use codec::{pack_request, pack_response, unpack_request, unpack_response};
pub use frame::FrameCodec;

use crate::types::{AddrType, Family, FsType, ResourceId};

/// Protocol version emitted and accepted by this daemon.
pub const PROTOCOL_VERSION: u8 = 1;

/// Opaque client token echoed from request to response.
pub type Token = u64;

// ============================================================================
// Request model
// ============================================================================

/// Kind tag of a request (also carried inside error responses).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Write,
    Read,
    Release,
    Format,
    Notify,
    Monitor,
    Configure,
    Ping,
}

impl RequestKind {
    pub fn wire_tag(&self) -> u8 {
        match self {
            RequestKind::Write => 1,
            RequestKind::Read => 2,
            RequestKind::Release => 3,
            RequestKind::Format => 4,
            RequestKind::Notify => 5,
            RequestKind::Monitor => 6,
            RequestKind::Configure => 7,
            RequestKind::Ping => 8,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<RequestKind> {
        match tag {
            1 => Some(RequestKind::Write),
            2 => Some(RequestKind::Read),
            3 => Some(RequestKind::Release),
            4 => Some(RequestKind::Format),
            5 => Some(RequestKind::Notify),
            6 => Some(RequestKind::Monitor),
            7 => Some(RequestKind::Configure),
            8 => Some(RequestKind::Ping),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestKind::Write => "write",
            RequestKind::Read => "read",
            RequestKind::Release => "release",
            RequestKind::Format => "format",
            RequestKind::Notify => "notify",
            RequestKind::Monitor => "monitor",
            RequestKind::Configure => "configure",
            RequestKind::Ping => "ping",
        };
        f.write_str(s)
    }
}

/// One medium slot of a write allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteMediumSpec {
    /// Bytes this slot intends to write.
    pub size: u64,
    /// Tags the selected medium must carry (multiset containment).
    pub tags: Vec<String>,
}

/// Write allocation: N media under tag/grouping/library constraints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteReq {
    pub family: Family,
    pub media: Vec<WriteMediumSpec>,
    /// Write affinity grouping, when requested.
    pub grouping: Option<String>,
    /// Restrict candidates to one library.
    pub library: Option<String>,
    /// A single medium must hold the whole write.
    pub no_split: bool,
    /// Each slot must land on a distinct medium.
    pub prevent_duplicate: bool,
}

/// Read allocation over an explicit candidate list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadReq {
    pub family: Family,
    /// Candidate media, any `n_required` of which satisfy the read.
    pub media: Vec<ResourceId>,
    pub n_required: u32,
}

/// Which side of a session a release ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseKind {
    Read,
    Write,
}

/// One medium of a release request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseMedium {
    pub medium: ResourceId,
    /// Bytes written during the session (write releases).
    pub size_written: u64,
    /// Extents appended during the session (write releases).
    pub nb_extents_written: u32,
    /// Gate the acknowledgement behind a sync point.
    pub to_sync: bool,
}

/// Release of a previous allocation, possibly partial (multi-part writes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseReq {
    pub kind: ReleaseKind,
    pub media: Vec<ReleaseMedium>,
    /// Partial releases keep the session open and skip the sync gate.
    pub partial: bool,
}

/// Format one medium.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatReq {
    pub medium: ResourceId,
    pub fs: FsType,
    /// Unlock the medium for scheduling once formatted.
    pub unlock: bool,
    /// Format even when the medium does not look blank.
    pub force: bool,
}

/// Resource add/remove notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOp {
    DeviceAdd,
    DeviceRemove,
    MediumAdd,
    MediumRemove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyReq {
    pub op: NotifyOp,
    pub resource: ResourceId,
    /// Block the response until the operation is applied.
    pub wait: bool,
}

/// Introspection of one family's devices and queues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorReq {
    pub family: Family,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigureOp {
    Get,
    Set,
}

/// One (section, key, value) triple of a configure request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEntry {
    pub section: String,
    pub key: String,
    /// Present on set; carries the result on get responses.
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigureReq {
    pub op: ConfigureOp,
    pub entries: Vec<ConfigEntry>,
}

/// A client request, decoded from one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Write(WriteReq),
    Read(ReadReq),
    Release(ReleaseReq),
    Format(FormatReq),
    Notify(NotifyReq),
    Monitor(MonitorReq),
    Configure(ConfigureReq),
    Ping,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Write(_) => RequestKind::Write,
            Request::Read(_) => RequestKind::Read,
            Request::Release(_) => RequestKind::Release,
            Request::Format(_) => RequestKind::Format,
            Request::Notify(_) => RequestKind::Notify,
            Request::Monitor(_) => RequestKind::Monitor,
            Request::Configure(_) => RequestKind::Configure,
            Request::Ping => RequestKind::Ping,
        }
    }
}

// ============================================================================
// Response model
// ============================================================================

/// One allocated medium of a write response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteMediumAlloc {
    pub medium: ResourceId,
    /// Root path under which the client writes its extents.
    pub root_path: String,
    pub fs_type: FsType,
    pub addr_type: AddrType,
    /// Free bytes on the medium at allocation time.
    pub avail_size: u64,
}

/// One allocated medium of a read response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadMediumAlloc {
    pub medium: ResourceId,
    pub root_path: String,
    pub fs_type: FsType,
    pub addr_type: AddrType,
}

/// A response, encoded into one frame with the request's token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Write {
        media: Vec<WriteMediumAlloc>,
    },
    Read {
        media: Vec<ReadMediumAlloc>,
    },
    /// Acknowledgement of released media, after any required sync.
    Release {
        kind: ReleaseKind,
        media: Vec<ResourceId>,
        partial: bool,
    },
    Format {
        medium: ResourceId,
    },
    Notify {
        op: NotifyOp,
        resource: ResourceId,
    },
    /// JSON status document.
    Monitor {
        status: String,
    },
    Configure {
        entries: Vec<ConfigEntry>,
    },
    Ping,
    /// Failure: original request kind (when recognized), negative errno,
    /// offending medium when one is identified.
    Error {
        kind: Option<RequestKind>,
        code: i32,
        medium: Option<ResourceId>,
    },
}

impl Response {
    /// Error response for a failed request.
    pub fn error(kind: Option<RequestKind>, err: &crate::error::LrsError) -> Response {
        let medium = match err {
            crate::error::LrsError::MediumFailed(id) | crate::error::LrsError::Busy(id) => {
                Some(id.clone())
            }
            _ => None,
        };
        Response::Error {
            kind,
            code: err.errno(),
            medium,
        }
    }
}
