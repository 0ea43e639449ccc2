// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource model: identifiers, medium and device records, lock records.
//!
//! The registry owns the canonical `Device` records; `Medium` rows live in
//! the media cache and are borrowed by device workers for the duration of a
//! sub-request. A device references its loaded medium by identifier only, so
//! there is never a record cycle between the two.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

// ============================================================================
// Families and identifiers
// ============================================================================

/// Resource family; selects the adapter set and the scheduler instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// Tape cartridges and drives behind a library changer.
    Tape,
    /// POSIX directories (a directory is both the drive and the medium).
    Dir,
    /// RADOS object pools.
    RadosPool,
    /// Reserved disk family (placeholder, no adapter shipped).
    Disk,
}

impl Family {
    /// Canonical lowercase name, as used in configuration keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Tape => "tape",
            Family::Dir => "dir",
            Family::RadosPool => "rados_pool",
            Family::Disk => "disk",
        }
    }

    /// Parse a configuration-style family name.
    pub fn from_str(s: &str) -> Option<Family> {
        match s {
            "tape" => Some(Family::Tape),
            "dir" => Some(Family::Dir),
            "rados_pool" => Some(Family::RadosPool),
            "disk" => Some(Family::Disk),
            _ => None,
        }
    }

    /// Wire tag for the cursor codec.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Family::Tape => 0,
            Family::Dir => 1,
            Family::RadosPool => 2,
            Family::Disk => 3,
        }
    }

    /// Inverse of [`Family::wire_tag`].
    pub fn from_wire_tag(tag: u8) -> Option<Family> {
        match tag {
            0 => Some(Family::Tape),
            1 => Some(Family::Dir),
            2 => Some(Family::RadosPool),
            3 => Some(Family::Disk),
            _ => None,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global resource identifier: `(family, name, library)`.
///
/// Equality is componentwise; two tapes with the same label in different
/// libraries are distinct resources.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub family: Family,
    pub name: String,
    pub library: String,
}

impl ResourceId {
    pub fn new(family: Family, name: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
            library: library.into(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.family, self.name, self.library)
    }
}

// ============================================================================
// Administrative and filesystem status
// ============================================================================

/// Administrative status set by operators (and by health exhaustion).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmStatus {
    /// Excluded from scheduling until an operator unlocks it.
    Locked,
    /// Available for scheduling.
    Unlocked,
    /// Permanently failed; requires admin intervention.
    Failed,
}

/// Filesystem type carried by a medium.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsType {
    Posix,
    Ltfs,
    Rados,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Posix => "posix",
            FsType::Ltfs => "ltfs",
            FsType::Rados => "rados",
        }
    }
}

/// Content status of a medium's filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsStatus {
    /// Never formatted.
    Blank,
    /// Formatted, no object written yet.
    Empty,
    /// Holds live extents.
    Used,
    /// No further writes accepted.
    Full,
}

/// Extent address encoding used on a medium.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    /// Extent address is a relative path.
    Path,
    /// Extent address is a hashed path layout.
    Hash1,
    /// Adapter-private opaque address.
    Opaque,
}

/// Per-operation admission flags of a medium.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    pub put: bool,
    pub get: bool,
    pub delete: bool,
}

impl Default for OperationFlags {
    fn default() -> Self {
        Self {
            put: true,
            get: true,
            delete: true,
        }
    }
}

/// Space accounting of a medium, refreshed by statfs after each mount/sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumStats {
    /// Bytes physically used.
    pub phys_spc_used: u64,
    /// Bytes still writable.
    pub phys_spc_free: u64,
    /// Number of objects hosted.
    pub nb_obj: u64,
}

// ============================================================================
// Lock records
// ============================================================================

/// Cooperative DSS lock: `(hostname, owner-pid, timestamp, is-early)`.
///
/// An early lock reserves a resource across a multi-step operation; it is
/// converted to a normal lock on success or released on abort. The DSS
/// enforces that two hosts never hold a non-early lock on the same resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub hostname: String,
    pub owner_pid: u32,
    pub timestamp: SystemTime,
    pub is_early: bool,
}

impl LockRecord {
    /// True when `owner` designates the same (hostname, pid).
    pub fn is_owned_by(&self, hostname: &str, pid: u32) -> bool {
        self.hostname == hostname && self.owner_pid == pid
    }
}

// ============================================================================
// Medium
// ============================================================================

/// A storage container: tape cartridge, directory root or object pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Medium {
    pub id: ResourceId,
    pub model: Option<String>,
    pub adm_status: AdmStatus,
    pub fs_type: FsType,
    pub fs_status: FsStatus,
    pub addr_type: AddrType,
    pub flags: OperationFlags,
    pub stats: MediumStats,
    /// Ordered multiset of tags; a write constraint must be a sub-multiset.
    pub tags: Vec<String>,
    /// Groupings this medium belongs to (write affinity sets).
    pub groupings: Vec<String>,
    /// Current DSS lock, when held.
    pub lock: Option<LockRecord>,
    /// Copies written since the last sync point (sync batching counter).
    pub dirty_copies: u32,
    /// Remaining tolerated failures, in `[0, max_health]`.
    pub health: u32,
}

impl Medium {
    /// Fresh medium row with everything open and no lock.
    pub fn new(id: ResourceId, fs_type: FsType, health: u32) -> Self {
        Self {
            id,
            model: None,
            adm_status: AdmStatus::Locked,
            fs_type,
            fs_status: FsStatus::Blank,
            addr_type: AddrType::Hash1,
            flags: OperationFlags::default(),
            stats: MediumStats::default(),
            tags: Vec::new(),
            groupings: Vec::new(),
            lock: None,
            dirty_copies: 0,
            health,
        }
    }

    /// Invariant: a medium is failed iff health is 0 or adm status is failed.
    pub fn is_failed(&self) -> bool {
        self.health == 0 || self.adm_status == AdmStatus::Failed
    }

    /// Eligible for a write allocation.
    pub fn is_writable(&self) -> bool {
        !self.is_failed()
            && self.adm_status == AdmStatus::Unlocked
            && self.flags.put
            && self.fs_status != FsStatus::Full
            && self.fs_status != FsStatus::Blank
    }

    /// Eligible for a read allocation.
    pub fn is_readable(&self) -> bool {
        !self.is_failed() && self.adm_status == AdmStatus::Unlocked && self.flags.get
    }

    /// True when every tag in `required` appears at least as many times here.
    pub fn matches_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| {
            let want = required.iter().filter(|r| *r == t).count();
            let have = self.tags.iter().filter(|m| *m == t).count();
            have >= want
        })
    }

    /// True when the medium belongs to the requested grouping (or none asked).
    pub fn matches_grouping(&self, grouping: Option<&str>) -> bool {
        match grouping {
            None => true,
            Some(g) => self.groupings.iter().any(|m| m == g),
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// Operational state of a drive.
///
/// ```text
///       empty  -load->  loaded  -mount->  mounted
///         ^               |                  |
///         +----unload-----+                  |
///        (any) --fail-->  failed  <---fail---+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// No medium in the drive.
    #[default]
    Empty,
    /// Medium present, filesystem not mounted.
    Loaded,
    /// Medium mounted and usable.
    Mounted,
    /// Health exhausted or admin-failed; terminal until intervention.
    Failed,
}

impl DeviceState {
    /// Operational states can accept sub-requests.
    pub fn is_operational(&self) -> bool {
        !matches!(self, DeviceState::Failed)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Empty => "empty",
            DeviceState::Loaded => "loaded",
            DeviceState::Mounted => "mounted",
            DeviceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A physical or logical read/write unit (tape drive, directory, pool handle).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: ResourceId,
    pub model: Option<String>,
    pub adm_status: AdmStatus,
    /// Short form of the FQDN of the host this device is assigned to.
    pub host: String,
    /// Device node or directory path.
    pub path: String,
    pub state: DeviceState,
    /// Identifier of the loaded medium; the row itself stays in the cache.
    pub loaded_medium: Option<ResourceId>,
    pub mount_point: Option<PathBuf>,
    pub lock: Option<LockRecord>,
    pub health: u32,
}

impl Device {
    pub fn new(id: ResourceId, host: impl Into<String>, path: impl Into<String>, health: u32) -> Self {
        Self {
            id,
            model: None,
            adm_status: AdmStatus::Unlocked,
            host: host.into(),
            path: path.into(),
            state: DeviceState::Empty,
            loaded_medium: None,
            mount_point: None,
            lock: None,
            health,
        }
    }

    /// Invariant mirror of [`Medium::is_failed`].
    pub fn is_failed(&self) -> bool {
        self.health == 0 || self.adm_status == AdmStatus::Failed || self.state == DeviceState::Failed
    }

    /// Schedulable: unlocked, healthy, not failed.
    pub fn is_schedulable(&self) -> bool {
        self.adm_status == AdmStatus::Unlocked && !self.is_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn medium(tags: &[&str]) -> Medium {
        let mut m = Medium::new(
            ResourceId::new(Family::Tape, "P00001", "legacy"),
            FsType::Ltfs,
            1,
        );
        m.adm_status = AdmStatus::Unlocked;
        m.fs_status = FsStatus::Empty;
        m.tags = tags.iter().map(|s| s.to_string()).collect();
        m
    }

    #[test]
    fn resource_id_equality_is_componentwise() {
        let a = ResourceId::new(Family::Tape, "P00001", "legacy");
        let b = ResourceId::new(Family::Tape, "P00001", "legacy");
        let c = ResourceId::new(Family::Tape, "P00001", "vault");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tag_matching_is_multiset_containment() {
        let m = medium(&["prod", "prod", "eu"]);
        assert!(m.matches_tags(&["prod".into()]));
        assert!(m.matches_tags(&["prod".into(), "prod".into()]));
        assert!(!m.matches_tags(&["prod".into(), "prod".into(), "prod".into()]));
        assert!(!m.matches_tags(&["us".into()]));
        assert!(m.matches_tags(&[]));
    }

    #[test]
    fn failed_invariant_tracks_health_and_adm_status() {
        let mut m = medium(&[]);
        assert!(!m.is_failed());
        m.health = 0;
        assert!(m.is_failed());
        m.health = 1;
        m.adm_status = AdmStatus::Failed;
        assert!(m.is_failed());
    }

    #[test]
    fn blank_medium_is_not_writable() {
        let mut m = medium(&[]);
        m.fs_status = FsStatus::Blank;
        assert!(!m.is_writable());
        m.fs_status = FsStatus::Empty;
        assert!(m.is_writable());
    }

    #[test]
    fn family_wire_tags_round_trip() {
        for fam in [Family::Tape, Family::Dir, Family::RadosPool, Family::Disk] {
            assert_eq!(Family::from_wire_tag(fam.wire_tag()), Some(fam));
        }
        assert_eq!(Family::from_wire_tag(250), None);
    }
}
