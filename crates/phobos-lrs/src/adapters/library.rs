// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Library adapter: changer-side moves between slots and drives.

use crate::error::Result;
use std::time::Duration;

/// Changer element address (slot, drive or import/export position).
pub type ElementAddress = u64;

/// Timeout applied to changer move commands.
pub const LIB_MOVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout applied to changer status queries.
pub const LIB_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Inventory returned by a full scan.
#[derive(Clone, Debug, Default)]
pub struct LibListing {
    /// (drive serial, element address)
    pub drives: Vec<(String, ElementAddress)>,
    /// (medium label, element address)
    pub media: Vec<(String, ElementAddress)>,
}

/// Capability set of a media changer.
///
/// Opening a library is the constructor of the concrete variant; dropping
/// the adapter closes it.
pub trait LibraryAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Element address of the drive with the given serial.
    fn drive_lookup(&self, serial: &str) -> Result<ElementAddress>;

    /// Element address currently holding the labelled medium.
    fn media_lookup(&self, label: &str) -> Result<ElementAddress>;

    /// Move a medium between two element addresses.
    fn media_move(&self, source: ElementAddress, dest: ElementAddress) -> Result<()>;

    /// Full inventory scan.
    fn scan(&self) -> Result<LibListing>;
}

// ============================================================================
// Directory family
// ============================================================================

/// Changer for families without physical moves: every medium is "already in
/// its drive", every move succeeds immediately.
pub struct NoopLibrary;

impl NoopLibrary {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoopLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryAdapter for NoopLibrary {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn drive_lookup(&self, _serial: &str) -> Result<ElementAddress> {
        Ok(0)
    }

    fn media_lookup(&self, _label: &str) -> Result<ElementAddress> {
        Ok(0)
    }

    fn media_move(&self, _source: ElementAddress, _dest: ElementAddress) -> Result<()> {
        Ok(())
    }

    fn scan(&self) -> Result<LibListing> {
        Ok(LibListing::default())
    }
}
