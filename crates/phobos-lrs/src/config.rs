// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration: three-level lookup, copy-on-load snapshot.
//!
//! Lookup order, first match wins:
//!
//! 1. process environment: `PHOBOS_<SECTION>_<KEY>`;
//! 2. TOML file of `[section]` tables (default `/etc/phobos.conf`,
//!    overridable with `PHOBOS_CFG_FILE`);
//! 3. the optional DSS-backed global store, absorbed after the DSS
//!    connection is up and refreshed by `configure` requests.
//!
//! The parsed snapshot is immutable and shared through an
//! `ArcSwap<Config>`; callers `load()` a cheap `Arc` clone and never hold a
//! lock across a lookup.

use crate::error::{LrsError, Result};
use crate::types::Family;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the configuration file path.
pub const CFG_FILE_ENV: &str = "PHOBOS_CFG_FILE";

/// Default configuration file path.
pub const DEFAULT_CFG_FILE: &str = "/etc/phobos.conf";

const ENV_PREFIX: &str = "PHOBOS";

// ============================================================================
// Write placement policy
// ============================================================================

/// Placement policy for write allocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WritePolicy {
    /// Smallest free space that still fits.
    #[default]
    BestFit,
    /// First candidate large enough, in catalog order.
    FirstFit,
}

impl WritePolicy {
    pub fn from_str(s: &str) -> Option<WritePolicy> {
        match s {
            "best_fit" => Some(WritePolicy::BestFit),
            "first_fit" => Some(WritePolicy::FirstFit),
            _ => None,
        }
    }
}

// ============================================================================
// Sync thresholds
// ============================================================================

/// Per-family sync batching thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncParams {
    /// Oldest pending release age that forces a sync.
    pub time: Duration,
    /// Pending release count that forces a sync.
    pub nb_req: u32,
    /// Pending written bytes that force a sync.
    pub written_bytes: u64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            time: Duration::from_millis(10_000),
            nb_req: 5,
            written_bytes: 1_048_576 * 1024,
        }
    }
}

// ============================================================================
// Config snapshot
// ============================================================================

/// Immutable configuration snapshot.
///
/// `file` holds the parsed TOML level; `global` is the live DSS-backed
/// store, shared between snapshots so a `configure set` is visible without a
/// reload.
pub struct Config {
    file: DashMap<(String, String), String>,
    global: DashMap<(String, String), String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::empty()
    }
}

impl Config {
    /// Empty snapshot (defaults only).
    pub fn empty() -> Self {
        Self {
            file: DashMap::new(),
            global: DashMap::new(),
        }
    }

    /// Load from the default location, honoring `PHOBOS_CFG_FILE`.
    ///
    /// A missing default file yields an empty snapshot; a missing explicit
    /// override is an error.
    pub fn load_default() -> Result<Self> {
        match std::env::var(CFG_FILE_ENV) {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => {
                let default = Path::new(DEFAULT_CFG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::empty())
                }
            }
        }
    }

    /// Load and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LrsError::InvalidRequest(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse a TOML document of `[section]` / `key = value` pairs.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let value: toml::Value = text
            .parse()
            .map_err(|e| LrsError::InvalidRequest(format!("config parse: {}", e)))?;
        let table = value
            .as_table()
            .ok_or_else(|| LrsError::InvalidRequest("config root is not a table".into()))?;

        let cfg = Self::empty();
        for (section, entries) in table {
            let Some(entries) = entries.as_table() else {
                return Err(LrsError::InvalidRequest(format!(
                    "config section [{}] is not a table",
                    section
                )));
            };
            for (key, val) in entries {
                let text = match val {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    other => {
                        return Err(LrsError::InvalidRequest(format!(
                            "config [{}] {}: unsupported value {}",
                            section, key, other
                        )))
                    }
                };
                cfg.file.insert((section.clone(), key.clone()), text);
            }
        }
        Ok(cfg)
    }

    /// Absorb the DSS-backed global store for the given (section, key) pairs
    /// already known locally plus any the backend reports for `lrs`.
    pub fn set_global(&self, section: &str, key: &str, value: &str) {
        self.global
            .insert((section.to_string(), key.to_string()), value.to_string());
    }

    // ------------------------------------------------------------------------
    // Raw lookup
    // ------------------------------------------------------------------------

    /// Three-level lookup.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        if let Ok(v) = std::env::var(env_name(section, key)) {
            return Some(v);
        }
        if let Some(v) = self.file.get(&(section.to_string(), key.to_string())) {
            return Some(v.clone());
        }
        self.global
            .get(&(section.to_string(), key.to_string()))
            .map(|v| v.clone())
    }

    fn get_or<'a>(&self, section: &str, key: &str, default: &'a str) -> String {
        self.get(section, key)
            .unwrap_or_else(|| default.to_string())
    }

    fn get_u64(&self, section: &str, key: &str, default: u64) -> u64 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    // ------------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------------

    /// Families served by this daemon.
    pub fn families(&self) -> Vec<Family> {
        self.get_or("lrs", "families", "dir")
            .split(',')
            .filter_map(|s| Family::from_str(s.trim()))
            .collect()
    }

    /// Path of the client request socket.
    pub fn server_socket(&self) -> PathBuf {
        PathBuf::from(self.get_or("lrs", "server_socket", "/run/phobosd/lrs"))
    }

    /// Path of the single-instance lock file.
    pub fn lock_file(&self) -> PathBuf {
        PathBuf::from(self.get_or("lrs", "lock_file", "/run/phobosd/phobosd.lock"))
    }

    /// Base path prefix for mount points.
    pub fn mount_prefix(&self) -> String {
        self.get_or("lrs", "mount_prefix", "/mnt/phobos-")
    }

    /// Write placement policy.
    pub fn policy(&self) -> WritePolicy {
        self.get("lrs", "policy")
            .and_then(|v| WritePolicy::from_str(&v))
            .unwrap_or_default()
    }

    /// Saturation value of health counters.
    pub fn max_health(&self) -> u32 {
        self.get_u64("lrs", "max_health", 1) as u32
    }

    /// Scheduler loop poll timeout.
    pub fn sched_retry(&self) -> Duration {
        Duration::from_millis(self.get_u64("lrs", "sched_retry_ms", 100))
    }

    /// Read elevation period K for starvation avoidance.
    pub fn read_boost_every(&self) -> u32 {
        self.get_u64("lrs", "read_boost_every", 16).max(1) as u32
    }

    /// Sync thresholds for a family, with per-family key overrides
    /// (`sync_time_ms_tape` beats `sync_time_ms`).
    pub fn sync_params(&self, family: Family) -> SyncParams {
        let defaults = SyncParams::default();
        let scoped = |key: &str, fallback: u64| -> u64 {
            let per_family = format!("{}_{}", key, family.as_str());
            self.get("lrs", &per_family)
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| self.get_u64("lrs", key, fallback))
        };
        SyncParams {
            time: Duration::from_millis(scoped("sync_time_ms", defaults.time.as_millis() as u64)),
            nb_req: scoped("sync_nb_req", u64::from(defaults.nb_req)) as u32,
            written_bytes: scoped("sync_wsize_kb", defaults.written_bytes / 1024) * 1024,
        }
    }

    /// Scheduler algorithm selector for one family and request kind
    /// (`read_algo`, `write_algo`, `format_algo`).
    pub fn io_sched_algo(&self, family: Family, kind_key: &str) -> String {
        let section = format!("io_sched_{}", family.as_str());
        self.get_or(&section, kind_key, "fifo")
    }

    /// Library controller endpoint for a tape library, when configured.
    pub fn tlc_endpoint(&self, library: &str) -> Option<(String, u16)> {
        let section = format!("tlc_{}", library);
        let hostname = self.get(&section, "hostname")?;
        let port = self.get(&section, "port")?.parse().ok()?;
        Some((hostname, port))
    }
}

/// `PHOBOS_<SECTION>_<KEY>`, upper-cased.
fn env_name(section: &str, key: &str) -> String {
    format!(
        "{}_{}_{}",
        ENV_PREFIX,
        section.to_uppercase(),
        key.to_uppercase()
    )
}
