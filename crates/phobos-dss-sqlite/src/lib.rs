// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite DSS backend.
//!
//! Persistent device/medium rows, objects, layouts, configuration and
//! cooperative locks in one SQLite database. Lock mutual exclusion rides on
//! the primary key of the lock tables: inserting a second lock row for the
//! same resource fails, and list locks run inside one transaction so they
//! are atomic.
//!
//! The factory opens one connection per handle, matching the one-handle-
//! per-thread rule of the DSS interface. For production clusters the DSS is
//! a shared database on the network; this backend covers single-host
//! deployments and tests.
//!
//! # Schema
//!
//! ```sql
//! media        (family, name, library, ..., health, PRIMARY KEY(family, name, library))
//! devices      (family, name, library, host, path, state, ..., PRIMARY KEY(...))
//! media_locks  (family, name, library, hostname, pid, ts, early, PRIMARY KEY(...))
//! device_locks (family, name, library, hostname, pid, ts, early, PRIMARY KEY(...))
//! objects      (oid PRIMARY KEY, user_md, version)
//! deprecated_objects (oid, user_md, version)
//! layout_extents (oid, ord, family, name, library, address, size)
//! conf         (section, key, value, PRIMARY KEY(section, key))
//! ```

use phobos_lrs::dss::{
    DeviceFilter, Dss, DssError, DssFactory, DssResult, ExtentInfo, LayoutInfo, LockOwner,
    MediaFilter, ObjectInfo,
};
use phobos_lrs::types::{
    AddrType, AdmStatus, Device, DeviceState, Family, FsStatus, FsType, LockRecord, Medium,
    MediumStats, OperationFlags, ResourceId,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// Factory and handle
// ============================================================================

/// Opens one connection per handle against a shared database file.
#[derive(Clone)]
pub struct SqliteDssFactory {
    path: PathBuf,
}

impl SqliteDssFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DssFactory for SqliteDssFactory {
    fn connect(&self) -> DssResult<Box<dyn Dss>> {
        Ok(Box::new(SqliteDss::open(&self.path)?))
    }
}

/// One connection to the DSS database.
pub struct SqliteDss {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> DssError {
    DssError::Query(e.to_string())
}

impl SqliteDss {
    /// Open (and initialize) the database at `path`.
    pub fn open(path: &Path) -> DssResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(|e| DssError::Connection(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        let dss = Self {
            conn: Mutex::new(conn),
        };
        dss.init_schema()?;
        Ok(dss)
    }

    /// In-memory database for tests. Each call is its own universe; use the
    /// file-backed factory when handles must share state.
    pub fn open_in_memory() -> DssResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DssError::Connection(e.to_string()))?;
        let dss = Self {
            conn: Mutex::new(conn),
        };
        dss.init_schema()?;
        Ok(dss)
    }

    fn init_schema(&self) -> DssResult<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS media (
                family TEXT NOT NULL,
                name TEXT NOT NULL,
                library TEXT NOT NULL,
                model TEXT,
                adm_status TEXT NOT NULL,
                fs_type TEXT NOT NULL,
                fs_status TEXT NOT NULL,
                addr_type TEXT NOT NULL,
                flag_put INTEGER NOT NULL,
                flag_get INTEGER NOT NULL,
                flag_delete INTEGER NOT NULL,
                spc_used INTEGER NOT NULL,
                spc_free INTEGER NOT NULL,
                nb_obj INTEGER NOT NULL,
                tags TEXT NOT NULL,
                groupings TEXT NOT NULL,
                dirty_copies INTEGER NOT NULL,
                health INTEGER NOT NULL,
                PRIMARY KEY (family, name, library)
            );
            CREATE TABLE IF NOT EXISTS devices (
                family TEXT NOT NULL,
                name TEXT NOT NULL,
                library TEXT NOT NULL,
                model TEXT,
                adm_status TEXT NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                state TEXT NOT NULL,
                loaded_medium TEXT,
                mount_point TEXT,
                health INTEGER NOT NULL,
                PRIMARY KEY (family, name, library)
            );
            CREATE TABLE IF NOT EXISTS media_locks (
                family TEXT NOT NULL,
                name TEXT NOT NULL,
                library TEXT NOT NULL,
                hostname TEXT NOT NULL,
                pid INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                early INTEGER NOT NULL,
                PRIMARY KEY (family, name, library)
            );
            CREATE TABLE IF NOT EXISTS device_locks (
                family TEXT NOT NULL,
                name TEXT NOT NULL,
                library TEXT NOT NULL,
                hostname TEXT NOT NULL,
                pid INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                early INTEGER NOT NULL,
                PRIMARY KEY (family, name, library)
            );
            CREATE TABLE IF NOT EXISTS objects (
                oid TEXT PRIMARY KEY,
                user_md TEXT NOT NULL,
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS deprecated_objects (
                oid TEXT NOT NULL,
                user_md TEXT NOT NULL,
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS layout_extents (
                oid TEXT NOT NULL,
                ord INTEGER NOT NULL,
                family TEXT NOT NULL,
                name TEXT NOT NULL,
                library TEXT NOT NULL,
                address TEXT NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (oid, ord)
            );
            CREATE TABLE IF NOT EXISTS conf (
                section TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (section, key)
            );",
        )
        .map_err(db_err)
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Enum <-> TEXT mapping
// ============================================================================

fn adm_to_str(adm: AdmStatus) -> &'static str {
    match adm {
        AdmStatus::Locked => "locked",
        AdmStatus::Unlocked => "unlocked",
        AdmStatus::Failed => "failed",
    }
}

fn adm_from_str(s: &str) -> DssResult<AdmStatus> {
    match s {
        "locked" => Ok(AdmStatus::Locked),
        "unlocked" => Ok(AdmStatus::Unlocked),
        "failed" => Ok(AdmStatus::Failed),
        other => Err(DssError::Query(format!("bad adm_status '{}'", other))),
    }
}

fn fs_type_from_str(s: &str) -> DssResult<FsType> {
    match s {
        "posix" => Ok(FsType::Posix),
        "ltfs" => Ok(FsType::Ltfs),
        "rados" => Ok(FsType::Rados),
        other => Err(DssError::Query(format!("bad fs_type '{}'", other))),
    }
}

fn fs_status_to_str(s: FsStatus) -> &'static str {
    match s {
        FsStatus::Blank => "blank",
        FsStatus::Empty => "empty",
        FsStatus::Used => "used",
        FsStatus::Full => "full",
    }
}

fn fs_status_from_str(s: &str) -> DssResult<FsStatus> {
    match s {
        "blank" => Ok(FsStatus::Blank),
        "empty" => Ok(FsStatus::Empty),
        "used" => Ok(FsStatus::Used),
        "full" => Ok(FsStatus::Full),
        other => Err(DssError::Query(format!("bad fs_status '{}'", other))),
    }
}

fn addr_to_str(a: AddrType) -> &'static str {
    match a {
        AddrType::Path => "path",
        AddrType::Hash1 => "hash1",
        AddrType::Opaque => "opaque",
    }
}

fn addr_from_str(s: &str) -> DssResult<AddrType> {
    match s {
        "path" => Ok(AddrType::Path),
        "hash1" => Ok(AddrType::Hash1),
        "opaque" => Ok(AddrType::Opaque),
        other => Err(DssError::Query(format!("bad addr_type '{}'", other))),
    }
}

fn state_to_str(s: DeviceState) -> &'static str {
    match s {
        DeviceState::Empty => "empty",
        DeviceState::Loaded => "loaded",
        DeviceState::Mounted => "mounted",
        DeviceState::Failed => "failed",
    }
}

fn state_from_str(s: &str) -> DssResult<DeviceState> {
    match s {
        "empty" => Ok(DeviceState::Empty),
        "loaded" => Ok(DeviceState::Loaded),
        "mounted" => Ok(DeviceState::Mounted),
        "failed" => Ok(DeviceState::Failed),
        other => Err(DssError::Query(format!("bad device state '{}'", other))),
    }
}

fn family_from_str(s: &str) -> DssResult<Family> {
    Family::from_str(s).ok_or_else(|| DssError::Query(format!("bad family '{}'", s)))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn strings_to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

fn strings_from_json(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

// ============================================================================
// Row mapping
// ============================================================================

fn medium_from_row(row: &Row<'_>) -> rusqlite::Result<Medium> {
    let family: String = row.get(0)?;
    let adm: String = row.get(4)?;
    let fs_type: String = row.get(5)?;
    let fs_status: String = row.get(6)?;
    let addr: String = row.get(7)?;
    let tags: String = row.get(14)?;
    let groupings: String = row.get(15)?;
    let to_sql = |e: DssError| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    };
    Ok(Medium {
        id: ResourceId {
            family: family_from_str(&family).map_err(to_sql)?,
            name: row.get(1)?,
            library: row.get(2)?,
        },
        model: row.get(3)?,
        adm_status: adm_from_str(&adm).map_err(to_sql)?,
        fs_type: fs_type_from_str(&fs_type).map_err(to_sql)?,
        fs_status: fs_status_from_str(&fs_status).map_err(to_sql)?,
        addr_type: addr_from_str(&addr).map_err(to_sql)?,
        flags: OperationFlags {
            put: row.get::<_, i64>(8)? != 0,
            get: row.get::<_, i64>(9)? != 0,
            delete: row.get::<_, i64>(10)? != 0,
        },
        stats: MediumStats {
            phys_spc_used: row.get::<_, i64>(11)? as u64,
            phys_spc_free: row.get::<_, i64>(12)? as u64,
            nb_obj: row.get::<_, i64>(13)? as u64,
        },
        tags: strings_from_json(&tags),
        groupings: strings_from_json(&groupings),
        lock: None,
        dirty_copies: row.get::<_, i64>(16)? as u32,
        health: row.get::<_, i64>(17)? as u32,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let family: String = row.get(0)?;
    let adm: String = row.get(4)?;
    let state: String = row.get(7)?;
    let loaded: Option<String> = row.get(8)?;
    let mount_point: Option<String> = row.get(9)?;
    let to_sql = |e: DssError| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    };
    let family = family_from_str(&family).map_err(to_sql)?;
    Ok(Device {
        id: ResourceId {
            family,
            name: row.get(1)?,
            library: row.get(2)?,
        },
        model: row.get(3)?,
        adm_status: adm_from_str(&adm).map_err(to_sql)?,
        host: row.get(5)?,
        path: row.get(6)?,
        state: state_from_str(&state).map_err(to_sql)?,
        loaded_medium: loaded.map(|name| ResourceId {
            family,
            name,
            library: row.get(2).unwrap_or_default(),
        }),
        mount_point: mount_point.map(PathBuf::from),
        lock: None,
        health: row.get::<_, i64>(10)? as u32,
    })
}

fn lock_from_row(row: &Row<'_>) -> rusqlite::Result<LockRecord> {
    let ts: i64 = row.get(2)?;
    Ok(LockRecord {
        hostname: row.get(0)?,
        owner_pid: row.get::<_, i64>(1)? as u32,
        timestamp: UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64),
        is_early: row.get::<_, i64>(3)? != 0,
    })
}

/// Query a lock table for one resource.
fn query_lock(
    conn: &Connection,
    table: &str,
    id: &ResourceId,
) -> DssResult<Option<LockRecord>> {
    conn.query_row(
        &format!(
            "SELECT hostname, pid, ts, early FROM {} WHERE family=?1 AND name=?2 AND library=?3",
            table
        ),
        params![id.family.as_str(), id.name, id.library],
        lock_from_row,
    )
    .optional()
    .map_err(db_err)
}

/// Atomic list lock inside a transaction: verify all, insert all.
fn lock_list(
    tx: &Transaction<'_>,
    table: &str,
    ids: &[ResourceId],
    owner: &LockOwner,
    early: bool,
) -> DssResult<()> {
    for id in ids {
        let existing = tx
            .query_row(
                &format!(
                    "SELECT hostname, pid, ts, early FROM {} \
                     WHERE family=?1 AND name=?2 AND library=?3",
                    table
                ),
                params![id.family.as_str(), id.name, id.library],
                lock_from_row,
            )
            .optional()
            .map_err(db_err)?;
        if let Some(rec) = existing {
            return Err(DssError::LockConflict {
                resource: id.clone(),
                owner: Some(rec),
            });
        }
    }
    for id in ids {
        tx.execute(
            &format!(
                "INSERT INTO {} (family, name, library, hostname, pid, ts, early) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                table
            ),
            params![
                id.family.as_str(),
                id.name,
                id.library,
                owner.hostname,
                owner.pid as i64,
                now_secs(),
                early as i64
            ],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

/// Atomic list unlock with owner verification.
fn unlock_list(
    tx: &Transaction<'_>,
    table: &str,
    ids: &[ResourceId],
    owner: &LockOwner,
) -> DssResult<()> {
    for id in ids {
        let existing = tx
            .query_row(
                &format!(
                    "SELECT hostname, pid, ts, early FROM {} \
                     WHERE family=?1 AND name=?2 AND library=?3",
                    table
                ),
                params![id.family.as_str(), id.name, id.library],
                lock_from_row,
            )
            .optional()
            .map_err(db_err)?;
        match existing {
            None => return Err(DssError::NotLocked(id.clone())),
            Some(rec) if !rec.is_owned_by(&owner.hostname, owner.pid) => {
                return Err(DssError::LockConflict {
                    resource: id.clone(),
                    owner: Some(rec),
                })
            }
            Some(_) => {}
        }
    }
    for id in ids {
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE family=?1 AND name=?2 AND library=?3",
                table
            ),
            params![id.family.as_str(), id.name, id.library],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

// ============================================================================
// Dss implementation
// ============================================================================

impl Dss for SqliteDss {
    fn media_get(&self, filter: &MediaFilter) -> DssResult<Vec<Medium>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT family, name, library, model, adm_status, fs_type, fs_status, addr_type, \
                 flag_put, flag_get, flag_delete, spc_used, spc_free, nb_obj, tags, groupings, \
                 dirty_copies, health FROM media ORDER BY name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], medium_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<Medium>>>()
            .map_err(db_err)?;
        let mut out = Vec::new();
        for mut medium in rows {
            if !filter.matches(&medium) {
                continue;
            }
            medium.lock = query_lock(&conn, "media_locks", &medium.id)?;
            out.push(medium);
        }
        Ok(out)
    }

    fn media_insert(&self, medium: &Medium) -> DssResult<()> {
        let conn = self.lock_conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO media (family, name, library, model, adm_status, fs_type, \
                 fs_status, addr_type, flag_put, flag_get, flag_delete, spc_used, spc_free, \
                 nb_obj, tags, groupings, dirty_copies, health) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    medium.id.family.as_str(),
                    medium.id.name,
                    medium.id.library,
                    medium.model,
                    adm_to_str(medium.adm_status),
                    medium.fs_type.as_str(),
                    fs_status_to_str(medium.fs_status),
                    addr_to_str(medium.addr_type),
                    medium.flags.put as i64,
                    medium.flags.get as i64,
                    medium.flags.delete as i64,
                    medium.stats.phys_spc_used as i64,
                    medium.stats.phys_spc_free as i64,
                    medium.stats.nb_obj as i64,
                    strings_to_json(&medium.tags),
                    strings_to_json(&medium.groupings),
                    medium.dirty_copies as i64,
                    medium.health as i64,
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(DssError::Query(format!("duplicate medium {}", medium.id)));
        }
        Ok(())
    }

    fn media_update(&self, medium: &Medium) -> DssResult<()> {
        let conn = self.lock_conn();
        let updated = conn
            .execute(
                "UPDATE media SET model=?4, adm_status=?5, fs_type=?6, fs_status=?7, \
                 addr_type=?8, flag_put=?9, flag_get=?10, flag_delete=?11, spc_used=?12, \
                 spc_free=?13, nb_obj=?14, tags=?15, groupings=?16, dirty_copies=?17, health=?18 \
                 WHERE family=?1 AND name=?2 AND library=?3",
                params![
                    medium.id.family.as_str(),
                    medium.id.name,
                    medium.id.library,
                    medium.model,
                    adm_to_str(medium.adm_status),
                    medium.fs_type.as_str(),
                    fs_status_to_str(medium.fs_status),
                    addr_to_str(medium.addr_type),
                    medium.flags.put as i64,
                    medium.flags.get as i64,
                    medium.flags.delete as i64,
                    medium.stats.phys_spc_used as i64,
                    medium.stats.phys_spc_free as i64,
                    medium.stats.nb_obj as i64,
                    strings_to_json(&medium.tags),
                    strings_to_json(&medium.groupings),
                    medium.dirty_copies as i64,
                    medium.health as i64,
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(DssError::NotFound(medium.id.clone()));
        }
        Ok(())
    }

    fn media_lock(&self, ids: &[ResourceId], owner: &LockOwner, is_early: bool) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        lock_list(&tx, "media_locks", ids, owner, is_early)?;
        tx.commit().map_err(db_err)
    }

    fn media_unlock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        unlock_list(&tx, "media_locks", ids, owner)?;
        tx.commit().map_err(db_err)
    }

    fn media_lock_convert(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        for id in ids {
            let existing = tx
                .query_row(
                    "SELECT hostname, pid, ts, early FROM media_locks \
                     WHERE family=?1 AND name=?2 AND library=?3",
                    params![id.family.as_str(), id.name, id.library],
                    lock_from_row,
                )
                .optional()
                .map_err(db_err)?;
            match existing {
                None => return Err(DssError::NotLocked(id.clone())),
                Some(rec) if !rec.is_owned_by(&owner.hostname, owner.pid) => {
                    return Err(DssError::LockConflict {
                        resource: id.clone(),
                        owner: Some(rec),
                    })
                }
                Some(_) => {}
            }
            tx.execute(
                "UPDATE media_locks SET early=0 WHERE family=?1 AND name=?2 AND library=?3",
                params![id.family.as_str(), id.name, id.library],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    fn media_lock_owner(&self, id: &ResourceId) -> DssResult<Option<LockRecord>> {
        let conn = self.lock_conn();
        query_lock(&conn, "media_locks", id)
    }

    fn device_get(&self, filter: &DeviceFilter) -> DssResult<Vec<Device>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT family, name, library, model, adm_status, host, path, state, \
                 loaded_medium, mount_point, health FROM devices ORDER BY name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], device_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<Device>>>()
            .map_err(db_err)?;
        let mut out = Vec::new();
        for mut device in rows {
            if !filter.matches(&device) {
                continue;
            }
            device.lock = query_lock(&conn, "device_locks", &device.id)?;
            out.push(device);
        }
        Ok(out)
    }

    fn device_insert(&self, device: &Device) -> DssResult<()> {
        let conn = self.lock_conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO devices (family, name, library, model, adm_status, host, \
                 path, state, loaded_medium, mount_point, health) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    device.id.family.as_str(),
                    device.id.name,
                    device.id.library,
                    device.model,
                    adm_to_str(device.adm_status),
                    device.host,
                    device.path,
                    state_to_str(device.state),
                    device.loaded_medium.as_ref().map(|m| m.name.clone()),
                    device.mount_point.as_ref().map(|p| p.display().to_string()),
                    device.health as i64,
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(DssError::Query(format!("duplicate device {}", device.id)));
        }
        Ok(())
    }

    fn device_update(&self, device: &Device) -> DssResult<()> {
        let conn = self.lock_conn();
        let updated = conn
            .execute(
                "UPDATE devices SET model=?4, adm_status=?5, host=?6, path=?7, state=?8, \
                 loaded_medium=?9, mount_point=?10, health=?11 \
                 WHERE family=?1 AND name=?2 AND library=?3",
                params![
                    device.id.family.as_str(),
                    device.id.name,
                    device.id.library,
                    device.model,
                    adm_to_str(device.adm_status),
                    device.host,
                    device.path,
                    state_to_str(device.state),
                    device.loaded_medium.as_ref().map(|m| m.name.clone()),
                    device.mount_point.as_ref().map(|p| p.display().to_string()),
                    device.health as i64,
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(DssError::NotFound(device.id.clone()));
        }
        Ok(())
    }

    fn device_lock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        lock_list(&tx, "device_locks", ids, owner, false)?;
        tx.commit().map_err(db_err)
    }

    fn device_unlock(&self, ids: &[ResourceId], owner: &LockOwner) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        unlock_list(&tx, "device_locks", ids, owner)?;
        tx.commit().map_err(db_err)
    }

    fn medium_health(&self, id: &ResourceId) -> DssResult<u32> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT health FROM media WHERE family=?1 AND name=?2 AND library=?3",
            params![id.family.as_str(), id.name, id.library],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .map(|h| h as u32)
        .ok_or_else(|| DssError::NotFound(id.clone()))
    }

    fn medium_health_set(&self, id: &ResourceId, health: u32) -> DssResult<()> {
        let conn = self.lock_conn();
        let updated = conn
            .execute(
                "UPDATE media SET health=?4 WHERE family=?1 AND name=?2 AND library=?3",
                params![id.family.as_str(), id.name, id.library, health as i64],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(DssError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn object_get(&self, oid: &str) -> DssResult<ObjectInfo> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT oid, user_md, version FROM objects WHERE oid=?1",
            params![oid],
            |row| {
                Ok(ObjectInfo {
                    oid: row.get(0)?,
                    user_md: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u32,
                })
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| DssError::ObjectNotFound(oid.to_string()))
    }

    fn object_insert(&self, object: &ObjectInfo) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        // Overwritten generations become deprecated rows.
        tx.execute(
            "INSERT INTO deprecated_objects (oid, user_md, version) \
             SELECT oid, user_md, version FROM objects WHERE oid=?1",
            params![object.oid],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO objects (oid, user_md, version) VALUES (?1, ?2, ?3)",
            params![object.oid, object.user_md, object.version as i64],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn deprecated_object_get(&self, oid: &str) -> DssResult<Vec<ObjectInfo>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT oid, user_md, version FROM deprecated_objects WHERE oid=?1 ORDER BY version",
            )
            .map_err(db_err)?;
        let result = stmt
            .query_map(params![oid], |row| {
                Ok(ObjectInfo {
                    oid: row.get(0)?,
                    user_md: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u32,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<ObjectInfo>>>()
            .map_err(db_err);
        result
    }

    fn layout_get(&self, oid: &str) -> DssResult<LayoutInfo> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT family, name, library, address, size FROM layout_extents \
                 WHERE oid=?1 ORDER BY ord",
            )
            .map_err(db_err)?;
        let extents = stmt
            .query_map(params![oid], |row| {
                let family: String = row.get(0)?;
                Ok((
                    family,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        if extents.is_empty() {
            return Err(DssError::ObjectNotFound(oid.to_string()));
        }
        let mut out = Vec::with_capacity(extents.len());
        for (family, name, library, address, size) in extents {
            out.push(ExtentInfo {
                medium: ResourceId {
                    family: family_from_str(&family)?,
                    name,
                    library,
                },
                address,
                size: size as u64,
            });
        }
        Ok(LayoutInfo {
            oid: oid.to_string(),
            extents: out,
        })
    }

    fn config_get(&self, section: &str, key: &str) -> DssResult<Option<String>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT value FROM conf WHERE section=?1 AND key=?2",
            params![section, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn config_set(&self, section: &str, key: &str, value: &str) -> DssResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO conf (section, key, value) VALUES (?1, ?2, ?3)",
            params![section, key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl SqliteDss {
    /// Seed a layout row (used by tests and provisioning tools).
    pub fn layout_insert(&self, oid: &str, extents: &[ExtentInfo]) -> DssResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM layout_extents WHERE oid=?1", params![oid])
            .map_err(db_err)?;
        for (ord, extent) in extents.iter().enumerate() {
            tx.execute(
                "INSERT INTO layout_extents (oid, ord, family, name, library, address, size) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    oid,
                    ord as i64,
                    extent.medium.family.as_str(),
                    extent.medium.name,
                    extent.medium.library,
                    extent.address,
                    extent.size as i64
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tape(name: &str) -> ResourceId {
        ResourceId::new(Family::Tape, name, "legacy")
    }

    fn sample_medium(name: &str) -> Medium {
        let mut m = Medium::new(tape(name), FsType::Ltfs, 2);
        m.adm_status = AdmStatus::Unlocked;
        m.fs_status = FsStatus::Empty;
        m.tags = vec!["prod".into(), "eu".into()];
        m.stats.phys_spc_free = 4 << 30;
        m
    }

    #[test]
    fn media_rows_round_trip() {
        let dss = SqliteDss::open_in_memory().unwrap();
        let medium = sample_medium("P00001");
        dss.media_insert(&medium).unwrap();

        let rows = dss.media_get(&MediaFilter::one(&medium.id)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tags, medium.tags);
        assert_eq!(rows[0].stats, medium.stats);
        assert_eq!(rows[0].fs_status, FsStatus::Empty);

        assert!(matches!(
            dss.media_insert(&medium),
            Err(DssError::Query(_))
        ));
    }

    #[test]
    fn media_update_persists_changes() {
        let dss = SqliteDss::open_in_memory().unwrap();
        let mut medium = sample_medium("P00001");
        dss.media_insert(&medium).unwrap();

        medium.stats.phys_spc_used = 42;
        medium.flags.put = false;
        dss.media_update(&medium).unwrap();

        let rows = dss.media_get(&MediaFilter::one(&medium.id)).unwrap();
        assert_eq!(rows[0].stats.phys_spc_used, 42);
        assert!(!rows[0].flags.put);
    }

    #[test]
    fn lock_conflicts_report_the_owner() {
        let dss = SqliteDss::open_in_memory().unwrap();
        dss.media_insert(&sample_medium("P00001")).unwrap();
        let a = LockOwner::new("node-a", 1);
        let b = LockOwner::new("node-b", 2);

        dss.media_lock(&[tape("P00001")], &a, true).unwrap();
        match dss.media_lock(&[tape("P00001")], &b, false) {
            Err(DssError::LockConflict { owner, .. }) => {
                let rec = owner.unwrap();
                assert_eq!(rec.hostname, "node-a");
                assert!(rec.is_early);
            }
            other => panic!("expected conflict, got {:?}", other.err()),
        }

        dss.media_lock_convert(&[tape("P00001")], &a).unwrap();
        assert!(!dss.media_lock_owner(&tape("P00001")).unwrap().unwrap().is_early);
        dss.media_unlock(&[tape("P00001")], &a).unwrap();
        assert!(dss.media_lock_owner(&tape("P00001")).unwrap().is_none());
    }

    #[test]
    fn list_lock_rolls_back_on_conflict() {
        let dss = SqliteDss::open_in_memory().unwrap();
        let a = LockOwner::new("node-a", 1);
        let b = LockOwner::new("node-b", 2);
        dss.media_lock(&[tape("P2")], &b, false).unwrap();

        assert!(dss.media_lock(&[tape("P1"), tape("P2")], &a, false).is_err());
        assert!(dss.media_lock_owner(&tape("P1")).unwrap().is_none());
    }

    #[test]
    fn devices_round_trip_with_lock_join() {
        let dss = SqliteDss::open_in_memory().unwrap();
        let mut device = Device::new(tape("drive0"), "node-a", "/dev/st0", 2);
        device.loaded_medium = Some(tape("P00001"));
        dss.device_insert(&device).unwrap();
        let owner = LockOwner::new("node-a", 1);
        dss.device_lock(&[device.id.clone()], &owner).unwrap();

        let rows = dss
            .device_get(&DeviceFilter::for_host(Family::Tape, "node-a"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].loaded_medium.as_ref().unwrap().name, "P00001");
        assert_eq!(rows[0].lock.as_ref().unwrap().hostname, "node-a");
    }

    #[test]
    fn health_column_is_addressable() {
        let dss = SqliteDss::open_in_memory().unwrap();
        dss.media_insert(&sample_medium("P00001")).unwrap();
        assert_eq!(dss.medium_health(&tape("P00001")).unwrap(), 2);
        dss.medium_health_set(&tape("P00001"), 0).unwrap();
        assert_eq!(dss.medium_health(&tape("P00001")).unwrap(), 0);
    }

    #[test]
    fn objects_layouts_and_conf_round_trip() {
        let dss = SqliteDss::open_in_memory().unwrap();
        let v1 = ObjectInfo {
            oid: "obj".into(),
            user_md: "{}".into(),
            version: 1,
        };
        dss.object_insert(&v1).unwrap();
        dss.object_insert(&ObjectInfo {
            version: 2,
            ..v1.clone()
        })
        .unwrap();
        assert_eq!(dss.object_get("obj").unwrap().version, 2);
        assert_eq!(dss.deprecated_object_get("obj").unwrap().len(), 1);

        dss.layout_insert(
            "obj",
            &[ExtentInfo {
                medium: tape("P00001"),
                address: "ext/0".into(),
                size: 1024,
            }],
        )
        .unwrap();
        let layout = dss.layout_get("obj").unwrap();
        assert_eq!(layout.extents.len(), 1);
        assert_eq!(layout.extents[0].medium.name, "P00001");

        dss.config_set("lrs", "policy", "first_fit").unwrap();
        assert_eq!(
            dss.config_get("lrs", "policy").unwrap().as_deref(),
            Some("first_fit")
        );
        assert_eq!(dss.config_get("lrs", "missing").unwrap(), None);
    }

    #[test]
    fn file_backed_handles_share_state() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = SqliteDssFactory::new(tmp.path().join("dss.db"));
        let h1 = factory.connect().unwrap();
        let h2 = factory.connect().unwrap();
        h1.media_insert(&sample_medium("P00001")).unwrap();
        assert_eq!(
            h2.media_get(&MediaFilter::family(Family::Tape))
                .unwrap()
                .len(),
            1
        );
    }
}
