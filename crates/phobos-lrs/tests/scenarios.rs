// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios against a full daemon core: socket in, socket out.
//!
//! Each test assembles an [`Lrs`] over the in-memory DSS with a directory
//! family backed by a temp directory, then speaks the framed wire protocol
//! like a real client.

use phobos_lrs::adapters::AdapterRegistry;
use phobos_lrs::config::Config;
use phobos_lrs::context::Context;
use phobos_lrs::dss::{short_hostname, Dss, LockOwner, MediaFilter, MemoryDssFactory};
use phobos_lrs::protocol::{
    pack_request, unpack_response, FormatReq, FrameCodec, MonitorReq, NotifyOp, NotifyReq,
    ReadReq, ReleaseKind, ReleaseMedium, ReleaseReq, Request, Response, WriteMediumSpec, WriteReq,
};
use phobos_lrs::transport::ListenAddr;
use phobos_lrs::types::{
    AdmStatus, Device, Family, FsStatus, FsType, Medium, ResourceId,
};
use phobos_lrs::Lrs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct Daemon {
    _tmp: tempfile::TempDir,
    socket: PathBuf,
    factory: MemoryDssFactory,
    owner: LockOwner,
    lrs: Option<Lrs>,
}

struct MediumSpec {
    /// Medium directory name under the temp root ("m0"), or an absolute
    /// path that does not exist (failure injection).
    name: &'static str,
    /// Free space advertised in the DSS row.
    free: u64,
    exists: bool,
}

impl Daemon {
    fn start(extra_config: &str, n_devices: usize, media: &[MediumSpec]) -> (Daemon, Vec<ResourceId>) {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("lrs.sock");
        let prefix = tmp.path().join("mnt/phobos-");

        let cfg = Config::from_toml_str(&format!(
            "[lrs]\nfamilies = \"dir\"\nmount_prefix = \"{}\"\n{}",
            prefix.display(),
            extra_config
        ))
        .unwrap();

        let owner = LockOwner::new(short_hostname(), std::process::id());
        let ctx = Context::new(cfg, AdapterRegistry::with_defaults(), owner.clone());

        let factory = MemoryDssFactory::new();
        let dss = factory.handle();

        let mut medium_ids = Vec::new();
        for spec in media {
            let root = if spec.name.starts_with('/') {
                PathBuf::from(spec.name)
            } else {
                tmp.path().join(spec.name)
            };
            if spec.exists {
                std::fs::create_dir_all(&root).unwrap();
            }
            let id = ResourceId::new(Family::Dir, root.to_str().unwrap(), "legacy");
            let mut medium = Medium::new(id.clone(), FsType::Posix, 0);
            medium.adm_status = AdmStatus::Unlocked;
            medium.fs_status = FsStatus::Empty;
            medium.stats.phys_spc_free = spec.free;
            medium.health = cfg_health(extra_config);
            dss.media_insert(&medium).unwrap();
            medium_ids.push(id);
        }

        for i in 0..n_devices {
            let dev_root = tmp.path().join(format!("dev{}", i));
            std::fs::create_dir_all(&dev_root).unwrap();
            let id = ResourceId::new(Family::Dir, format!("dev{}", i), "legacy");
            let device = Device::new(id, owner.hostname.clone(), dev_root.to_str().unwrap(), 3);
            dss.device_insert(&device).unwrap();
        }

        let lrs = Lrs::new(
            Arc::clone(&ctx),
            Arc::new(factory.clone()),
            ListenAddr::Unix(socket.clone()),
        )
        .unwrap();

        (
            Daemon {
                _tmp: tmp,
                socket,
                factory,
                owner,
                lrs: Some(lrs),
            },
            medium_ids,
        )
    }

    fn exchange(&self, token: u64, request: &Request) -> Response {
        self.exchange_timeout(token, request, Duration::from_secs(20))
    }

    fn exchange_timeout(&self, token: u64, request: &Request, timeout: Duration) -> Response {
        let mut stream = UnixStream::connect(&self.socket).unwrap();
        stream.set_read_timeout(Some(timeout)).unwrap();
        stream
            .write_all(&FrameCodec::encode(&pack_request(token, request)))
            .unwrap();
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        stream.read_exact(&mut payload).unwrap();
        let (echoed, response) = unpack_response(&payload).unwrap();
        assert_eq!(echoed, token, "token must be echoed verbatim");
        response
    }

    fn stop(&mut self) {
        if let Some(lrs) = self.lrs.take() {
            lrs.shutdown();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The harness passes max_health through the TOML snippet; reflect it into
/// the seeded rows so DSS health matches the configuration.
fn cfg_health(extra_config: &str) -> u32 {
    extra_config
        .lines()
        .find_map(|l| l.strip_prefix("max_health = "))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1)
}

fn write_req(sizes: &[u64]) -> Request {
    Request::Write(WriteReq {
        family: Family::Dir,
        media: sizes
            .iter()
            .map(|s| WriteMediumSpec {
                size: *s,
                tags: vec![],
            })
            .collect(),
        grouping: None,
        library: None,
        no_split: false,
        prevent_duplicate: false,
    })
}

fn release_write(medium: &ResourceId, size: u64) -> Request {
    Request::Release(ReleaseReq {
        kind: ReleaseKind::Write,
        partial: false,
        media: vec![ReleaseMedium {
            medium: medium.clone(),
            size_written: size,
            nb_extents_written: 1,
            to_sync: true,
        }],
    })
}

// ============================================================================
// Scenario: simple write on a directory family
// ============================================================================

#[test]
fn simple_write_then_release_on_directory_family() {
    let (mut daemon, media) = Daemon::start(
        "sync_nb_req = 1\n",
        1,
        &[MediumSpec {
            name: "m0",
            free: 1 << 30,
            exists: true,
        }],
    );

    let response = daemon.exchange(1, &write_req(&[4096]));
    let alloc = match response {
        Response::Write { media } => {
            assert_eq!(media.len(), 1);
            media.into_iter().next().unwrap()
        }
        other => panic!("expected write response, got {:?}", other),
    };
    assert_eq!(alloc.medium, media[0]);
    assert!(
        alloc.root_path.contains("phobos-"),
        "root {} must live under the mount prefix",
        alloc.root_path
    );
    assert!(alloc.avail_size > 0);

    // The medium is locked by this daemon while the session is open.
    let dss = daemon.factory.handle();
    let lock = dss.media_lock_owner(&media[0]).unwrap().unwrap();
    assert!(lock.is_owned_by(&daemon.owner.hostname, daemon.owner.pid));
    assert!(!lock.is_early);

    // Write like a client would, then release: exactly one acknowledgement,
    // after the sync point (sync_nb_req = 1 makes it immediate).
    let payload = vec![0u8; 1 << 20];
    std::fs::write(PathBuf::from(&alloc.root_path).join("extent.0"), &payload).unwrap();

    let response = daemon.exchange(2, &release_write(&media[0], payload.len() as u64));
    match response {
        Response::Release { kind, media: acked, partial } => {
            assert_eq!(kind, ReleaseKind::Write);
            assert_eq!(acked, media);
            assert!(!partial);
        }
        other => panic!("expected release ack, got {:?}", other),
    }

    // Session closed: the lock is gone and the accounting reflects the
    // extent just written.
    assert!(dss.media_lock_owner(&media[0]).unwrap().is_none());
    let row = &dss.media_get(&MediaFilter::one(&media[0])).unwrap()[0];
    assert!(row.stats.phys_spc_used > 0);

    daemon.stop();
}

// ============================================================================
// Scenario: best-fit / first-fit placement
// ============================================================================

fn placement(policy: &str) -> String {
    let (mut daemon, _media) = Daemon::start(
        &format!("policy = \"{}\"\n", policy),
        1,
        &[
            // Catalog order is by name: 30 MiB first, then 20, then 10.
            MediumSpec {
                name: "a30",
                free: 30 << 20,
                exists: true,
            },
            MediumSpec {
                name: "b20",
                free: 20 << 20,
                exists: true,
            },
            MediumSpec {
                name: "c10",
                free: 10 << 20,
                exists: true,
            },
        ],
    );

    let response = daemon.exchange(1, &write_req(&[15 << 20]));
    let chosen = match response {
        Response::Write { media } => media[0].medium.name.clone(),
        other => panic!("expected write response, got {:?}", other),
    };
    daemon.stop();
    chosen
}

#[test]
fn best_fit_places_on_the_smallest_fitting_medium() {
    let chosen = placement("best_fit");
    assert!(chosen.ends_with("b20"), "best fit chose {}", chosen);
}

#[test]
fn first_fit_places_on_the_first_fitting_medium() {
    let chosen = placement("first_fit");
    assert!(chosen.ends_with("a30"), "first fit chose {}", chosen);
}

// ============================================================================
// Scenario: health decrement to failure
// ============================================================================

#[test]
fn two_mount_failures_fail_the_medium_and_release_its_lock() {
    // The medium row exists in the DSS but its directory does not: every
    // mount attempt fails and debits the medium health.
    let (mut daemon, media) = Daemon::start(
        "max_health = 2\n",
        1,
        &[MediumSpec {
            name: "/nonexistent/phobos/m-broken",
            free: 1 << 30,
            exists: false,
        }],
    );

    let response = daemon.exchange(1, &write_req(&[4096]));
    match response {
        Response::Error { code, .. } => {
            assert_eq!(code, -libc::ENOSPC, "no usable medium remains");
        }
        other => panic!("expected an error response, got {:?}", other),
    }

    let dss = daemon.factory.handle();
    assert_eq!(dss.medium_health(&media[0]).unwrap(), 0);
    let row = &dss.media_get(&MediaFilter::one(&media[0])).unwrap()[0];
    assert_eq!(row.adm_status, AdmStatus::Failed);
    // Failing the medium released its DSS lock.
    assert!(dss.media_lock_owner(&media[0]).unwrap().is_none());

    daemon.stop();
}

// ============================================================================
// Scenario: ownership conflict and locate
// ============================================================================

#[test]
fn read_skips_media_locked_by_another_host_and_locate_names_it() {
    let (mut daemon, media) = Daemon::start(
        "",
        1,
        &[
            MediumSpec {
                name: "held",
                free: 1 << 30,
                exists: true,
            },
            MediumSpec {
                name: "open",
                free: 1 << 30,
                exists: true,
            },
        ],
    );

    // Host A (elsewhere in the cluster) holds the lock on "held".
    let host_a = LockOwner::new("node-a", 777);
    let dss = daemon.factory.handle();
    dss.media_lock(std::slice::from_ref(&media[0]), &host_a, false)
        .unwrap();

    let response = daemon.exchange(
        1,
        &Request::Read(ReadReq {
            family: Family::Dir,
            media: media.clone(),
            n_required: 1,
        }),
    );
    match response {
        Response::Read { media: allocated } => {
            assert_eq!(allocated.len(), 1);
            assert_eq!(allocated[0].medium, media[1], "the held copy must be skipped");
        }
        other => panic!("expected read response, got {:?}", other),
    }

    // Locate: the lock owner of the skipped medium resolves to host A.
    let owner = dss.media_lock_owner(&media[0]).unwrap().unwrap();
    assert_eq!(owner.hostname, "node-a");

    daemon.stop();
}

// ============================================================================
// Scenario: shutdown drain
// ============================================================================

#[test]
fn waiting_request_gets_eshutdown_and_socket_disappears() {
    let (mut daemon, media) = Daemon::start(
        "",
        1,
        &[MediumSpec {
            name: "m0",
            free: 1 << 30,
            exists: true,
        }],
    );

    // Park the only medium under a foreign lock so the write waits in the
    // scheduler rather than failing.
    let host_a = LockOwner::new("node-a", 777);
    daemon
        .factory
        .handle()
        .media_lock(std::slice::from_ref(&media[0]), &host_a, false)
        .unwrap();

    let mut stream = UnixStream::connect(&daemon.socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(20)))
        .unwrap();
    stream
        .write_all(&FrameCodec::encode(&pack_request(9, &write_req(&[4096]))))
        .unwrap();

    // Give the family loop a few iterations to enqueue the request.
    std::thread::sleep(Duration::from_millis(500));
    daemon.stop();

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
    stream.read_exact(&mut payload).unwrap();
    let (token, response) = unpack_response(&payload).unwrap();
    assert_eq!(token, 9);
    match response {
        Response::Error { code, .. } => assert_eq!(code, -libc::ESHUTDOWN),
        other => panic!("expected ESHUTDOWN, got {:?}", other),
    }

    assert!(!daemon.socket.exists(), "socket file must be removed");
}

// ============================================================================
// Multi-medium writes
// ============================================================================

#[test]
fn two_slot_write_lands_on_two_distinct_media() {
    let (mut daemon, _media) = Daemon::start(
        "",
        2,
        &[
            MediumSpec {
                name: "m0",
                free: 1 << 30,
                exists: true,
            },
            MediumSpec {
                name: "m1",
                free: 1 << 30,
                exists: true,
            },
        ],
    );

    let mut req = match write_req(&[4096, 4096]) {
        Request::Write(w) => w,
        _ => unreachable!(),
    };
    req.prevent_duplicate = true;
    let response = daemon.exchange(1, &Request::Write(req));
    match response {
        Response::Write { media } => {
            assert_eq!(media.len(), 2);
            assert_ne!(media[0].medium, media[1].medium);
        }
        other => panic!("expected write response, got {:?}", other),
    }
    daemon.stop();
}

// ============================================================================
// Format, monitor, notify, partial release
// ============================================================================

#[test]
fn format_unlocks_a_blank_medium_for_writing() {
    let (mut daemon, media) = Daemon::start(
        "",
        1,
        &[MediumSpec {
            name: "blank0",
            free: 1 << 30,
            exists: false,
        }],
    );
    // Reset the seeded row to the state of a freshly added medium: blank
    // and admin-locked.
    let dss = daemon.factory.handle();
    let mut row = dss.media_get(&MediaFilter::one(&media[0])).unwrap()[0].clone();
    row.adm_status = AdmStatus::Locked;
    row.fs_status = FsStatus::Blank;
    dss.media_update(&row).unwrap();

    // A write before the format has no candidate.
    let before = daemon.exchange(1, &write_req(&[4096]));
    assert!(matches!(before, Response::Error { .. }));

    let response = daemon.exchange(
        2,
        &Request::Format(FormatReq {
            medium: media[0].clone(),
            fs: FsType::Posix,
            unlock: true,
            force: false,
        }),
    );
    match response {
        Response::Format { medium } => assert_eq!(medium, media[0]),
        other => panic!("expected format response, got {:?}", other),
    }
    let row = &dss.media_get(&MediaFilter::one(&media[0])).unwrap()[0];
    assert_eq!(row.adm_status, AdmStatus::Unlocked);
    assert_eq!(row.fs_status, FsStatus::Empty);
    // The format reservation was given back.
    assert!(dss.media_lock_owner(&media[0]).unwrap().is_none());

    // A second format without force is refused.
    let again = daemon.exchange(
        3,
        &Request::Format(FormatReq {
            medium: media[0].clone(),
            fs: FsType::Posix,
            unlock: true,
            force: false,
        }),
    );
    match again {
        Response::Error { code, .. } => assert_eq!(code, -libc::EEXIST),
        other => panic!("expected EEXIST, got {:?}", other),
    }

    // The formatted medium now takes writes.
    let after = daemon.exchange(4, &write_req(&[4096]));
    assert!(matches!(after, Response::Write { .. }));
    daemon.stop();
}

#[test]
fn monitor_reports_devices_and_queues() {
    let (mut daemon, _media) = Daemon::start(
        "",
        2,
        &[MediumSpec {
            name: "m0",
            free: 1 << 30,
            exists: true,
        }],
    );

    let response = daemon.exchange(
        1,
        &Request::Monitor(MonitorReq {
            family: Family::Dir,
        }),
    );
    let status = match response {
        Response::Monitor { status } => status,
        other => panic!("expected monitor response, got {:?}", other),
    };
    let doc: serde_json::Value = serde_json::from_str(&status).unwrap();
    assert_eq!(doc["family"], "dir");
    assert_eq!(doc["devices"].as_array().unwrap().len(), 2);
    assert_eq!(doc["schedulers"].as_array().unwrap().len(), 3);
    daemon.stop();
}

#[test]
fn notify_adds_and_removes_media() {
    let (mut daemon, media) = Daemon::start(
        "",
        1,
        &[
            MediumSpec {
                name: "m0",
                free: 1 << 30,
                exists: true,
            },
            MediumSpec {
                name: "m1",
                free: 1 << 30,
                exists: true,
            },
        ],
    );

    let added = daemon.exchange(
        1,
        &Request::Notify(NotifyReq {
            op: NotifyOp::MediumAdd,
            resource: media[1].clone(),
            wait: true,
        }),
    );
    assert!(matches!(added, Response::Notify { .. }));

    let removed = daemon.exchange(
        2,
        &Request::Notify(NotifyReq {
            op: NotifyOp::MediumRemove,
            resource: media[1].clone(),
            wait: true,
        }),
    );
    assert!(matches!(removed, Response::Notify { .. }));

    // Unknown resources are refused.
    let missing = daemon.exchange(
        3,
        &Request::Notify(NotifyReq {
            op: NotifyOp::MediumAdd,
            resource: ResourceId::new(Family::Dir, "/nowhere", "legacy"),
            wait: true,
        }),
    );
    assert!(matches!(missing, Response::Error { .. }));
    daemon.stop();
}

#[test]
fn partial_release_keeps_the_session_open() {
    let (mut daemon, media) = Daemon::start(
        "sync_nb_req = 1\n",
        1,
        &[MediumSpec {
            name: "m0",
            free: 1 << 30,
            exists: true,
        }],
    );

    let alloc = daemon.exchange(1, &write_req(&[4096]));
    assert!(matches!(alloc, Response::Write { .. }));

    // Part one of a multi-part write: acknowledged immediately, lock kept.
    let partial = daemon.exchange(
        2,
        &Request::Release(ReleaseReq {
            kind: ReleaseKind::Write,
            partial: true,
            media: vec![ReleaseMedium {
                medium: media[0].clone(),
                size_written: 1024,
                nb_extents_written: 1,
                to_sync: true,
            }],
        }),
    );
    match partial {
        Response::Release { partial, .. } => assert!(partial),
        other => panic!("expected partial ack, got {:?}", other),
    }
    let dss = daemon.factory.handle();
    assert!(dss.media_lock_owner(&media[0]).unwrap().is_some());

    // The final part closes the session and releases the lock.
    let done = daemon.exchange(3, &release_write(&media[0], 1024));
    assert!(matches!(done, Response::Release { .. }));
    assert!(dss.media_lock_owner(&media[0]).unwrap().is_none());
    daemon.stop();
}

#[test]
fn double_release_is_rejected_without_a_second_ack() {
    let (mut daemon, media) = Daemon::start(
        "sync_nb_req = 1\n",
        1,
        &[MediumSpec {
            name: "m0",
            free: 1 << 30,
            exists: true,
        }],
    );

    let alloc = daemon.exchange(1, &write_req(&[4096]));
    assert!(matches!(alloc, Response::Write { .. }));

    let first = daemon.exchange(2, &release_write(&media[0], 4096));
    assert!(matches!(first, Response::Release { .. }));

    let second = daemon.exchange(3, &release_write(&media[0], 4096));
    match second {
        Response::Error { code, .. } => assert_eq!(code, -libc::EINVAL),
        other => panic!("expected rejection, got {:?}", other),
    }
    daemon.stop();
}
