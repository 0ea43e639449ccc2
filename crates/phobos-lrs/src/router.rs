// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response router.
//!
//! Sits between the transport and the family scheduler loops: unpacks
//! inbound frames, answers protocol-level requests (ping, configure)
//! directly, hands resource requests to the right family loop, and packs
//! every outbound response with the client's echoed token. Malformed
//! messages are answered with `EINVAL` and the recognized request kind (or
//! 0 when even the kind is unreadable).

use crate::config::Config;
use crate::context::Context;
use crate::dss::Dss;
use crate::error::{LrsError, Result};
use crate::protocol::{
    pack_response, unpack_request, ConfigEntry, ConfigureOp, ConfigureReq, Request, RequestKind,
    Response,
};
use crate::request::{OutboundResponse, ReplyHandle, RequestContainer};
use crate::transport::{InboundFrame, SocketServer};
use crate::types::Family;
use crossbeam::channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Family a request is destined for, when it needs a scheduler loop.
fn target_family(req: &Request) -> Option<Family> {
    match req {
        Request::Write(w) => Some(w.family),
        Request::Read(r) => Some(r.family),
        Request::Release(r) => r.media.first().map(|m| m.medium.family),
        Request::Format(f) => Some(f.medium.family),
        Request::Notify(n) => Some(n.resource.family),
        Request::Monitor(m) => Some(m.family),
        Request::Configure(_) | Request::Ping => None,
    }
}

/// Best-effort token extraction from a frame that failed to decode, so the
/// error response still routes back to the right request.
fn peek_token(payload: &[u8]) -> u64 {
    if payload.len() >= 10 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[2..10]);
        u64::from_le_bytes(bytes)
    } else {
        0
    }
}

/// Spawn the router thread.
pub fn spawn_router(
    ctx: Arc<Context>,
    dss: Box<dyn Dss>,
    server: Arc<SocketServer>,
    family_txs: HashMap<Family, Sender<Arc<RequestContainer>>>,
    responses_rx: Receiver<OutboundResponse>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let router = Router {
        ctx,
        dss,
        server,
        family_txs,
        responses_rx,
        stop,
    };
    std::thread::Builder::new()
        .name("lrs-router".into())
        .spawn(move || router.run())
}

struct Router {
    ctx: Arc<Context>,
    dss: Box<dyn Dss>,
    server: Arc<SocketServer>,
    family_txs: HashMap<Family, Sender<Arc<RequestContainer>>>,
    responses_rx: Receiver<OutboundResponse>,
    stop: Arc<AtomicBool>,
}

impl Router {
    fn run(self) {
        log::info!(
            "[Router::run] serving families {:?}",
            self.family_txs.keys().map(|f| f.as_str()).collect::<Vec<_>>()
        );
        loop {
            crossbeam::channel::select! {
                recv(self.server.inbound()) -> msg => {
                    if let Ok(frame) = msg {
                        self.handle_inbound(frame);
                    }
                }
                recv(self.responses_rx) -> msg => {
                    if let Ok(out) = msg {
                        self.emit(out);
                    }
                }
                default(Duration::from_millis(100)) => {}
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
        // Drain mode: late completions (ESHUTDOWN errors from draining
        // workers) still deserve their response. The iterator ends when the
        // last family loop drops its sender.
        for out in self.responses_rx.iter() {
            self.emit(out);
        }
        log::info!("[Router::run] stopped");
    }

    fn emit(&self, out: OutboundResponse) {
        let payload = pack_response(out.reply.token, &out.response);
        self.server.send(out.reply.client, payload);
    }

    fn respond(&self, reply: ReplyHandle, response: Response) {
        self.emit(OutboundResponse { reply, response });
    }

    fn handle_inbound(&self, frame: InboundFrame) {
        let (token, req) = match unpack_request(&frame.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("[Router::handle_inbound] bad frame: {}", e);
                let reply = ReplyHandle {
                    client: frame.client,
                    token: peek_token(&frame.payload),
                };
                self.respond(reply, Response::error(None, &e));
                return;
            }
        };
        let reply = ReplyHandle {
            client: frame.client,
            token,
        };
        log::debug!(
            "[Router::handle_inbound] {} request from client {}",
            req.kind(),
            token
        );

        // Protocol-level requests are answered in place.
        match &req {
            Request::Ping => {
                self.respond(reply, Response::Ping);
                return;
            }
            Request::Configure(c) => {
                let response = match self.handle_configure(c) {
                    Ok(resp) => resp,
                    Err(e) => Response::error(Some(RequestKind::Configure), &e),
                };
                self.respond(reply, response);
                return;
            }
            _ => {}
        }

        // Everything else belongs to one family's scheduler loop.
        let kind = req.kind();
        let Some(family) = target_family(&req) else {
            let e = LrsError::InvalidRequest("request names no resource".into());
            self.respond(reply, Response::error(Some(kind), &e));
            return;
        };
        match self.family_txs.get(&family) {
            Some(tx) => {
                let container = RequestContainer::new(reply, req);
                if tx.send(container).is_err() {
                    self.respond(reply, Response::error(Some(kind), &LrsError::Shutdown));
                }
            }
            None => {
                let e = LrsError::InvalidRequest(format!(
                    "family {} is not served by this daemon",
                    family
                ));
                self.respond(reply, Response::error(Some(kind), &e));
            }
        }
    }

    /// Read or update the DSS-backed configuration level.
    fn handle_configure(&self, c: &ConfigureReq) -> Result<Response> {
        let cfg: Arc<Config> = self.ctx.config();
        let mut entries = Vec::with_capacity(c.entries.len());
        match c.op {
            ConfigureOp::Get => {
                for e in &c.entries {
                    let local = cfg.get(&e.section, &e.key);
                    let value = match local {
                        Some(v) => Some(v),
                        None => {
                            let stored = self.dss.config_get(&e.section, &e.key)?;
                            if let Some(v) = &stored {
                                cfg.set_global(&e.section, &e.key, v);
                            }
                            stored
                        }
                    };
                    entries.push(ConfigEntry {
                        section: e.section.clone(),
                        key: e.key.clone(),
                        value,
                    });
                }
            }
            ConfigureOp::Set => {
                for e in &c.entries {
                    let Some(value) = &e.value else {
                        return Err(LrsError::InvalidRequest(format!(
                            "configure set [{}] {} carries no value",
                            e.section, e.key
                        )));
                    };
                    self.dss.config_set(&e.section, &e.key, value)?;
                    cfg.set_global(&e.section, &e.key, value);
                    entries.push(e.clone());
                }
            }
        }
        Ok(Response::Configure { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::dss::{LockOwner, MemoryDssFactory};
    use crate::protocol::{pack_request, unpack_response, FrameCodec, PROTOCOL_VERSION};
    use crate::transport::ListenAddr;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    struct Rig {
        _tmp: tempfile::TempDir,
        path: std::path::PathBuf,
        stop: Arc<AtomicBool>,
        join: Option<JoinHandle<()>>,
        _server: Arc<SocketServer>,
        // Kept alive so the router's response channel stays connected;
        // dropped before joining so the drain loop can end.
        resp_tx: Option<Sender<crate::request::OutboundResponse>>,
    }

    fn rig() -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lrs.sock");
        let server = Arc::new(SocketServer::bind(ListenAddr::Unix(path.clone())).unwrap());
        let ctx = Context::new(
            Config::empty(),
            AdapterRegistry::with_defaults(),
            LockOwner::new("node-test", 1),
        );
        let factory = MemoryDssFactory::new();
        let (resp_tx, resp_rx) = crossbeam::channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let join = spawn_router(
            ctx,
            Box::new(factory.handle()),
            Arc::clone(&server),
            HashMap::new(),
            resp_rx,
            Arc::clone(&stop),
        )
        .unwrap();
        Rig {
            _tmp: tmp,
            path,
            stop,
            join: Some(join),
            _server: server,
            resp_tx: Some(resp_tx),
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Release);
            self.resp_tx.take();
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }

    fn exchange(path: &std::path::Path, frame: &[u8]) -> Vec<u8> {
        let mut client = UnixStream::connect(path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(&FrameCodec::encode(frame)).unwrap();
        let mut len_bytes = [0u8; 4];
        client.read_exact(&mut len_bytes).unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        client.read_exact(&mut payload).unwrap();
        payload
    }

    #[test]
    fn ping_is_answered_with_the_same_token() {
        let rig = rig();
        let payload = exchange(&rig.path, &pack_request(4242, &Request::Ping));
        let (token, resp) = unpack_response(&payload).unwrap();
        assert_eq!(token, 4242);
        assert_eq!(resp, Response::Ping);
    }

    #[test]
    fn unknown_version_yields_eprotonosupport() {
        let rig = rig();
        let mut raw = pack_request(7, &Request::Ping);
        raw[0] = PROTOCOL_VERSION + 1;
        let payload = exchange(&rig.path, &raw);
        let (_, resp) = unpack_response(&payload).unwrap();
        match resp {
            Response::Error { kind, code, .. } => {
                assert_eq!(kind, None);
                assert_eq!(code, -libc::EPROTONOSUPPORT);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn garbage_frame_yields_ebadmsg_with_kind_zero() {
        let rig = rig();
        let payload = exchange(&rig.path, &[PROTOCOL_VERSION, 200, 1, 2, 3]);
        let (_, resp) = unpack_response(&payload).unwrap();
        match resp {
            Response::Error { kind, code, .. } => {
                assert_eq!(kind, None);
                assert_eq!(code, -libc::EBADMSG);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn unserved_family_is_refused() {
        let rig = rig();
        let req = Request::Monitor(crate::protocol::MonitorReq {
            family: Family::Tape,
        });
        let payload = exchange(&rig.path, &pack_request(1, &req));
        let (_, resp) = unpack_response(&payload).unwrap();
        match resp {
            Response::Error { kind, code, .. } => {
                assert_eq!(kind, Some(RequestKind::Monitor));
                assert_eq!(code, -libc::EINVAL);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn configure_set_then_get_round_trips() {
        let rig = rig();
        let set = Request::Configure(ConfigureReq {
            op: ConfigureOp::Set,
            entries: vec![ConfigEntry {
                section: "lrs".into(),
                key: "policy".into(),
                value: Some("first_fit".into()),
            }],
        });
        let payload = exchange(&rig.path, &pack_request(1, &set));
        let (_, resp) = unpack_response(&payload).unwrap();
        assert!(matches!(resp, Response::Configure { .. }));

        let get = Request::Configure(ConfigureReq {
            op: ConfigureOp::Get,
            entries: vec![ConfigEntry {
                section: "lrs".into(),
                key: "policy".into(),
                value: None,
            }],
        });
        let payload = exchange(&rig.path, &pack_request(2, &get));
        let (_, resp) = unpack_response(&payload).unwrap();
        match resp {
            Response::Configure { entries } => {
                assert_eq!(entries[0].value.as_deref(), Some("first_fit"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
