// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cursor codec: version-prefixed, fixed-width little-endian payloads.
//!
//! Strings are u16-length-prefixed UTF-8; lists are u16-counted. Decoding is
//! strict: bounds are checked at every read and trailing bytes after a
//! message are rejected.

use super::{
    ConfigEntry, ConfigureOp, ConfigureReq, FormatReq, MonitorReq, NotifyOp, NotifyReq,
    ReadMediumAlloc, ReadReq, ReleaseKind, ReleaseMedium, ReleaseReq, Request, RequestKind,
    Response, Token, WriteMediumAlloc, WriteMediumSpec, WriteReq, PROTOCOL_VERSION,
};
use crate::error::{LrsError, Result};
use crate::types::{AddrType, Family, FsType, ResourceId};

// ============================================================================
// Codec errors
// ============================================================================

/// Low-level codec failure, mapped to `LrsError::BadMessage` at the rim.
#[derive(Clone, Debug)]
pub enum CodecError {
    ReadFailed { offset: usize, reason: String },
    InvalidData { reason: String },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::ReadFailed { offset, reason } => {
                write!(f, "read failed at offset {}: {}", offset, reason)
            }
            CodecError::InvalidData { reason } => write!(f, "invalid data: {}", reason),
        }
    }
}

impl From<CodecError> for LrsError {
    fn from(e: CodecError) -> Self {
        LrsError::BadMessage(e.to_string())
    }
}

type CodecResult<T> = std::result::Result<T, CodecError>;

// ============================================================================
// Encoder / decoder
// ============================================================================

/// Growable little-endian encoder.
struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(128),
        }
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    fn put_str(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize, "string too long for wire");
        self.put_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn put_opt_str(&mut self, s: Option<&str>) {
        match s {
            None => self.put_bool(false),
            Some(s) => {
                self.put_bool(true);
                self.put_str(s);
            }
        }
    }

    fn put_resource_id(&mut self, id: &ResourceId) {
        self.put_u8(id.family.wire_tag());
        self.put_str(&id.name);
        self.put_str(&id.library);
    }
}

/// Bounds-checked little-endian decoder.
struct Dec<'a> {
    buf: &'a [u8],
    offset: usize,
}

macro_rules! impl_get_le {
    ($name:ident, $type:ty, $size:expr) => {
        fn $name(&mut self) -> CodecResult<$type> {
            if self.offset + $size > self.buf.len() {
                return Err(CodecError::ReadFailed {
                    offset: self.offset,
                    reason: "unexpected end of buffer".into(),
                });
            }
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(&self.buf[self.offset..self.offset + $size]);
            self.offset += $size;
            Ok(<$type>::from_le_bytes(bytes))
        }
    };
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    impl_get_le!(get_u16, u16, 2);
    impl_get_le!(get_u32, u32, 4);
    impl_get_le!(get_u64, u64, 8);
    impl_get_le!(get_i32, i32, 4);

    fn get_u8(&mut self) -> CodecResult<u8> {
        if self.offset >= self.buf.len() {
            return Err(CodecError::ReadFailed {
                offset: self.offset,
                reason: "unexpected end of buffer".into(),
            });
        }
        let v = self.buf[self.offset];
        self.offset += 1;
        Ok(v)
    }

    fn get_bool(&mut self) -> CodecResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidData {
                reason: format!("bool byte {}", other),
            }),
        }
    }

    fn get_str(&mut self) -> CodecResult<String> {
        let len = self.get_u16()? as usize;
        if self.offset + len > self.buf.len() {
            return Err(CodecError::ReadFailed {
                offset: self.offset,
                reason: "string exceeds buffer".into(),
            });
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidData {
            reason: "string is not utf-8".into(),
        })
    }

    fn get_opt_str(&mut self) -> CodecResult<Option<String>> {
        if self.get_bool()? {
            Ok(Some(self.get_str()?))
        } else {
            Ok(None)
        }
    }

    fn get_family(&mut self) -> CodecResult<Family> {
        let tag = self.get_u8()?;
        Family::from_wire_tag(tag).ok_or(CodecError::InvalidData {
            reason: format!("family tag {}", tag),
        })
    }

    fn get_resource_id(&mut self) -> CodecResult<ResourceId> {
        let family = self.get_family()?;
        let name = self.get_str()?;
        let library = self.get_str()?;
        Ok(ResourceId {
            family,
            name,
            library,
        })
    }
}

// ============================================================================
// Small enum tags
// ============================================================================

fn fs_tag(fs: FsType) -> u8 {
    match fs {
        FsType::Posix => 0,
        FsType::Ltfs => 1,
        FsType::Rados => 2,
    }
}

fn fs_from_tag(tag: u8) -> CodecResult<FsType> {
    match tag {
        0 => Ok(FsType::Posix),
        1 => Ok(FsType::Ltfs),
        2 => Ok(FsType::Rados),
        other => Err(CodecError::InvalidData {
            reason: format!("fs tag {}", other),
        }),
    }
}

fn addr_tag(addr: AddrType) -> u8 {
    match addr {
        AddrType::Path => 0,
        AddrType::Hash1 => 1,
        AddrType::Opaque => 2,
    }
}

fn addr_from_tag(tag: u8) -> CodecResult<AddrType> {
    match tag {
        0 => Ok(AddrType::Path),
        1 => Ok(AddrType::Hash1),
        2 => Ok(AddrType::Opaque),
        other => Err(CodecError::InvalidData {
            reason: format!("addr tag {}", other),
        }),
    }
}

fn release_kind_tag(kind: ReleaseKind) -> u8 {
    match kind {
        ReleaseKind::Read => 0,
        ReleaseKind::Write => 1,
    }
}

fn release_kind_from_tag(tag: u8) -> CodecResult<ReleaseKind> {
    match tag {
        0 => Ok(ReleaseKind::Read),
        1 => Ok(ReleaseKind::Write),
        other => Err(CodecError::InvalidData {
            reason: format!("release kind tag {}", other),
        }),
    }
}

fn notify_op_tag(op: NotifyOp) -> u8 {
    match op {
        NotifyOp::DeviceAdd => 0,
        NotifyOp::DeviceRemove => 1,
        NotifyOp::MediumAdd => 2,
        NotifyOp::MediumRemove => 3,
    }
}

fn notify_op_from_tag(tag: u8) -> CodecResult<NotifyOp> {
    match tag {
        0 => Ok(NotifyOp::DeviceAdd),
        1 => Ok(NotifyOp::DeviceRemove),
        2 => Ok(NotifyOp::MediumAdd),
        3 => Ok(NotifyOp::MediumRemove),
        other => Err(CodecError::InvalidData {
            reason: format!("notify op tag {}", other),
        }),
    }
}

/// Response kind tags; requests reuse `RequestKind::wire_tag`.
const RESP_ERROR_TAG: u8 = 15;

// ============================================================================
// Requests
// ============================================================================

/// Pack a request into one payload (without the frame header).
pub fn pack_request(token: Token, req: &Request) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u8(PROTOCOL_VERSION);
    enc.put_u8(req.kind().wire_tag());
    enc.put_u64(token);
    match req {
        Request::Write(w) => {
            enc.put_u8(w.family.wire_tag());
            enc.put_u16(w.media.len() as u16);
            for spec in &w.media {
                enc.put_u64(spec.size);
                enc.put_u16(spec.tags.len() as u16);
                for tag in &spec.tags {
                    enc.put_str(tag);
                }
            }
            enc.put_opt_str(w.grouping.as_deref());
            enc.put_opt_str(w.library.as_deref());
            enc.put_bool(w.no_split);
            enc.put_bool(w.prevent_duplicate);
        }
        Request::Read(r) => {
            enc.put_u8(r.family.wire_tag());
            enc.put_u16(r.media.len() as u16);
            for id in &r.media {
                enc.put_resource_id(id);
            }
            enc.put_u32(r.n_required);
        }
        Request::Release(r) => {
            enc.put_u8(release_kind_tag(r.kind));
            enc.put_bool(r.partial);
            enc.put_u16(r.media.len() as u16);
            for m in &r.media {
                enc.put_resource_id(&m.medium);
                enc.put_u64(m.size_written);
                enc.put_u32(m.nb_extents_written);
                enc.put_bool(m.to_sync);
            }
        }
        Request::Format(f) => {
            enc.put_resource_id(&f.medium);
            enc.put_u8(fs_tag(f.fs));
            enc.put_bool(f.unlock);
            enc.put_bool(f.force);
        }
        Request::Notify(n) => {
            enc.put_u8(notify_op_tag(n.op));
            enc.put_resource_id(&n.resource);
            enc.put_bool(n.wait);
        }
        Request::Monitor(m) => {
            enc.put_u8(m.family.wire_tag());
        }
        Request::Configure(c) => {
            enc.put_u8(match c.op {
                ConfigureOp::Get => 0,
                ConfigureOp::Set => 1,
            });
            encode_config_entries(&mut enc, &c.entries);
        }
        Request::Ping => {}
    }
    enc.into_vec()
}

/// Unpack one request payload.
pub fn unpack_request(payload: &[u8]) -> Result<(Token, Request)> {
    let mut dec = Dec::new(payload);
    let version = dec.get_u8().map_err(LrsError::from)?;
    if version != PROTOCOL_VERSION {
        return Err(LrsError::ProtocolVersion(version));
    }
    let tag = dec.get_u8().map_err(LrsError::from)?;
    let kind = RequestKind::from_wire_tag(tag)
        .ok_or_else(|| LrsError::BadMessage(format!("unknown request tag {}", tag)))?;
    let token = dec.get_u64().map_err(LrsError::from)?;
    let req = decode_request_body(&mut dec, kind).map_err(LrsError::from)?;
    if dec.remaining() != 0 {
        return Err(LrsError::BadMessage(format!(
            "{} trailing bytes after {} request",
            dec.remaining(),
            kind
        )));
    }
    Ok((token, req))
}

fn decode_request_body(dec: &mut Dec, kind: RequestKind) -> CodecResult<Request> {
    Ok(match kind {
        RequestKind::Write => {
            let family = dec.get_family()?;
            let n_media = dec.get_u16()? as usize;
            let mut media = Vec::with_capacity(n_media);
            for _ in 0..n_media {
                let size = dec.get_u64()?;
                let n_tags = dec.get_u16()? as usize;
                let mut tags = Vec::with_capacity(n_tags);
                for _ in 0..n_tags {
                    tags.push(dec.get_str()?);
                }
                media.push(WriteMediumSpec { size, tags });
            }
            Request::Write(WriteReq {
                family,
                media,
                grouping: dec.get_opt_str()?,
                library: dec.get_opt_str()?,
                no_split: dec.get_bool()?,
                prevent_duplicate: dec.get_bool()?,
            })
        }
        RequestKind::Read => {
            let family = dec.get_family()?;
            let n_media = dec.get_u16()? as usize;
            let mut media = Vec::with_capacity(n_media);
            for _ in 0..n_media {
                media.push(dec.get_resource_id()?);
            }
            Request::Read(ReadReq {
                family,
                media,
                n_required: dec.get_u32()?,
            })
        }
        RequestKind::Release => {
            let kind = release_kind_from_tag(dec.get_u8()?)?;
            let partial = dec.get_bool()?;
            let n_media = dec.get_u16()? as usize;
            let mut media = Vec::with_capacity(n_media);
            for _ in 0..n_media {
                media.push(ReleaseMedium {
                    medium: dec.get_resource_id()?,
                    size_written: dec.get_u64()?,
                    nb_extents_written: dec.get_u32()?,
                    to_sync: dec.get_bool()?,
                });
            }
            Request::Release(ReleaseReq {
                kind,
                media,
                partial,
            })
        }
        RequestKind::Format => Request::Format(FormatReq {
            medium: dec.get_resource_id()?,
            fs: fs_from_tag(dec.get_u8()?)?,
            unlock: dec.get_bool()?,
            force: dec.get_bool()?,
        }),
        RequestKind::Notify => Request::Notify(NotifyReq {
            op: notify_op_from_tag(dec.get_u8()?)?,
            resource: dec.get_resource_id()?,
            wait: dec.get_bool()?,
        }),
        RequestKind::Monitor => Request::Monitor(MonitorReq {
            family: dec.get_family()?,
        }),
        RequestKind::Configure => {
            let op = match dec.get_u8()? {
                0 => ConfigureOp::Get,
                1 => ConfigureOp::Set,
                other => {
                    return Err(CodecError::InvalidData {
                        reason: format!("configure op tag {}", other),
                    })
                }
            };
            Request::Configure(ConfigureReq {
                op,
                entries: decode_config_entries(dec)?,
            })
        }
        RequestKind::Ping => Request::Ping,
    })
}

fn encode_config_entries(enc: &mut Enc, entries: &[ConfigEntry]) {
    enc.put_u16(entries.len() as u16);
    for e in entries {
        enc.put_str(&e.section);
        enc.put_str(&e.key);
        enc.put_opt_str(e.value.as_deref());
    }
}

fn decode_config_entries(dec: &mut Dec) -> CodecResult<Vec<ConfigEntry>> {
    let n = dec.get_u16()? as usize;
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        entries.push(ConfigEntry {
            section: dec.get_str()?,
            key: dec.get_str()?,
            value: dec.get_opt_str()?,
        });
    }
    Ok(entries)
}

// ============================================================================
// Responses
// ============================================================================

fn response_tag(resp: &Response) -> u8 {
    match resp {
        Response::Write { .. } => RequestKind::Write.wire_tag(),
        Response::Read { .. } => RequestKind::Read.wire_tag(),
        Response::Release { .. } => RequestKind::Release.wire_tag(),
        Response::Format { .. } => RequestKind::Format.wire_tag(),
        Response::Notify { .. } => RequestKind::Notify.wire_tag(),
        Response::Monitor { .. } => RequestKind::Monitor.wire_tag(),
        Response::Configure { .. } => RequestKind::Configure.wire_tag(),
        Response::Ping => RequestKind::Ping.wire_tag(),
        Response::Error { .. } => RESP_ERROR_TAG,
    }
}

/// Pack a response into one payload (without the frame header).
pub fn pack_response(token: Token, resp: &Response) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u8(PROTOCOL_VERSION);
    enc.put_u8(response_tag(resp));
    enc.put_u64(token);
    match resp {
        Response::Write { media } => {
            enc.put_u16(media.len() as u16);
            for m in media {
                enc.put_resource_id(&m.medium);
                enc.put_str(&m.root_path);
                enc.put_u8(fs_tag(m.fs_type));
                enc.put_u8(addr_tag(m.addr_type));
                enc.put_u64(m.avail_size);
            }
        }
        Response::Read { media } => {
            enc.put_u16(media.len() as u16);
            for m in media {
                enc.put_resource_id(&m.medium);
                enc.put_str(&m.root_path);
                enc.put_u8(fs_tag(m.fs_type));
                enc.put_u8(addr_tag(m.addr_type));
            }
        }
        Response::Release {
            kind,
            media,
            partial,
        } => {
            enc.put_u8(release_kind_tag(*kind));
            enc.put_bool(*partial);
            enc.put_u16(media.len() as u16);
            for id in media {
                enc.put_resource_id(id);
            }
        }
        Response::Format { medium } => {
            enc.put_resource_id(medium);
        }
        Response::Notify { op, resource } => {
            enc.put_u8(notify_op_tag(*op));
            enc.put_resource_id(resource);
        }
        Response::Monitor { status } => {
            enc.put_str(status);
        }
        Response::Configure { entries } => {
            encode_config_entries(&mut enc, entries);
        }
        Response::Ping => {}
        Response::Error { kind, code, medium } => {
            enc.put_u8(kind.map_or(0, |k| k.wire_tag()));
            enc.put_i32(*code);
            match medium {
                None => enc.put_bool(false),
                Some(id) => {
                    enc.put_bool(true);
                    enc.put_resource_id(id);
                }
            }
        }
    }
    enc.into_vec()
}

/// Unpack one response payload.
pub fn unpack_response(payload: &[u8]) -> Result<(Token, Response)> {
    let mut dec = Dec::new(payload);
    let version = dec.get_u8().map_err(LrsError::from)?;
    if version != PROTOCOL_VERSION {
        return Err(LrsError::ProtocolVersion(version));
    }
    let tag = dec.get_u8().map_err(LrsError::from)?;
    let token = dec.get_u64().map_err(LrsError::from)?;
    let resp = decode_response_body(&mut dec, tag).map_err(LrsError::from)?;
    if dec.remaining() != 0 {
        return Err(LrsError::BadMessage(format!(
            "{} trailing bytes after response",
            dec.remaining()
        )));
    }
    Ok((token, resp))
}

fn decode_response_body(dec: &mut Dec, tag: u8) -> CodecResult<Response> {
    if tag == RESP_ERROR_TAG {
        let kind_tag = dec.get_u8()?;
        let kind = if kind_tag == 0 {
            None
        } else {
            Some(RequestKind::from_wire_tag(kind_tag).ok_or(CodecError::InvalidData {
                reason: format!("error kind tag {}", kind_tag),
            })?)
        };
        let code = dec.get_i32()?;
        let medium = if dec.get_bool()? {
            Some(dec.get_resource_id()?)
        } else {
            None
        };
        return Ok(Response::Error { kind, code, medium });
    }

    let kind = RequestKind::from_wire_tag(tag).ok_or(CodecError::InvalidData {
        reason: format!("unknown response tag {}", tag),
    })?;
    Ok(match kind {
        RequestKind::Write => {
            let n = dec.get_u16()? as usize;
            let mut media = Vec::with_capacity(n);
            for _ in 0..n {
                media.push(WriteMediumAlloc {
                    medium: dec.get_resource_id()?,
                    root_path: dec.get_str()?,
                    fs_type: fs_from_tag(dec.get_u8()?)?,
                    addr_type: addr_from_tag(dec.get_u8()?)?,
                    avail_size: dec.get_u64()?,
                });
            }
            Response::Write { media }
        }
        RequestKind::Read => {
            let n = dec.get_u16()? as usize;
            let mut media = Vec::with_capacity(n);
            for _ in 0..n {
                media.push(ReadMediumAlloc {
                    medium: dec.get_resource_id()?,
                    root_path: dec.get_str()?,
                    fs_type: fs_from_tag(dec.get_u8()?)?,
                    addr_type: addr_from_tag(dec.get_u8()?)?,
                });
            }
            Response::Read { media }
        }
        RequestKind::Release => {
            let kind = release_kind_from_tag(dec.get_u8()?)?;
            let partial = dec.get_bool()?;
            let n = dec.get_u16()? as usize;
            let mut media = Vec::with_capacity(n);
            for _ in 0..n {
                media.push(dec.get_resource_id()?);
            }
            Response::Release {
                kind,
                media,
                partial,
            }
        }
        RequestKind::Format => Response::Format {
            medium: dec.get_resource_id()?,
        },
        RequestKind::Notify => Response::Notify {
            op: notify_op_from_tag(dec.get_u8()?)?,
            resource: dec.get_resource_id()?,
        },
        RequestKind::Monitor => Response::Monitor {
            status: dec.get_str()?,
        },
        RequestKind::Configure => Response::Configure {
            entries: decode_config_entries(dec)?,
        },
        RequestKind::Ping => Response::Ping,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new(Family::Dir, name, "legacy")
    }

    fn round_trip_request(req: Request) {
        let payload = pack_request(0xDEAD_BEEF, &req);
        assert_eq!(payload[0], PROTOCOL_VERSION);
        let (token, back) = unpack_request(&payload).unwrap();
        assert_eq!(token, 0xDEAD_BEEF);
        assert_eq!(back, req);
    }

    fn round_trip_response(resp: Response) {
        let payload = pack_response(7, &resp);
        assert_eq!(payload[0], PROTOCOL_VERSION);
        let (token, back) = unpack_response(&payload).unwrap();
        assert_eq!(token, 7);
        assert_eq!(back, resp);
    }

    #[test]
    fn requests_round_trip() {
        round_trip_request(Request::Write(WriteReq {
            family: Family::Dir,
            media: vec![
                WriteMediumSpec {
                    size: 15 << 20,
                    tags: vec!["prod".into(), "eu".into()],
                },
                WriteMediumSpec {
                    size: 4096,
                    tags: vec![],
                },
            ],
            grouping: Some("g1".into()),
            library: None,
            no_split: true,
            prevent_duplicate: true,
        }));
        round_trip_request(Request::Read(ReadReq {
            family: Family::Dir,
            media: vec![rid("d0"), rid("d1"), rid("d2")],
            n_required: 1,
        }));
        round_trip_request(Request::Release(ReleaseReq {
            kind: ReleaseKind::Write,
            partial: true,
            media: vec![ReleaseMedium {
                medium: rid("d0"),
                size_written: 1 << 30,
                nb_extents_written: 3,
                to_sync: true,
            }],
        }));
        round_trip_request(Request::Format(FormatReq {
            medium: rid("d0"),
            fs: FsType::Posix,
            unlock: true,
            force: false,
        }));
        round_trip_request(Request::Notify(NotifyReq {
            op: NotifyOp::DeviceAdd,
            resource: rid("drive0"),
            wait: true,
        }));
        round_trip_request(Request::Monitor(MonitorReq {
            family: Family::Dir,
        }));
        round_trip_request(Request::Configure(ConfigureReq {
            op: ConfigureOp::Set,
            entries: vec![ConfigEntry {
                section: "lrs".into(),
                key: "policy".into(),
                value: Some("first_fit".into()),
            }],
        }));
        round_trip_request(Request::Ping);
    }

    #[test]
    fn responses_round_trip() {
        round_trip_response(Response::Write {
            media: vec![WriteMediumAlloc {
                medium: rid("d0"),
                root_path: "/mnt/phobos-d0".into(),
                fs_type: FsType::Posix,
                addr_type: AddrType::Hash1,
                avail_size: 123456,
            }],
        });
        round_trip_response(Response::Read {
            media: vec![ReadMediumAlloc {
                medium: rid("d1"),
                root_path: "/mnt/phobos-d1".into(),
                fs_type: FsType::Posix,
                addr_type: AddrType::Path,
            }],
        });
        round_trip_response(Response::Release {
            kind: ReleaseKind::Write,
            media: vec![rid("d0"), rid("d1")],
            partial: false,
        });
        round_trip_response(Response::Format { medium: rid("d0") });
        round_trip_response(Response::Notify {
            op: NotifyOp::MediumRemove,
            resource: rid("d0"),
        });
        round_trip_response(Response::Monitor {
            status: r#"{"devices":[]}"#.into(),
        });
        round_trip_response(Response::Configure {
            entries: vec![ConfigEntry {
                section: "lrs".into(),
                key: "policy".into(),
                value: None,
            }],
        });
        round_trip_response(Response::Ping);
        round_trip_response(Response::Error {
            kind: Some(RequestKind::Write),
            code: -28,
            medium: Some(rid("d0")),
        });
        round_trip_response(Response::Error {
            kind: None,
            code: -22,
            medium: None,
        });
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut payload = pack_request(1, &Request::Ping);
        payload[0] = 9;
        assert!(matches!(
            unpack_request(&payload),
            Err(LrsError::ProtocolVersion(9))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut payload = pack_request(1, &Request::Ping);
        payload.push(0);
        assert!(matches!(
            unpack_request(&payload),
            Err(LrsError::BadMessage(_))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = pack_request(
            1,
            &Request::Monitor(MonitorReq {
                family: Family::Tape,
            }),
        );
        assert!(unpack_request(&payload[..payload.len() - 1]).is_err());
    }
}
