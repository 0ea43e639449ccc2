// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for the request socket.
//!
//! The socket is a stream without message boundaries; each payload is
//! prefixed with a 4-byte big-endian length:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | payload           |
//! +----------------+-------------------+
//! ```
//!
//! The codec keeps partial-read state so it can be fed from a non-blocking
//! stream and hand back every complete frame.

use std::io::{self, Read};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 MB, anti-OOM guard).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Internal state for incremental reading.
#[derive(Clone, Copy, Debug)]
enum ReadState {
    ReadingLength,
    ReadingBody { expected_len: usize },
}

/// What a read pass produced.
#[derive(Debug)]
pub struct FrameBatch {
    /// Complete payloads, oldest first.
    pub frames: Vec<Vec<u8>>,
    /// The peer closed the stream.
    pub eof: bool,
}

/// Length-prefix frame codec with partial-read state.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    /// Accumulated raw bytes not yet consumed.
    pending: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::ReadingLength,
            pending: Vec::with_capacity(READ_CHUNK),
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    /// Codec with the default 16 MB cap.
    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Encode a payload into a framed buffer: `[length: u32 BE][payload]`.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Drain `rd` until it would block or closes, returning every complete
    /// frame. An oversized frame is an error (the connection must drop).
    pub fn read_frames(&mut self, rd: &mut impl Read) -> io::Result<FrameBatch> {
        let mut eof = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match rd.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(FrameBatch { frames, eof })
    }

    /// Feed raw bytes directly (tests, in-process transports).
    pub fn push_bytes(&mut self, data: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if let ReadState::ReadingLength = self.state {
            if self.pending.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
            len_bytes.copy_from_slice(&self.pending[..FRAME_HEADER_SIZE]);
            let expected_len = u32::from_be_bytes(len_bytes) as usize;
            if expected_len > self.max_size {
                self.frames_rejected += 1;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds cap {}", expected_len, self.max_size),
                ));
            }
            self.pending.drain(..FRAME_HEADER_SIZE);
            self.state = ReadState::ReadingBody { expected_len };
        }

        if let ReadState::ReadingBody { expected_len } = self.state {
            if self.pending.len() < expected_len {
                return Ok(None);
            }
            let frame: Vec<u8> = self.pending.drain(..expected_len).collect();
            self.state = ReadState::ReadingLength;
            self.frames_decoded += 1;
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = FrameCodec::encode(b"hello");
        assert_eq!(&frame[..4], &5u32.to_be_bytes());
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn split_feeds_reassemble_frames() {
        let mut codec = FrameCodec::with_default_max();
        let frame = FrameCodec::encode(b"payload-one");

        // Byte-by-byte delivery must still produce exactly one frame.
        let mut got = Vec::new();
        for b in &frame {
            got.extend(codec.push_bytes(&[*b]).unwrap());
        }
        assert_eq!(got, vec![b"payload-one".to_vec()]);
        assert_eq!(codec.frames_decoded(), 1);
    }

    #[test]
    fn back_to_back_frames_in_one_feed() {
        let mut codec = FrameCodec::with_default_max();
        let mut wire = FrameCodec::encode(b"a");
        wire.extend(FrameCodec::encode(b""));
        wire.extend(FrameCodec::encode(b"ccc"));
        let frames = codec.push_bytes(&wire).unwrap();
        assert_eq!(frames, vec![b"a".to_vec(), Vec::new(), b"ccc".to_vec()]);
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut codec = FrameCodec::new(8);
        let wire = FrameCodec::encode(&[0u8; 64]);
        assert!(codec.push_bytes(&wire).is_err());
        assert_eq!(codec.frames_rejected(), 1);
    }

    #[test]
    fn read_frames_reports_eof() {
        let mut codec = FrameCodec::with_default_max();
        let wire = FrameCodec::encode(b"tail");
        let mut rd = io::Cursor::new(wire);
        let batch = codec.read_frames(&mut rd).unwrap();
        assert_eq!(batch.frames, vec![b"tail".to_vec()]);
        assert!(batch.eof);
    }
}
