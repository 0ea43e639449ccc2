// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket transport: mio poll loop over the request socket.
//!
//! One dedicated I/O thread multiplexes the Unix (or TCP) listener and all
//! client connections non-blockingly:
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                        IoThread                              |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - Listener (accept new clients)                       |  |
//! |  |  - Streams  (framed read/write)                        |  |
//! |  |  - Waker    (outbound responses from the router)       |  |
//! |  +-------------------------------------------------------+  |
//! |        inbound frames -> router   router -> outbound        |
//! +-------------------------------------------------------------+
//! ```
//!
//! A response addressed to a connection that is already gone is dropped
//! silently; side effects of the request are not rolled back.

use crate::protocol::FrameCodec;
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Token for the listener.
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (outbound channel).
const WAKER_TOKEN: Token = Token(1);

/// First token handed to connections.
const CONNECTION_TOKEN_START: usize = 2;

/// Poll timeout; the loop also re-checks the running flag at this pace.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events processed per poll.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Addresses and frames
// ============================================================================

/// Where the request socket listens.
#[derive(Clone, Debug)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// A decoded frame arriving from a client connection.
#[derive(Debug)]
pub struct InboundFrame {
    pub client: u64,
    pub payload: Vec<u8>,
}

/// A payload to frame and send back to a client connection.
#[derive(Debug)]
pub struct OutboundFrame {
    pub client: u64,
    pub payload: Vec<u8>,
}

// ============================================================================
// Listener / stream polymorphism
// ============================================================================

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

// ============================================================================
// Server handle
// ============================================================================

/// Handle over the transport I/O thread.
pub struct SocketServer {
    in_rx: Receiver<InboundFrame>,
    out_tx: Sender<OutboundFrame>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    addr: ListenAddr,
}

impl SocketServer {
    /// Bind the request socket and start the I/O thread.
    ///
    /// A stale Unix socket file is removed first; single-instance protection
    /// is the daemon lock file's job, not the socket's.
    pub fn bind(addr: ListenAddr) -> io::Result<SocketServer> {
        let mut listener = match &addr {
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Listener::Unix(UnixListener::bind(path)?)
            }
            ListenAddr::Tcp(sockaddr) => Listener::Tcp(TcpListener::bind(*sockaddr)?),
        };

        let poll = Poll::new()?;
        match &mut listener {
            Listener::Unix(l) => {
                poll.registry()
                    .register(l, LISTENER_TOKEN, Interest::READABLE)?
            }
            Listener::Tcp(l) => {
                poll.registry()
                    .register(l, LISTENER_TOKEN, Interest::READABLE)?
            }
        }
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let thread = IoThread {
            poll,
            listener,
            connections: HashMap::new(),
            client_to_token: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            next_client: 1,
            in_tx,
            out_rx,
            running: Arc::clone(&running),
        };
        let join = std::thread::Builder::new()
            .name("lrs-transport".into())
            .spawn(move || thread.run())?;

        log::info!("[SocketServer::bind] listening on {:?}", addr);
        Ok(SocketServer {
            in_rx,
            out_tx,
            waker,
            running,
            join: Some(join),
            addr,
        })
    }

    /// Inbound frame channel (consumed by the router).
    pub fn inbound(&self) -> &Receiver<InboundFrame> {
        &self.in_rx
    }

    /// Queue a payload for a client and wake the I/O thread.
    pub fn send(&self, client: u64, payload: Vec<u8>) {
        if self.out_tx.send(OutboundFrame { client, payload }).is_ok() {
            let _ = self.waker.wake();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the I/O thread and release the socket.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.waker.wake();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("[SocketServer::shutdown] I/O thread panicked");
            }
        }
        if let ListenAddr::Unix(path) = &self.addr {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// I/O thread
// ============================================================================

struct Conn {
    stream: Stream,
    client: u64,
    codec: FrameCodec,
    send_queue: Vec<u8>,
    send_offset: usize,
    wants_write: bool,
}

struct IoThread {
    poll: Poll,
    listener: Listener,
    connections: HashMap<Token, Conn>,
    client_to_token: HashMap<u64, Token>,
    next_token: usize,
    next_client: u64,
    in_tx: Sender<InboundFrame>,
    out_rx: Receiver<OutboundFrame>,
    running: Arc<AtomicBool>,
}

impl IoThread {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[IoThread::run] poll: {}", e);
                break;
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_all(),
                    WAKER_TOKEN => {}
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }
            // Outbound frames may arrive with or without a waker edge.
            self.drain_outbound();
        }
        log::debug!("[IoThread::run] stopping, {} connections", self.connections.len());
    }

    fn accept_all(&mut self) {
        loop {
            let accepted: io::Result<Stream> = match &self.listener {
                Listener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
                Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            };
            match accepted {
                Ok(mut stream) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let client = self.next_client;
                    self.next_client += 1;

                    let registered = match &mut stream {
                        Stream::Unix(s) => {
                            self.poll.registry().register(s, token, Interest::READABLE)
                        }
                        Stream::Tcp(s) => {
                            self.poll.registry().register(s, token, Interest::READABLE)
                        }
                    };
                    if let Err(e) = registered {
                        log::warn!("[IoThread::accept_all] register: {}", e);
                        continue;
                    }
                    log::debug!("[IoThread::accept_all] client {} connected", client);
                    self.client_to_token.insert(client, token);
                    self.connections.insert(
                        token,
                        Conn {
                            stream,
                            client,
                            codec: FrameCodec::with_default_max(),
                            send_queue: Vec::new(),
                            send_offset: 0,
                            wants_write: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[IoThread::accept_all] accept: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        match conn.codec.read_frames(&mut conn.stream) {
            Ok(batch) => {
                for payload in batch.frames {
                    let _ = self.in_tx.send(InboundFrame {
                        client: conn.client,
                        payload,
                    });
                }
                if batch.eof {
                    self.close(token, "peer closed");
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.close(token, &reason);
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let mut failed = false;
        if let Some(conn) = self.connections.get_mut(&token) {
            if flush_conn(conn, self.poll.registry(), token).is_err() {
                failed = true;
            }
        }
        if failed {
            self.close(token, "write failed");
        }
    }

    fn drain_outbound(&mut self) {
        loop {
            match self.out_rx.try_recv() {
                Ok(frame) => {
                    let Some(&token) = self.client_to_token.get(&frame.client) else {
                        // Peer is gone (EPIPE semantics): drop the response.
                        log::debug!(
                            "[IoThread::drain_outbound] client {} gone, dropping frame",
                            frame.client
                        );
                        continue;
                    };
                    let mut failed = false;
                    if let Some(conn) = self.connections.get_mut(&token) {
                        conn.send_queue
                            .extend_from_slice(&FrameCodec::encode(&frame.payload));
                        if flush_conn(conn, self.poll.registry(), token).is_err() {
                            failed = true;
                        }
                    }
                    if failed {
                        self.close(token, "write failed");
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn close(&mut self, token: Token, reason: &str) {
        if let Some(mut conn) = self.connections.remove(&token) {
            log::debug!(
                "[IoThread::close] client {} disconnected ({})",
                conn.client,
                reason
            );
            self.client_to_token.remove(&conn.client);
            let _ = match &mut conn.stream {
                Stream::Unix(s) => self.poll.registry().deregister(s),
                Stream::Tcp(s) => self.poll.registry().deregister(s),
            };
        }
    }
}

/// Write as much of the send queue as the socket accepts; toggle WRITABLE
/// interest while a backlog remains.
fn flush_conn(conn: &mut Conn, registry: &mio::Registry, token: Token) -> io::Result<()> {
    while conn.send_offset < conn.send_queue.len() {
        match conn.stream.write(&conn.send_queue[conn.send_offset..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => conn.send_offset += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if conn.send_offset >= conn.send_queue.len() {
        conn.send_queue.clear();
        conn.send_offset = 0;
        if conn.wants_write {
            conn.wants_write = false;
            reregister(conn, registry, token, Interest::READABLE)?;
        }
    } else if !conn.wants_write {
        conn.wants_write = true;
        reregister(
            conn,
            registry,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
    }
    Ok(())
}

fn reregister(
    conn: &mut Conn,
    registry: &mio::Registry,
    token: Token,
    interest: Interest,
) -> io::Result<()> {
    match &mut conn.stream {
        Stream::Unix(s) => registry.reregister(s, token, interest),
        Stream::Tcp(s) => registry.reregister(s, token, interest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn read_exact_frame(stream: &mut StdUnixStream) -> Vec<u8> {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).unwrap();
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        payload
    }

    #[test]
    fn unix_round_trip_echo() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lrs.sock");
        let mut server = SocketServer::bind(ListenAddr::Unix(path.clone())).unwrap();

        let mut client = StdUnixStream::connect(&path).unwrap();
        client
            .write_all(&FrameCodec::encode(b"hello-lrs"))
            .unwrap();

        let inbound = server
            .inbound()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(inbound.payload, b"hello-lrs");

        server.send(inbound.client, b"hello-client".to_vec());
        assert_eq!(read_exact_frame(&mut client), b"hello-client");

        server.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn response_to_gone_client_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lrs.sock");
        let server = SocketServer::bind(ListenAddr::Unix(path.clone())).unwrap();

        let client_id = {
            let mut client = StdUnixStream::connect(&path).unwrap();
            client.write_all(&FrameCodec::encode(b"one")).unwrap();
            let inbound = server
                .inbound()
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            inbound.client
            // Client drops here.
        };

        // Give the poll loop a tick to observe the hangup, then send.
        std::thread::sleep(Duration::from_millis(200));
        server.send(client_id, b"too-late".to_vec());
        std::thread::sleep(Duration::from_millis(200));
        // Nothing to assert beyond "no panic": the frame is dropped.
        assert!(server.is_running());
    }

    #[test]
    fn two_clients_are_kept_apart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lrs.sock");
        let server = SocketServer::bind(ListenAddr::Unix(path.clone())).unwrap();

        let mut c1 = StdUnixStream::connect(&path).unwrap();
        let mut c2 = StdUnixStream::connect(&path).unwrap();
        c1.write_all(&FrameCodec::encode(b"from-1")).unwrap();
        c2.write_all(&FrameCodec::encode(b"from-2")).unwrap();

        let mut got = HashMap::new();
        for _ in 0..2 {
            let f = server
                .inbound()
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            got.insert(f.payload.clone(), f.client);
        }
        let id1 = got[&b"from-1".to_vec()];
        let id2 = got[&b"from-2".to_vec()];
        assert_ne!(id1, id2);

        server.send(id2, b"for-2".to_vec());
        server.send(id1, b"for-1".to_vec());
        assert_eq!(read_exact_frame(&mut c1), b"for-1");
        assert_eq!(read_exact_frame(&mut c2), b"for-2");
    }
}
