// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! IO multiplexer adapter.
//!
//! Wraps a [`mio::Poll`] behind opaque integer keys so the rest of the
//! stack never touches OS handles. The key table maps each key to its
//! socket and a kind tag (listener / accepted TCP / outbound TCP / UDP).
//! Keys roll over but never collide: allocation skips live keys.
//!
//! The table is bounded by `min(RLIMIT_NOFILE, 16384)`, and `accept`
//! additionally keeps an 80-descriptor reserve free so the process can
//! always service its listeners.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::config::{MAX_FDS, MAX_POLL_EVENTS, RESERVED_FDS};
use crate::error::{Error, Result};

/// Opaque socket key. Positive, process-unique while live.
pub type Key = i32;

/// What a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// TCP listener.
    Listen,
    /// Accepted TCP connection.
    TcpIn,
    /// Outbound (connect) TCP connection.
    TcpOut,
    /// Bound UDP socket.
    Udp,
}

enum Sock {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
}

struct Entry {
    kind: SocketKind,
    sock: Sock,
    interests: Interest,
}

/// One readiness notification from [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub key: Key,
    pub readable: bool,
    pub writable: bool,
    /// Error/hangup condition; treat as hard close.
    pub error: bool,
}

/// Key-indexed readiness multiplexer.
pub struct Poller {
    poll: Poll,
    events: Events,
    entries: HashMap<Key, Entry>,
    next_key: Key,
    max_fds: usize,
    rcvbuf_kb: usize,
    sndbuf_kb: usize,
}

impl Poller {
    /// Create the multiplexer handle.
    pub fn open() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_POLL_EVENTS),
            entries: HashMap::new(),
            next_key: 0,
            max_fds: nofile_limit().min(MAX_FDS),
            rcvbuf_kb: 128,
            sndbuf_kb: 128,
        })
    }

    /// Kernel socket buffer sizes applied to new TCP sockets, KiB.
    pub fn set_buf_sizes(&mut self, rcvbuf_kb: usize, sndbuf_kb: usize) {
        self.rcvbuf_kb = rcvbuf_kb.clamp(32, 262_144);
        self.sndbuf_kb = sndbuf_kb.clamp(32, 262_144);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Table ceiling after the OS rlimit was applied.
    pub fn max_fds(&self) -> usize {
        self.max_fds
    }

    /// Kind tag for a live key.
    pub fn kind(&self, key: Key) -> Option<SocketKind> {
        self.entries.get(&key).map(|e| e.kind)
    }

    /// All live keys (snapshot).
    pub fn keys(&self) -> Vec<Key> {
        self.entries.keys().copied().collect()
    }

    fn alloc_key(&mut self) -> Result<Key> {
        if self.entries.len() >= self.max_fds {
            return Err(Error::FdLimit);
        }
        loop {
            self.next_key = if self.next_key >= i32::MAX - 1 {
                1
            } else {
                self.next_key + 1
            };
            if !self.entries.contains_key(&self.next_key) {
                return Ok(self.next_key);
            }
        }
    }

    fn insert(&mut self, kind: SocketKind, mut sock: Sock, interests: Interest) -> Result<Key> {
        let key = self.alloc_key()?;
        let token = Token(key as usize);
        match &mut sock {
            Sock::Listener(l) => self.poll.registry().register(l, token, interests)?,
            Sock::Stream(s) => self.poll.registry().register(s, token, interests)?,
            Sock::Udp(u) => self.poll.registry().register(u, token, interests)?,
        }
        self.entries.insert(
            key,
            Entry {
                kind,
                sock,
                interests,
            },
        );
        Ok(key)
    }

    /// Bind + listen on TCP; returns the listener key.
    pub fn tcp_listen(&mut self, port: u16, bind_ip: Option<IpAddr>, v6only: bool) -> Result<Key> {
        let addr = listen_addr(port, bind_ip);
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        if addr.is_ipv6() {
            sock.set_only_v6(v6only)?;
        }
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        sock.listen(1024)?;
        let listener = TcpListener::from_std(sock.into());
        let key = self.insert(SocketKind::Listen, Sock::Listener(listener), Interest::READABLE)?;
        log::info!("[POLL] key({}) listen tcp://{}", key, addr);
        Ok(key)
    }

    /// Bind a UDP socket; returns its key.
    pub fn udp_listen(&mut self, port: u16, bind_ip: Option<IpAddr>, v6only: bool) -> Result<Key> {
        let addr = listen_addr(port, bind_ip);
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        if addr.is_ipv6() {
            sock.set_only_v6(v6only)?;
        }
        sock.set_recv_buffer_size(512 * 1024)?;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        let udp = UdpSocket::from_std(sock.into());
        let key = self.insert(SocketKind::Udp, Sock::Udp(udp), Interest::READABLE)?;
        log::info!("[POLL] key({}) bind udp://{}", key, addr);
        Ok(key)
    }

    /// Begin a non-blocking connect; completion is signalled by
    /// writability (check [`Poller::take_error`]).
    pub fn connect_async(&mut self, addr: SocketAddr) -> Result<Key> {
        let stream = TcpStream::connect(addr)?;
        let key = self.insert(
            SocketKind::TcpOut,
            Sock::Stream(stream),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        log::debug!("[POLL] key({}) connect tcp://{} pending", key, addr);
        Ok(key)
    }

    /// Accept one connection from a listener key.
    ///
    /// Returns `Ok(None)` when no connection is pending. Fails with
    /// [`Error::FdLimit`] when accepting would eat into the descriptor
    /// reserve; the pending connection is accepted and dropped so the
    /// listener does not stay permanently readable.
    pub fn accept(&mut self, listen_key: Key) -> Result<Option<(Key, SocketAddr)>> {
        let reserve_hit = self.entries.len() + RESERVED_FDS >= self.max_fds;
        let entry = self
            .entries
            .get_mut(&listen_key)
            .ok_or(Error::SessionNotFound(listen_key))?;
        let listener = match &mut entry.sock {
            Sock::Listener(l) => l,
            _ => return Err(Error::SessionNotFound(listen_key)),
        };
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if reserve_hit {
            drop(stream);
            return Err(Error::FdLimit);
        }
        {
            let sref = SockRef::from(&stream);
            let _ = sref.set_recv_buffer_size(self.rcvbuf_kb * 1024);
            let _ = sref.set_send_buffer_size(self.sndbuf_kb * 1024);
        }
        let key = self.insert(
            SocketKind::TcpIn,
            Sock::Stream(stream),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(Some((key, peer)))
    }

    /// Read from a TCP key. `WouldBlock` propagates as `io::Error`.
    pub fn recv(&mut self, key: Key, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        let entry = self.entries.get_mut(&key).ok_or(Error::SessionNotFound(key))?;
        match &mut entry.sock {
            Sock::Stream(s) => Ok(s.read(buf)?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Write to a TCP key. `WouldBlock` propagates as `io::Error`.
    pub fn send(&mut self, key: Key, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let entry = self.entries.get_mut(&key).ok_or(Error::SessionNotFound(key))?;
        match &mut entry.sock {
            Sock::Stream(s) => Ok(s.write(buf)?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Receive one datagram.
    pub fn recv_from(&mut self, key: Key, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let entry = self.entries.get_mut(&key).ok_or(Error::SessionNotFound(key))?;
        match &entry.sock {
            Sock::Udp(u) => Ok(u.recv_from(buf)?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Send one datagram.
    pub fn send_to(&mut self, key: Key, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let entry = self.entries.get_mut(&key).ok_or(Error::SessionNotFound(key))?;
        match &entry.sock {
            Sock::Udp(u) => Ok(u.send_to(buf, addr)?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Pending async-connect error, if any (SO_ERROR).
    pub fn take_error(&mut self, key: Key) -> Result<Option<io::Error>> {
        let entry = self.entries.get_mut(&key).ok_or(Error::SessionNotFound(key))?;
        match &entry.sock {
            Sock::Stream(s) => Ok(s.take_error()?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Peer address of a TCP key.
    pub fn peer_addr(&self, key: Key) -> Result<SocketAddr> {
        let entry = self.entries.get(&key).ok_or(Error::SessionNotFound(key))?;
        match &entry.sock {
            Sock::Stream(s) => Ok(s.peer_addr()?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Local address of any key.
    pub fn local_addr(&self, key: Key) -> Result<SocketAddr> {
        let entry = self.entries.get(&key).ok_or(Error::SessionNotFound(key))?;
        match &entry.sock {
            Sock::Listener(l) => Ok(l.local_addr()?),
            Sock::Stream(s) => Ok(s.local_addr()?),
            Sock::Udp(u) => Ok(u.local_addr()?),
        }
    }

    /// Set SO_KEEPALIVE (30s/5s/3; fast mode 5s/1s/3) on a TCP key.
    pub fn set_keepalive(&mut self, key: Key, fast: bool) -> Result<()> {
        let entry = self.entries.get(&key).ok_or(Error::SessionNotFound(key))?;
        let stream = match &entry.sock {
            Sock::Stream(s) => s,
            _ => return Err(Error::SessionNotFound(key)),
        };
        let (idle, interval) = if fast { (5, 1) } else { (30, 5) };
        let ka = TcpKeepalive::new()
            .with_time(Duration::from_secs(idle))
            .with_interval(Duration::from_secs(interval));
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let ka = ka.with_retries(3);
        SockRef::from(stream).set_tcp_keepalive(&ka)?;
        Ok(())
    }

    /// Disable Nagle on a TCP key.
    pub fn set_nodelay(&mut self, key: Key) -> Result<()> {
        let entry = self.entries.get(&key).ok_or(Error::SessionNotFound(key))?;
        match &entry.sock {
            Sock::Stream(s) => Ok(s.set_nodelay(true)?),
            _ => Err(Error::SessionNotFound(key)),
        }
    }

    /// Adjust read/write interest for a key; a no-op when unchanged.
    pub fn modify_interest(&mut self, key: Key, read: bool, write: bool) -> Result<()> {
        let entry = self.entries.get_mut(&key).ok_or(Error::SessionNotFound(key))?;
        let wanted = match (read, write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // mio has no "no interest"; park on READABLE, the server-side
            // read-pause flag stops actual reads.
            _ => Interest::READABLE,
        };
        if entry.interests == wanted {
            return Ok(());
        }
        let token = Token(key as usize);
        match &mut entry.sock {
            Sock::Listener(l) => self.poll.registry().reregister(l, token, wanted)?,
            Sock::Stream(s) => self.poll.registry().reregister(s, token, wanted)?,
            Sock::Udp(u) => self.poll.registry().reregister(u, token, wanted)?,
        }
        entry.interests = wanted;
        Ok(())
    }

    /// Unregister and close a key. Idempotent: closing an unknown key is
    /// a no-op. Event dispatch for the key stops immediately.
    pub fn close_key(&mut self, key: Key) {
        let Some(mut entry) = self.entries.remove(&key) else {
            return;
        };
        let registry = self.poll.registry();
        match &mut entry.sock {
            Sock::Listener(l) => {
                let _ = registry.deregister(l);
            }
            Sock::Stream(s) => {
                let _ = registry.deregister(s);
                let _ = s.shutdown(Shutdown::Both);
            }
            Sock::Udp(u) => {
                let _ = registry.deregister(u);
            }
        }
        log::debug!("[POLL] key({}) closed", key);
    }

    /// Wait for readiness, at most `timeout`. Events for keys closed
    /// since the last wait are filtered out.
    pub fn wait(&mut self, out: &mut Vec<PollEvent>, timeout: Duration) -> Result<usize> {
        out.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        for ev in self.events.iter() {
            let key = ev.token().0 as Key;
            if !self.entries.contains_key(&key) {
                continue;
            }
            out.push(PollEvent {
                key,
                readable: ev.is_readable() || ev.is_read_closed(),
                writable: ev.is_writable(),
                error: ev.is_error(),
            });
        }
        Ok(out.len())
    }
}

fn listen_addr(port: u16, bind_ip: Option<IpAddr>) -> SocketAddr {
    let ip = bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    SocketAddr::new(ip, port)
}

#[cfg(unix)]
fn nofile_limit() -> usize {
    // SAFETY: getrlimit with a zeroed struct and a valid pointer.
    unsafe {
        let mut rl: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) == 0 {
            rl.rlim_cur as usize
        } else {
            MAX_FDS
        }
    }
}

#[cfg(not(unix))]
fn nofile_limit() -> usize {
    MAX_FDS
}
