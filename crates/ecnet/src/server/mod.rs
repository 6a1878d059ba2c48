// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! The event server: one multiplexer, one session table, one thread.
//!
//! `runtime` waits on the multiplexer, dispatches readiness into the
//! sessions, runs the sniff-and-upgrade chain, enforces read budgets
//! and the attack grace window, drains send buffers and rolls file
//! send jobs. Everything that happened during a pass is returned as an
//! event list; the application reacts between passes.
//!
//! Closes requested during dispatch are deferred until the callbacks of
//! the current pass have run; each session produces exactly one
//! `Disconnected` event.

pub mod http;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::BlockPool;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::http::Request;
use crate::poller::{Key, PollEvent, Poller, SocketKind};
#[cfg(feature = "tls")]
use crate::session::tls::TlsCredentials;
use crate::session::{Protocol, RecvMsg, Session, Sniff, Status};

/// Why a session went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    Transport(String),
    /// Malformed input; closed after the attack grace window (TLS
    /// handshake failures close immediately).
    Protocol,
    /// Locally requested close.
    Local,
}

/// One thing that happened during a `runtime` pass.
#[derive(Debug)]
pub enum ServerEvent {
    Accepted {
        key: Key,
        listen_key: Key,
        peer_ip: String,
        peer_port: u16,
    },
    /// Outbound connect completed.
    ConnectOut { key: Key },
    /// Outbound connect failed; the session is already destroyed and no
    /// `Disconnected` follows.
    ConnectFailed { key: Key, error: String },
    /// Opaque bytes from a raw TCP (or raw TLS) session.
    Data { key: Key, payload: Vec<u8> },
    /// Complete HTTP request on an HTTP(S) session.
    Http { key: Key, request: Request },
    /// Complete WebSocket message on a WS(S) session.
    Ws {
        key: Key,
        opcode: u8,
        payload: Vec<u8>,
    },
    /// The session's protocol tag changed (upgrade chain).
    ProtocolChanged { key: Key, protocol: Protocol },
    Disconnected { key: Key, reason: DisconnectReason },
    /// Datagram on a UDP key.
    UdpFrame {
        key: Key,
        from: SocketAddr,
        data: Vec<u8>,
    },
    /// Accept refused because the descriptor reserve was hit.
    Emfile,
}

/// Single-threaded event server instance.
pub struct EventServer {
    poller: Poller,
    sessions: HashMap<Key, Session>,
    pool: Arc<BlockPool>,
    cfg: ServerConfig,
    #[cfg(feature = "tls")]
    creds: Option<TlsCredentials>,
    events: Vec<ServerEvent>,
    poll_scratch: Vec<PollEvent>,
    pending_close: Vec<(Key, DisconnectReason)>,
    last_tick: Instant,
    emfile_logged: bool,
    read_tmp: Vec<u8>,
}

impl EventServer {
    pub fn new(cfg: ServerConfig) -> Result<Self> {
        let cfg = cfg.clamped();
        let mut poller = Poller::open()?;
        poller.set_buf_sizes(cfg.rcvbuf_kb, cfg.sndbuf_kb);
        Ok(Self {
            poller,
            sessions: HashMap::new(),
            pool: BlockPool::new(),
            cfg,
            #[cfg(feature = "tls")]
            creds: None,
            events: Vec::new(),
            poll_scratch: Vec::new(),
            pending_close: Vec::new(),
            last_tick: Instant::now(),
            emfile_logged: false,
            read_tmp: vec![0u8; 64 * 1024],
        })
    }

    /// Load the TLS credential bundle; required before TLS clients can
    /// be accepted. Immutable once loaded.
    #[cfg(feature = "tls")]
    pub fn init_ca(
        &mut self,
        cert_pem: &std::path::Path,
        root_pem: Option<&std::path::Path>,
        key_pem: &std::path::Path,
    ) -> Result<()> {
        self.creds = Some(TlsCredentials::load(cert_pem, root_pem, key_pem)?);
        Ok(())
    }

    #[cfg(feature = "tls")]
    pub fn set_credentials(&mut self, creds: TlsCredentials) {
        self.creds = Some(creds);
    }

    // -- sockets -----------------------------------------------------------

    pub fn tcp_listen(&mut self, port: u16, ip: Option<IpAddr>, v6only: bool) -> Result<Key> {
        let key = self.poller.tcp_listen(port, ip, v6only)?;
        self.sessions
            .insert(key, Session::passive(key, Protocol::Listen, self.pool.clone()));
        Ok(key)
    }

    pub fn udp_listen(&mut self, port: u16, ip: Option<IpAddr>, v6only: bool) -> Result<Key> {
        let key = self.poller.udp_listen(port, ip, v6only)?;
        self.sessions
            .insert(key, Session::passive(key, Protocol::Udp, self.pool.clone()));
        Ok(key)
    }

    /// Async connect; `ConnectOut` or `ConnectFailed` follows.
    pub fn tcp_connect(&mut self, addr: SocketAddr) -> Result<Key> {
        let key = self.poller.connect_async(addr)?;
        let mut s = Session::new(
            key,
            -1,
            self.cfg.sndbuf_max,
            self.pool.clone(),
            addr.ip().to_string(),
            addr.port(),
        );
        s.connect_out = true;
        s.status = Status::Connecting;
        self.sessions.insert(key, s);
        Ok(key)
    }

    pub fn local_addr(&self, key: Key) -> Result<SocketAddr> {
        self.poller.local_addr(key)
    }

    /// Direct poller access (UDP sends for engines layered on top).
    pub fn poller_mut(&mut self) -> &mut Poller {
        &mut self.poller
    }

    // -- session accessors -------------------------------------------------

    pub fn session(&self, key: Key) -> Option<&Session> {
        self.sessions.get(&key)
    }

    pub fn session_mut(&mut self, key: Key) -> Option<&mut Session> {
        self.sessions.get_mut(&key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send-buffer back-pressure indicator for a key.
    pub fn water_level(&self, key: Key) -> Result<u32> {
        self.sessions
            .get(&key)
            .map(|s| s.water_level())
            .ok_or(Error::SessionNotFound(key))
    }

    /// Per-key read budget; `Some(0)` pauses reading until raised or
    /// [`EventServer::send_trigger`] runs.
    pub fn set_read_limit(&mut self, key: Key, limit: Option<usize>) -> Result<()> {
        let s = self
            .sessions
            .get_mut(&key)
            .ok_or(Error::SessionNotFound(key))?;
        s.read_limit = limit;
        Ok(())
    }

    /// Pause or resume reads for every session of the given protocols.
    pub fn set_read_pause(&mut self, protocols: &[Protocol], paused: bool) {
        for s in self.sessions.values_mut() {
            if protocols.contains(&s.protocol) {
                s.read_paused = paused;
            }
        }
    }

    /// Switch a session's keep-alive probing to the fast profile.
    pub fn set_keepalive_fast(&mut self, key: Key, fast: bool) -> Result<()> {
        self.poller.set_keepalive(key, fast)
    }

    // -- send --------------------------------------------------------------

    /// Queue bytes for a session (WebSocket sessions get a text frame)
    /// and arm write interest.
    pub fn send(&mut self, key: Key, data: &[u8]) -> Result<usize> {
        self.send_ws(key, crate::ws::OP_TEXT, data)
    }

    /// Queue bytes with an explicit WebSocket opcode (ignored for
    /// non-WS sessions) and arm write interest.
    pub fn send_ws(&mut self, key: Key, opcode: u8, data: &[u8]) -> Result<usize> {
        let s = self
            .sessions
            .get_mut(&key)
            .ok_or(Error::SessionNotFound(key))?;
        if s.closing {
            return Err(Error::SessionNotFound(key));
        }
        let n = s.queue_send(opcode, data)?;
        self.send_trigger(key);
        Ok(n)
    }

    /// Like [`EventServer::send`] but drains to the socket immediately
    /// instead of waiting for the next writability event.
    pub fn send_direct(&mut self, key: Key, data: &[u8]) -> Result<usize> {
        let n = self.send_ws(key, crate::ws::OP_TEXT, data)?;
        self.drain_send(key);
        Ok(n)
    }

    /// Re-arm write interest based on the send buffer, and read
    /// interest unconditionally.
    pub fn send_trigger(&mut self, key: Key) {
        let want_write = self
            .sessions
            .get(&key)
            .map(|s| !s.sndbuf.is_empty())
            .unwrap_or(false);
        let _ = self.poller.modify_interest(key, true, want_write);
    }

    /// Close once the send buffer (and any file job) fully drains.
    pub fn close_after_send(&mut self, key: Key) {
        if let Some(s) = self.sessions.get_mut(&key) {
            if s.sndbuf.is_empty() && s.send_job.is_none() {
                self.close_key(key);
            } else {
                s.close_after_send = true;
            }
        }
    }

    /// Request a close. Idempotent and safe during dispatch: the
    /// session is destroyed after the current pass, producing exactly
    /// one `Disconnected` event.
    pub fn close_key(&mut self, key: Key) {
        self.close_key_reason(key, DisconnectReason::Local);
    }

    fn close_key_reason(&mut self, key: Key, reason: DisconnectReason) {
        match self.sessions.get_mut(&key) {
            Some(s) => {
                if s.closing {
                    return;
                }
                s.closing = true;
                self.pending_close.push((key, reason));
            }
            None => self.poller.close_key(key),
        }
    }

    // -- the loop ----------------------------------------------------------

    /// One pass: periodic housekeeping, wait on the multiplexer for at
    /// most `timeout`, dispatch readiness, process deferred closes.
    /// Returns everything that happened.
    pub fn runtime(&mut self, timeout: Duration) -> Vec<ServerEvent> {
        // Closes requested by the application since the last pass.
        self.process_pending_closes();
        self.tick();
        let mut scratch = std::mem::take(&mut self.poll_scratch);
        match self.poller.wait(&mut scratch, timeout) {
            Ok(_) => {
                for i in 0..scratch.len() {
                    let ev = scratch[i];
                    self.dispatch(ev);
                }
            }
            Err(e) => log::error!("[SRV] wait failed: {}", e),
        }
        self.poll_scratch = scratch;
        self.process_pending_closes();
        std::mem::take(&mut self.events)
    }

    /// Periodic housekeeping: close expired attack sessions and re-arm
    /// readers that still have buffered readiness.
    fn tick(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_tick) < Duration::from_millis(5) {
            return;
        }
        self.last_tick = now;

        let grace = Duration::from_secs(self.cfg.attack_grace_secs);
        let expired: Vec<Key> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                !s.closing
                    && s.attack_since
                        .map(|t| now.duration_since(t) >= grace)
                        .unwrap_or(false)
            })
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            log::info!(
                "[SRV] ucid({}) disconnect by server, error protocol for {}s",
                key,
                self.cfg.attack_grace_secs
            );
            self.close_key_reason(key, DisconnectReason::Protocol);
        }

        let rearm: Vec<Key> = self
            .sessions
            .values()
            .filter(|s| {
                s.readable
                    && !s.closing
                    && !s.read_paused
                    && s.read_limit != Some(0)
                    && !matches!(s.protocol, Protocol::Listen | Protocol::Udp)
            })
            .map(|s| s.key)
            .collect();
        for key in rearm {
            self.try_read(key);
        }
    }

    fn dispatch(&mut self, ev: PollEvent) {
        let Some(kind) = self.poller.kind(ev.key) else {
            return;
        };
        if ev.error {
            match kind {
                SocketKind::Listen | SocketKind::Udp => {
                    log::error!("[SRV] key({}) socket error on {:?}", ev.key, kind);
                }
                _ => self.close_key_reason(
                    ev.key,
                    DisconnectReason::Transport("socket error".into()),
                ),
            }
            return;
        }
        match kind {
            SocketKind::Listen => {
                if ev.readable {
                    self.accept_loop(ev.key);
                }
            }
            SocketKind::Udp => {
                if ev.readable {
                    self.udp_read_loop(ev.key);
                }
            }
            SocketKind::TcpIn | SocketKind::TcpOut => {
                if ev.readable {
                    if let Some(s) = self.sessions.get_mut(&ev.key) {
                        s.readable = true;
                    }
                    self.try_read(ev.key);
                }
                if ev.writable {
                    self.on_writable(ev.key);
                }
                self.send_trigger(ev.key);
            }
        }
    }

    fn accept_loop(&mut self, listen_key: Key) {
        loop {
            match self.poller.accept(listen_key) {
                Ok(Some((key, peer))) => {
                    self.emfile_logged = false;
                    let _ = self.poller.set_keepalive(key, false);
                    let _ = self.poller.set_nodelay(key);
                    let s = Session::new(
                        key,
                        listen_key,
                        self.cfg.sndbuf_max,
                        self.pool.clone(),
                        peer.ip().to_string(),
                        peer.port(),
                    );
                    log::debug!(
                        "[SRV] ucid({}) connect in from {}:{} at listen key {}",
                        key,
                        s.peer_ip,
                        s.peer_port,
                        listen_key
                    );
                    self.sessions.insert(key, s);
                    self.events.push(ServerEvent::Accepted {
                        key,
                        listen_key,
                        peer_ip: peer.ip().to_string(),
                        peer_port: peer.port(),
                    });
                }
                Ok(None) => break,
                Err(Error::FdLimit) => {
                    if !self.emfile_logged {
                        log::error!("[SRV] listen key({}) EMFILE reserve hit", listen_key);
                        self.emfile_logged = true;
                    }
                    self.events.push(ServerEvent::Emfile);
                    break;
                }
                Err(e) => {
                    log::debug!("[SRV] key({}) accept failed: {}", listen_key, e);
                    break;
                }
            }
        }
    }

    fn udp_read_loop(&mut self, key: Key) {
        let mut buf = [0u8; 64 * 1024];
        // Bounded per wakeup so one chatty peer cannot starve the rest.
        for _ in 0..160 {
            match self.poller.recv_from(key, &mut buf) {
                Ok((n, from)) => {
                    self.events.push(ServerEvent::UdpFrame {
                        key,
                        from,
                        data: buf[..n].to_vec(),
                    });
                }
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[SRV] key({}) recvfrom error: {}", key, e);
                    break;
                }
            }
        }
    }

    /// One bounded read, if the session accepts bytes right now.
    fn try_read(&mut self, key: Key) {
        let budget = {
            let Some(s) = self.sessions.get(&key) else {
                return;
            };
            if s.closing || s.read_paused || s.status == Status::Connecting {
                return;
            }
            let budget = s.read_limit.unwrap_or(self.cfg.read_once);
            if budget == 0 {
                return;
            }
            budget.min(self.read_tmp.len())
        };
        let mut tmp = std::mem::take(&mut self.read_tmp);
        let res = self.poller.recv(key, &mut tmp[..budget]);
        match res {
            Ok(0) => {
                self.read_tmp = tmp;
                self.close_key_reason(key, DisconnectReason::PeerClosed);
            }
            Ok(n) => {
                let data = tmp[..n].to_vec();
                self.read_tmp = tmp;
                self.on_received(key, &data);
                self.send_trigger(key);
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.read_tmp = tmp;
                if let Some(s) = self.sessions.get_mut(&key) {
                    s.readable = false;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                self.read_tmp = tmp;
            }
            Err(e) => {
                self.read_tmp = tmp;
                self.close_key_reason(key, DisconnectReason::Transport(e.to_string()));
            }
        }
    }

    /// Parse freshly read bytes, running the upgrade chain as needed.
    fn on_received(&mut self, key: Key, data: &[u8]) {
        let mut input = Some(data);
        loop {
            let Some(s) = self.sessions.get_mut(&key) else {
                return;
            };
            if s.closing {
                return;
            }
            let before = s.protocol;
            let msg = s.on_recv_bytes(input.take());
            match msg {
                Err(e) => {
                    self.on_protocol_error(key, &e);
                    return;
                }
                Ok(parsed) => {
                    let s = match self.sessions.get_mut(&key) {
                        Some(s) => s,
                        None => return,
                    };
                    if s.protocol != before {
                        self.events.push(ServerEvent::ProtocolChanged {
                            key,
                            protocol: s.protocol,
                        });
                    }
                    match parsed {
                        RecvMsg::Tcp(payload) => {
                            self.events.push(ServerEvent::Data { key, payload });
                        }
                        RecvMsg::Http(request) => {
                            self.events.push(ServerEvent::Http { key, request });
                        }
                        RecvMsg::Ws { opcode, payload } => {
                            self.events.push(ServerEvent::Ws {
                                key,
                                opcode,
                                payload,
                            });
                        }
                        RecvMsg::None => {
                            if !self.try_upgrade(key) {
                                // Outbound records queued during TLS
                                // handshakes still need the wire.
                                self.send_trigger(key);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Attempt the sniff-and-upgrade once. Returns true when the state
    /// changed and parsing should continue.
    fn try_upgrade(&mut self, key: Key) -> bool {
        let (verdict, was_tcp) = {
            let Some(s) = self.sessions.get_mut(&key) else {
                return false;
            };
            if !matches!(s.protocol, Protocol::Tcp | Protocol::Tls) || !s.sniff_pending() {
                return false;
            }
            #[cfg(feature = "tls")]
            if s.protocol == Protocol::Tls && s.status != Status::TlsHandshakeDone {
                return false;
            }
            (s.sniff(), s.protocol == Protocol::Tcp)
        };
        match verdict {
            Sniff::NeedMore => false,
            Sniff::Raw => {
                if let Some(s) = self.sessions.get_mut(&key) {
                    s.set_raw_tcp();
                }
                log::debug!("[SRV] ucid({}) stays raw TCP", key);
                true
            }
            Sniff::Http => {
                let res = {
                    let Some(s) = self.sessions.get_mut(&key) else {
                        return false;
                    };
                    if was_tcp {
                        s.upgrade_to_http()
                    } else {
                        upgrade_https(s)
                    }
                };
                match res {
                    Ok(()) => {
                        let protocol = self
                            .sessions
                            .get(&key)
                            .map(|s| s.protocol)
                            .unwrap_or(Protocol::Http);
                        self.events.push(ServerEvent::ProtocolChanged { key, protocol });
                        true
                    }
                    Err(e) => {
                        self.on_protocol_error(key, &e);
                        false
                    }
                }
            }
            Sniff::Tls => self.do_upgrade_tls(key),
        }
    }

    #[cfg(feature = "tls")]
    fn do_upgrade_tls(&mut self, key: Key) -> bool {
        let Some(creds) = self.creds.clone() else {
            log::info!(
                "[SRV] ucid({}) TLS upgrade failed, no server certificate",
                key
            );
            self.close_key_reason(key, DisconnectReason::Protocol);
            return false;
        };
        let res = {
            let Some(s) = self.sessions.get_mut(&key) else {
                return false;
            };
            s.upgrade_to_tls(&creds)
        };
        match res {
            Ok(()) => {
                self.events.push(ServerEvent::ProtocolChanged {
                    key,
                    protocol: Protocol::Tls,
                });
                self.send_trigger(key);
                true
            }
            Err(e) => {
                self.on_protocol_error(key, &e);
                false
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    fn do_upgrade_tls(&mut self, key: Key) -> bool {
        if let Some(s) = self.sessions.get_mut(&key) {
            s.set_raw_tcp();
        }
        true
    }

    /// Malformed input: attack-mark with the grace delay, except TLS
    /// handshake failures which close immediately.
    fn on_protocol_error(&mut self, key: Key, err: &Error) {
        let Some(s) = self.sessions.get_mut(&key) else {
            return;
        };
        if s.in_tls_handshake() {
            log::info!("[SRV] ucid({}) TLS error: {}", key, err);
            self.close_key_reason(key, DisconnectReason::Protocol);
            return;
        }
        log::info!("[SRV] ucid({}) protocol error, delayed close: {}", key, err);
        s.mark_attack();
        s.read_paused = true;
    }

    fn on_writable(&mut self, key: Key) {
        let connecting = {
            let Some(s) = self.sessions.get(&key) else {
                return;
            };
            s.connect_out && s.status == Status::Connecting
        };
        if connecting {
            match self.poller.take_error(key) {
                Ok(Some(err)) => {
                    log::debug!("[SRV] ucid({}) connect failed: {}", key, err);
                    self.events.push(ServerEvent::ConnectFailed {
                        key,
                        error: err.to_string(),
                    });
                    self.sessions.remove(&key);
                    self.poller.close_key(key);
                    return;
                }
                Ok(None) => {
                    if let Some(s) = self.sessions.get_mut(&key) {
                        s.status = Status::Connected;
                    }
                    self.events.push(ServerEvent::ConnectOut { key });
                }
                Err(e) => {
                    self.events.push(ServerEvent::ConnectFailed {
                        key,
                        error: e.to_string(),
                    });
                    self.sessions.remove(&key);
                    self.poller.close_key(key);
                    return;
                }
            }
        }
        self.drain_send(key);
    }

    /// Flush the send buffer until EAGAIN or empty; refill from the
    /// file send job whenever the buffer fully drains.
    fn drain_send(&mut self, key: Key) {
        let mut close_reason: Option<DisconnectReason> = None;
        loop {
            let Some(s) = self.sessions.get_mut(&key) else {
                return;
            };
            if s.closing {
                return;
            }
            if s.sndbuf.is_empty() {
                if s.send_job.is_some() {
                    if !s.refill_send_job() {
                        close_reason =
                            Some(DisconnectReason::Transport("send job read failed".into()));
                        break;
                    }
                    if !s.sndbuf.is_empty() {
                        continue;
                    }
                }
                if s.close_after_send && s.send_job.is_none() {
                    close_reason = Some(DisconnectReason::Local);
                }
                break;
            }
            let Some(region) = s.sndbuf.peek_contiguous() else {
                break;
            };
            let res = self.poller.send(key, region);
            let s = match self.sessions.get_mut(&key) {
                Some(s) => s,
                None => return,
            };
            match res {
                Ok(0) => {
                    close_reason = Some(DisconnectReason::Transport("send returned 0".into()));
                    break;
                }
                Ok(n) => {
                    s.sndbuf.consume(n);
                    s.last_io = Instant::now();
                }
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    close_reason = Some(DisconnectReason::Transport(e.to_string()));
                    break;
                }
            }
        }
        match close_reason {
            Some(reason) => self.close_key_reason(key, reason),
            None => self.send_trigger(key),
        }
    }

    pub(crate) fn set_send_job(&mut self, key: Key, job: crate::http::files::SendJob) {
        if let Some(s) = self.sessions.get_mut(&key) {
            s.send_job = Some(job);
        }
    }

    fn process_pending_closes(&mut self) {
        let pending = std::mem::take(&mut self.pending_close);
        for (key, reason) in pending {
            if let Some(s) = self.sessions.remove(&key) {
                self.poller.close_key(key);
                match s.protocol {
                    Protocol::Listen | Protocol::Udp => {}
                    _ => {
                        log::debug!("[SRV] ucid({}) disconnected: {:?}", key, reason);
                        self.events.push(ServerEvent::Disconnected { key, reason });
                    }
                }
            }
        }
    }
}

#[cfg(feature = "tls")]
fn upgrade_https(s: &mut Session) -> Result<()> {
    s.upgrade_tls_to_https()
}

#[cfg(not(feature = "tls"))]
fn upgrade_https(_s: &mut Session) -> Result<()> {
    Err(Error::Protocol("tls support disabled".into()))
}
