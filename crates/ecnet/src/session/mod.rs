// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Per-connection session state and the protocol upgrade chain.
//!
//! A session starts as raw TCP. Its first bytes are sniffed: a TLS
//! record prefix moves it into the TLS layer, an HTTP method keyword
//! into the HTTP layer, anything else fixes it as raw TCP. Over TLS the
//! same sniff runs once more on the decrypted stream (TLS -> HTTPS). An
//! HTTP(S) session that accepts a WebSocket handshake flips its tag to
//! WS(S) in place. Upgrades always preserve the parse buffer and the
//! send buffer.

pub mod http;
#[cfg(feature = "tls")]
pub mod tls;

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{BlockPool, SendBuffer};
use crate::error::{Error, Result};
use crate::http::files::SendJob;
use crate::http::Request;
use crate::poller::Key;
use crate::session::http::{HttpRead, HttpState};
#[cfg(feature = "tls")]
use crate::session::tls::{looks_like_client_hello, TlsCredentials, TlsStream};

/// Session protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP listener entry.
    Listen,
    /// Bound UDP socket entry.
    Udp,
    Tcp,
    Tls,
    Http,
    Https,
    Ws,
    Wss,
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    TlsHandshakeDone,
}

/// One parsed unit surfaced by [`Session::on_recv_bytes`].
#[derive(Debug)]
pub enum RecvMsg {
    /// Nothing complete yet.
    None,
    /// Opaque passthrough bytes (raw TCP / raw TLS application data).
    Tcp(Vec<u8>),
    /// Complete HTTP request.
    Http(Request),
    /// Complete WebSocket message.
    Ws { opcode: u8, payload: Vec<u8> },
}

/// Sniff verdict over the first buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    NeedMore,
    Tls,
    Http,
    Raw,
}

enum ProtoState {
    /// Listener/UDP table entries; never carries a byte stream.
    Passive,
    Tcp,
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream>),
    Http(HttpState),
    #[cfg(feature = "tls")]
    Https {
        tls: Box<TlsStream>,
        http: HttpState,
    },
}

/// Per-connection state.
pub struct Session {
    pub key: Key,
    /// Listener that produced this session; dispatch tag for per-port
    /// policy. -1 for outbound sessions.
    pub listen_key: Key,
    pub protocol: Protocol,
    pub status: Status,
    pub connect_out: bool,
    pub peer_ip: String,
    pub peer_port: u16,
    pub read_paused: bool,
    /// Per-wakeup read budget override; None uses the server default,
    /// Some(0) pauses like `read_paused`.
    pub read_limit: Option<usize>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connected_at: Instant,
    pub last_io: Instant,

    pub(crate) readable: bool,
    pub(crate) close_after_send: bool,
    pub(crate) closing: bool,
    pub(crate) attack_since: Option<Instant>,
    pub(crate) rbuf: Vec<u8>,
    pub(crate) sndbuf: SendBuffer,
    pub(crate) send_job: Option<SendJob>,

    state: ProtoState,
    sniff_done: bool,
    ext: Option<Box<dyn Any>>,
}

impl Session {
    /// New TCP session (accepted or outbound).
    pub fn new(
        key: Key,
        listen_key: Key,
        sndbuf_cap: usize,
        pool: Arc<BlockPool>,
        peer_ip: String,
        peer_port: u16,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            listen_key,
            protocol: Protocol::Tcp,
            status: Status::Connected,
            connect_out: false,
            peer_ip,
            peer_port,
            read_paused: false,
            read_limit: None,
            bytes_in: 0,
            bytes_out: 0,
            connected_at: now,
            last_io: now,
            readable: false,
            close_after_send: false,
            closing: false,
            attack_since: None,
            rbuf: Vec::new(),
            sndbuf: SendBuffer::new(sndbuf_cap, pool),
            send_job: None,
            state: ProtoState::Tcp,
            sniff_done: false,
            ext: None,
        }
    }

    /// Table entry for a listener or UDP socket.
    pub fn passive(key: Key, protocol: Protocol, pool: Arc<BlockPool>) -> Self {
        let mut s = Self::new(key, -1, 0, pool, String::new(), 0);
        s.protocol = protocol;
        s.state = ProtoState::Passive;
        s.sniff_done = true;
        s
    }

    // -- accessors ---------------------------------------------------------

    pub fn water_level(&self) -> u32 {
        self.sndbuf.water_level()
    }

    pub fn send_pending(&self) -> usize {
        self.sndbuf.len()
    }

    /// Attach opaque application data; replaces and drops any previous.
    pub fn set_ext<T: Any>(&mut self, value: T) {
        self.ext = Some(Box::new(value));
    }

    pub fn ext<T: Any>(&self) -> Option<&T> {
        self.ext.as_ref().and_then(|b| b.downcast_ref())
    }

    pub fn ext_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.ext.as_mut().and_then(|b| b.downcast_mut())
    }

    pub fn has_send_job(&self) -> bool {
        self.send_job.is_some()
    }

    pub(crate) fn mark_attack(&mut self) {
        if self.attack_since.is_none() {
            self.attack_since = Some(Instant::now());
        }
    }

    /// Whether this session has been flagged for the delayed close.
    pub fn is_attack(&self) -> bool {
        self.attack_since.is_some()
    }

    // -- receive path ------------------------------------------------------

    /// Sniff verdict for an un-upgraded session; meaningful only while
    /// the protocol tag is Tcp or Tls.
    pub fn sniff(&self) -> Sniff {
        if self.sniff_done {
            return Sniff::Raw;
        }
        let buf = &self.rbuf;
        #[cfg(feature = "tls")]
        if self.protocol == Protocol::Tcp && buf.len() >= 3 && looks_like_client_hello(buf) {
            return Sniff::Tls;
        }
        if buf.len() >= 4 {
            let mut p = [0u8; 4];
            p.copy_from_slice(&buf[..4]);
            p.make_ascii_uppercase();
            if p.starts_with(b"GET") || &p == b"HEAD" || &p == b"POST" {
                return Sniff::Http;
            }
            return Sniff::Raw;
        }
        // A TLS prefix was ruled out above; 3 bytes of "GET" may still
        // grow into a method keyword.
        if buf.len() == 3 {
            let mut p = [0u8; 3];
            p.copy_from_slice(&buf[..3]);
            p.make_ascii_uppercase();
            if &p == b"GET" || &p == b"HEA" || &p == b"POS" {
                return Sniff::NeedMore;
            }
            #[cfg(feature = "tls")]
            if self.protocol == Protocol::Tcp && buf[0] == 22 {
                return Sniff::NeedMore;
            }
            return Sniff::Raw;
        }
        Sniff::NeedMore
    }

    /// Fix the session as raw TCP; buffered bytes flow to the
    /// application from now on.
    pub fn set_raw_tcp(&mut self) {
        self.sniff_done = true;
    }

    /// Whether the first-bytes sniff has not concluded yet.
    pub(crate) fn sniff_pending(&self) -> bool {
        !self.sniff_done
    }

    /// Feed freshly read bytes (`Some`) or continue parsing buffered
    /// data (`None`). Returns at most one parsed unit per call; the
    /// caller loops until [`RecvMsg::None`].
    pub fn on_recv_bytes(&mut self, input: Option<&[u8]>) -> Result<RecvMsg> {
        if let Some(d) = input {
            self.bytes_in += d.len() as u64;
            self.last_io = Instant::now();
        }
        match &mut self.state {
            ProtoState::Passive => Ok(RecvMsg::None),
            ProtoState::Tcp => {
                if let Some(d) = input {
                    self.rbuf.extend_from_slice(d);
                }
                if self.sniff_done && !self.rbuf.is_empty() {
                    Ok(RecvMsg::Tcp(std::mem::take(&mut self.rbuf)))
                } else {
                    Ok(RecvMsg::None)
                }
            }
            #[cfg(feature = "tls")]
            ProtoState::Tls(tls) => {
                if let Some(d) = input {
                    let mut wire = Vec::new();
                    let done = tls.on_tcp_read(d, &mut wire, &mut self.rbuf)?;
                    if !wire.is_empty() {
                        self.sndbuf.append(&wire)?;
                    }
                    if done && self.status != Status::TlsHandshakeDone {
                        self.status = Status::TlsHandshakeDone;
                        log::debug!("[TLS] ucid({}) handshake complete", self.key);
                    }
                }
                if self.sniff_done && !self.rbuf.is_empty() {
                    Ok(RecvMsg::Tcp(std::mem::take(&mut self.rbuf)))
                } else {
                    Ok(RecvMsg::None)
                }
            }
            ProtoState::Http(http) => {
                if let Some(d) = input {
                    self.rbuf.extend_from_slice(d);
                }
                loop {
                    let (used, outcome) = http.read(self.key, &self.rbuf);
                    if used > 0 {
                        self.rbuf.drain(..used);
                    }
                    match outcome? {
                        HttpRead::NeedMore => return Ok(RecvMsg::None),
                        HttpRead::Request(req) => return Ok(RecvMsg::Http(req)),
                        HttpRead::WsMessage { opcode, payload } => {
                            return Ok(RecvMsg::Ws { opcode, payload })
                        }
                        HttpRead::Reply(bytes) => self.sndbuf.append(&bytes)?,
                        HttpRead::Upgraded(bytes) => {
                            self.sndbuf.append(&bytes)?;
                            self.protocol = Protocol::Ws;
                        }
                    }
                }
            }
            #[cfg(feature = "tls")]
            ProtoState::Https { tls, http } => {
                if let Some(d) = input {
                    let mut wire = Vec::new();
                    tls.on_tcp_read(d, &mut wire, &mut self.rbuf)?;
                    if !wire.is_empty() {
                        self.sndbuf.append(&wire)?;
                    }
                }
                loop {
                    let (used, outcome) = http.read(self.key, &self.rbuf);
                    if used > 0 {
                        self.rbuf.drain(..used);
                    }
                    match outcome? {
                        HttpRead::NeedMore => return Ok(RecvMsg::None),
                        HttpRead::Request(req) => return Ok(RecvMsg::Http(req)),
                        HttpRead::WsMessage { opcode, payload } => {
                            return Ok(RecvMsg::Ws { opcode, payload })
                        }
                        HttpRead::Reply(bytes) => {
                            let mut wire = Vec::new();
                            tls.encode_app(&bytes, &mut wire)?;
                            self.sndbuf.append(&wire)?;
                        }
                        HttpRead::Upgraded(bytes) => {
                            let mut wire = Vec::new();
                            tls.encode_app(&bytes, &mut wire)?;
                            self.sndbuf.append(&wire)?;
                            self.protocol = Protocol::Wss;
                        }
                    }
                }
            }
        }
    }

    // -- upgrades ----------------------------------------------------------

    /// TCP -> TLS. The already-buffered ClientHello bytes move into the
    /// TLS layer's inbound queue.
    #[cfg(feature = "tls")]
    pub fn upgrade_to_tls(&mut self, creds: &TlsCredentials) -> Result<()> {
        if !matches!(self.state, ProtoState::Tcp) {
            return Err(Error::Protocol("not a plain TCP session".into()));
        }
        let mut tls = Box::new(TlsStream::new(creds)?);
        let buffered = std::mem::take(&mut self.rbuf);
        let mut wire = Vec::new();
        let mut app = Vec::new();
        let done = tls.on_tcp_read(&buffered, &mut wire, &mut app)?;
        if !wire.is_empty() {
            self.sndbuf.append(&wire)?;
        }
        self.rbuf = app;
        self.state = ProtoState::Tls(tls);
        self.protocol = Protocol::Tls;
        if done {
            self.status = Status::TlsHandshakeDone;
        }
        log::info!("[SRV] ucid({}) upgraded to TLS", self.key);
        Ok(())
    }

    /// TCP -> HTTP. Buffered request bytes stay in the parse buffer.
    pub fn upgrade_to_http(&mut self) -> Result<()> {
        if !matches!(self.state, ProtoState::Tcp) {
            return Err(Error::Protocol("not a plain TCP session".into()));
        }
        self.state = ProtoState::Http(HttpState::new());
        self.protocol = Protocol::Http;
        self.sniff_done = true;
        log::info!("[SRV] ucid({}) upgraded to HTTP", self.key);
        Ok(())
    }

    /// TLS -> HTTPS, after the second sniff on the decrypted stream.
    #[cfg(feature = "tls")]
    pub fn upgrade_tls_to_https(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ProtoState::Tcp);
        match state {
            ProtoState::Tls(tls) => {
                self.state = ProtoState::Https {
                    tls,
                    http: HttpState::new(),
                };
                self.protocol = Protocol::Https;
                self.sniff_done = true;
                log::info!("[SRV] ucid({}) upgraded to HTTPS", self.key);
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::Protocol("not a TLS session".into()))
            }
        }
    }

    // -- send path ---------------------------------------------------------

    /// Encode and queue application bytes for this session's protocol.
    /// `opcode` selects the WebSocket frame type once upgraded and is
    /// ignored otherwise.
    pub fn queue_send(&mut self, opcode: u8, data: &[u8]) -> Result<usize> {
        match &mut self.state {
            ProtoState::Passive => Err(Error::SessionNotFound(self.key)),
            ProtoState::Tcp => {
                self.sndbuf.append(data)?;
                self.bytes_out += data.len() as u64;
                Ok(data.len())
            }
            #[cfg(feature = "tls")]
            ProtoState::Tls(tls) => {
                let mut wire = Vec::new();
                tls.encode_app(data, &mut wire)?;
                self.sndbuf.append(&wire)?;
                self.bytes_out += data.len() as u64;
                Ok(data.len())
            }
            ProtoState::Http(http) => {
                let encoded = http.encode_send(opcode, data, None)?;
                self.sndbuf.append(&encoded)?;
                self.bytes_out += data.len() as u64;
                Ok(data.len())
            }
            #[cfg(feature = "tls")]
            ProtoState::Https { tls, http } => {
                let encoded = http.encode_send(opcode, data, None)?;
                let mut wire = Vec::new();
                tls.encode_app(&encoded, &mut wire)?;
                self.sndbuf.append(&wire)?;
                self.bytes_out += data.len() as u64;
                Ok(data.len())
            }
        }
    }

    /// Refill the send buffer from the pending file job, if any.
    /// Returns false when the job failed and the session must die.
    pub(crate) fn refill_send_job(&mut self) -> bool {
        let Some(job) = &mut self.send_job else {
            return true;
        };
        match job.next_chunk() {
            Some(chunk) => {
                let done = job.done();
                // Job bytes are pre-encoded HTTP body data; TLS-wrap
                // when needed but never WebSocket-frame them.
                let queued = match &mut self.state {
                    #[cfg(feature = "tls")]
                    ProtoState::Https { tls, .. } => {
                        let mut wire = Vec::new();
                        tls.encode_app(&chunk, &mut wire)
                            .and_then(|()| self.sndbuf.append(&wire))
                    }
                    _ => self.sndbuf.append(&chunk),
                };
                if queued.is_err() {
                    return false;
                }
                self.bytes_out += chunk.len() as u64;
                if done {
                    self.send_job = None;
                }
                true
            }
            None => {
                let failed = !job.done();
                self.send_job = None;
                !failed
            }
        }
    }

    /// Whether a TLS-family handshake is still in flight (protocol
    /// errors here close immediately instead of the attack delay).
    pub(crate) fn in_tls_handshake(&self) -> bool {
        matches!(self.protocol, Protocol::Tls | Protocol::Https | Protocol::Wss)
            && self.status != Status::TlsHandshakeDone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_session() -> Session {
        Session::new(
            5,
            1,
            1024 * 1024,
            BlockPool::with_block_size(4096, 2),
            "127.0.0.1".into(),
            4444,
        )
    }

    fn drain_sndbuf(s: &mut Session) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(region) = s.sndbuf.peek_contiguous() {
            out.extend_from_slice(region);
            let n = region.len();
            s.sndbuf.consume(n);
        }
        out
    }

    #[test]
    fn test_sniff_verdicts() {
        let mut s = tcp_session();
        assert_eq!(s.sniff(), Sniff::NeedMore);

        s.rbuf = b"GE".to_vec();
        assert_eq!(s.sniff(), Sniff::NeedMore);
        s.rbuf = b"GET ".to_vec();
        assert_eq!(s.sniff(), Sniff::Http);
        s.rbuf = b"HEAD".to_vec();
        assert_eq!(s.sniff(), Sniff::Http);
        s.rbuf = b"POST".to_vec();
        assert_eq!(s.sniff(), Sniff::Http);
        s.rbuf = b"QUIT".to_vec();
        assert_eq!(s.sniff(), Sniff::Raw);
        #[cfg(feature = "tls")]
        {
            s.rbuf = vec![22, 3, 1];
            assert_eq!(s.sniff(), Sniff::Tls);
            s.rbuf = vec![22, 3, 4];
            assert_eq!(s.sniff(), Sniff::Raw);
        }
    }

    #[test]
    fn test_raw_tcp_passthrough_after_sniff() {
        let mut s = tcp_session();
        assert!(matches!(
            s.on_recv_bytes(Some(b"QUIT now")).expect("recv"),
            RecvMsg::None
        ));
        assert_eq!(s.sniff(), Sniff::Raw);
        s.set_raw_tcp();
        match s.on_recv_bytes(None).expect("recv") {
            RecvMsg::Tcp(data) => assert_eq!(data, b"QUIT now"),
            other => panic!("expected passthrough, got {:?}", other),
        }
    }

    #[test]
    fn test_http_upgrade_preserves_buffered_bytes() {
        let mut s = tcp_session();
        let raw = b"GET /hello HTTP/1.1\r\nHost: h\r\n\r\n";
        let _ = s.on_recv_bytes(Some(raw)).expect("recv");
        assert_eq!(s.sniff(), Sniff::Http);
        s.upgrade_to_http().expect("upgrade");
        assert_eq!(s.protocol, Protocol::Http);

        match s.on_recv_bytes(None).expect("recv") {
            RecvMsg::Http(req) => assert_eq!(req.url, "/hello"),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_ws_upgrade_in_place_and_echo() {
        let mut s = tcp_session();
        let _ = s
            .on_recv_bytes(Some(
                b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\n\r\n",
            ))
            .expect("recv");
        s.upgrade_to_http().expect("upgrade");
        assert!(matches!(s.on_recv_bytes(None).expect("recv"), RecvMsg::None));
        assert_eq!(s.protocol, Protocol::Ws, "tag mutated in place");
        let resp = drain_sndbuf(&mut s);
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 101 "));

        // Masked client frame delivered as message.
        let mut frame = vec![0x81, 0x82, 9, 9, 9, 9];
        frame.extend_from_slice(&[b'o' ^ 9, b'k' ^ 9]);
        match s.on_recv_bytes(Some(&frame)).expect("recv") {
            RecvMsg::Ws { payload, .. } => assert_eq!(payload, b"ok"),
            other => panic!("expected ws message, got {:?}", other),
        }

        // Outbound bytes are framed now.
        s.queue_send(crate::ws::OP_TEXT, b"yo").expect("send");
        assert_eq!(drain_sndbuf(&mut s), vec![0x81, 0x02, b'y', b'o']);
    }

    #[test]
    fn test_queue_send_respects_cap() {
        let mut s = Session::new(
            1,
            1,
            8,
            BlockPool::with_block_size(16, 1),
            "::1".into(),
            1,
        );
        assert!(s.queue_send(0, b"12345678").is_ok());
        assert!(matches!(
            s.queue_send(0, b"x").unwrap_err(),
            Error::BufferFull
        ));
    }

    #[test]
    fn test_ext_data_slot() {
        struct AppData {
            hits: u32,
        }
        let mut s = tcp_session();
        assert!(s.ext::<AppData>().is_none());
        s.set_ext(AppData { hits: 1 });
        s.ext_mut::<AppData>().expect("ext set").hits += 1;
        assert_eq!(s.ext::<AppData>().expect("ext set").hits, 2);
    }

    #[test]
    fn test_attack_marking_idempotent() {
        let mut s = tcp_session();
        assert!(!s.is_attack());
        s.mark_attack();
        let first = s.attack_since;
        s.mark_attack();
        assert_eq!(s.attack_since, first);
    }
}
