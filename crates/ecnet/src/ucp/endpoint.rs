// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! UCP connection management: SYN/SYNR handshake, per-session send and
//! receive state, acknowledgement and retransmission scheduling,
//! heartbeats and teardown.
//!
//! The engine is transport-agnostic: every outgoing datagram goes
//! through a [`DatagramSender`], so the same state machines run over
//! the live poller and over deterministic test harnesses. All clocks
//! are caller-supplied milliseconds, which keeps retransmission timing
//! reproducible.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use crate::config::{UcpConfig, UCP_NONCE_SIZE, UCP_PAYLOAD_MAX, UCP_SENDQ_FULL};
use crate::error::{Error, Result};
use crate::poller::{Key, Poller};
use crate::ucp::queue::{RecvQueue, SendQueue};
use crate::ucp::wire::{
    decode_frame, encode_frame, FrameHeader, CMD_ACK, CMD_DAT, CMD_DATR, CMD_FIN, CMD_HRT,
    CMD_SYN, CMD_SYNR,
};

/// Reorder-buffer cap; frames beyond it are dropped and retransmitted
/// later by the peer.
const RECVQ_CAP: usize = 2 * crate::config::UCP_SENDQ_FRAMES;

/// Transmit side of the engine, implemented by the live poller and by
/// test harnesses.
pub trait DatagramSender {
    /// Send one encoded frame on a channel. `resend` marks
    /// retransmissions.
    fn send_frame(
        &mut self,
        chan: Key,
        addr: SocketAddr,
        frame: &[u8],
        resend: bool,
    ) -> io::Result<usize>;
}

impl DatagramSender for Poller {
    fn send_frame(
        &mut self,
        chan: Key,
        addr: SocketAddr,
        frame: &[u8],
        _resend: bool,
    ) -> io::Result<usize> {
        match self.send_to(chan, frame, addr) {
            Ok(n) => Ok(n),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

/// Why a UCP session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UcpDisconnect {
    /// Peer sent FIN.
    Fin,
    /// Malformed traffic on the session.
    Error,
    /// Retransmissions exhausted.
    Timeout,
}

/// Notifications surfaced by the engine.
#[derive(Debug, PartialEq, Eq)]
pub enum UcpEvent {
    Connected { ssid: u32, outbound: bool },
    Disconnected { ssid: u32, reason: UcpDisconnect },
    /// In-order application bytes.
    Data { ssid: u32, data: Vec<u8> },
}

/// One UDP endpoint a session sprays over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UcpChannel {
    pub key: Key,
    pub peer: SocketAddr,
}

struct UcpSession {
    ssid: u32,
    inbound: bool,
    nonce: [u8; UCP_NONCE_SIZE],
    next_send_seq: u64,
    next_recv_seq: u64,
    /// Cumulative ack value last told to the peer.
    acked_to_peer: u64,
    ack_repeat: u32,
    force_ack: bool,
    /// Highest seq the peer acknowledged, for the fast-retransmit gap
    /// rule.
    peer_max_acked: u64,
    sendq: SendQueue,
    recvq: RecvQueue,
    last_read_ms: i64,
    last_send_ms: i64,
    channels: Vec<UcpChannel>,
}

impl UcpSession {
    fn new(ssid: u32, inbound: bool, nonce: [u8; UCP_NONCE_SIZE], now_ms: i64) -> Self {
        Self {
            ssid,
            inbound,
            nonce,
            next_send_seq: 1,
            next_recv_seq: 1,
            acked_to_peer: 0,
            ack_repeat: 0,
            force_ack: false,
            peer_max_acked: 0,
            sendq: SendQueue::new(),
            recvq: RecvQueue::new(),
            last_read_ms: now_ms,
            last_send_ms: now_ms,
            channels: Vec::with_capacity(2),
        }
    }

    /// Bind or refresh a channel's peer address.
    fn add_channel(&mut self, key: Key, peer: SocketAddr) {
        for ch in &mut self.channels {
            if ch.key == key {
                ch.peer = peer;
                return;
            }
        }
        self.channels.push(UcpChannel { key, peer });
    }

    fn spray<S: DatagramSender>(&self, sender: &mut S, frame: &[u8], resend: bool) {
        for ch in &self.channels {
            if let Err(e) = sender.send_frame(ch.key, ch.peer, frame, resend) {
                log::debug!("[UCP] ssid({:08X}) send on key({}) failed: {}", self.ssid, ch.key, e);
            }
        }
    }

    /// Build the periodic cumulative ACK, if one is due. The header seq
    /// carries the acknowledge-up-to value; the payload carries the
    /// greatest seq received so far so the sender can infer gaps.
    fn build_ack(&mut self) -> Option<Vec<u8>> {
        let up_to = self.next_recv_seq - 1;
        if up_to == 0 {
            return None;
        }
        if self.acked_to_peer == up_to && self.ack_repeat > 2 && !self.force_ack {
            return None;
        }
        if self.acked_to_peer != up_to {
            self.ack_repeat = 0;
        }
        self.ack_repeat += 1;
        let payload = self.recvq.max_seq().max(up_to).to_le_bytes();
        let frame = encode_frame(self.ssid, up_to, CMD_ACK, &payload).ok()?;
        self.acked_to_peer = up_to;
        self.force_ack = false;
        Some(frame)
    }

    /// Timer- and gap-driven retransmission pass. Returns the highest
    /// retry count reached.
    fn resend<S: DatagramSender>(&mut self, now_ms: i64, sender: &mut S, cfg: &UcpConfig) -> u32 {
        let mut sent = 0usize;
        let mut max_retries = 0u32;
        let mut timer_hits = 0usize;
        let mut gap_hits = 0usize;
        for item in self.sendq.iter_mut() {
            if sent >= cfg.resend_burst {
                break;
            }
            let rto = cfg.base_rto_ms.saturating_mul(1i64 << item.retries.min(20));
            let timed_out = (now_ms - item.sent_ms).abs() > rto;
            let gap = item.retries == 0 && item.seq + cfg.ack_delta < self.peer_max_acked;
            if !timed_out && !gap {
                continue;
            }
            if timed_out {
                timer_hits += 1;
            } else {
                gap_hits += 1;
            }
            match encode_frame(self.ssid, item.seq, CMD_DATR, &item.payload) {
                Ok(frame) => {
                    for ch in &self.channels {
                        let _ = sender.send_frame(ch.key, ch.peer, &frame, true);
                    }
                    item.retries += 1;
                    item.sent_ms = now_ms;
                    sent += 1;
                    max_retries = max_retries.max(item.retries);
                }
                Err(e) => {
                    log::error!("[UCP] ssid({:08X}) resend encode: {}", self.ssid, e);
                }
            }
        }
        if sent > 0 {
            self.last_send_ms = now_ms;
            log::debug!(
                "[UCP] ssid({:08X}) resent {} frames, timer={} gap={} max retries {}, sendq {}",
                self.ssid,
                sent,
                timer_hits,
                gap_hits,
                max_retries,
                self.sendq.len()
            );
        }
        max_retries
    }
}

/// Multi-session UCP engine; one per set of UDP channels.
pub struct UcpEndpoint {
    cfg: UcpConfig,
    /// Local channels used for outbound connects.
    channels: Vec<UcpChannel>,
    next_local: u32,
    next_remote: u32,
    /// Connecting (client) sessions, keyed by the low-16 local id.
    pending: HashMap<u32, UcpSession>,
    /// Established sessions, keyed by the full 32-bit id.
    established: HashMap<u32, UcpSession>,
    last_tick_ms: i64,
    events: Vec<UcpEvent>,
}

impl UcpEndpoint {
    pub fn new(cfg: UcpConfig) -> Self {
        Self {
            cfg,
            channels: Vec::with_capacity(2),
            next_local: 0,
            next_remote: 0,
            pending: HashMap::new(),
            established: HashMap::new(),
            last_tick_ms: 0,
            events: Vec::new(),
        }
    }

    /// Register a local UDP channel for outbound connects; an existing
    /// entry with the same key has its peer address refreshed.
    pub fn add_channel(&mut self, key: Key, peer: SocketAddr) {
        for ch in &mut self.channels {
            if ch.key == key {
                ch.peer = peer;
                return;
            }
        }
        self.channels.push(UcpChannel { key, peer });
    }

    /// Drain pending notifications.
    pub fn poll_events(&mut self) -> Vec<UcpEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn established_count(&self) -> usize {
        self.established.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remaining in-flight frame budget for a session.
    pub fn send_window_left(&self, ssid: u32) -> usize {
        self.established
            .get(&ssid)
            .map(|s| s.sendq.window_left())
            .unwrap_or(0)
    }

    /// Whether an encoded data frame has already been acknowledged
    /// (slow-channel transmit skipping).
    pub fn acked(&self, frame: &[u8]) -> bool {
        let Some((h, _)) = decode_frame(frame) else {
            return false;
        };
        if h.cmd != CMD_DAT && h.cmd != CMD_DATR {
            return false;
        }
        self.established
            .get(&h.ssid)
            .map(|s| s.sendq.acked(h.seq))
            .unwrap_or(false)
    }

    fn alloc_local_id(&mut self) -> Option<u32> {
        for _ in 0..65534 {
            self.next_local += 1;
            if self.next_local >= 65535 {
                self.next_local = 1;
            }
            let id = self.next_local;
            let live = self.pending.contains_key(&id)
                || self.established.keys().any(|k| k & 0xffff == id);
            if !live {
                return Some(id);
            }
        }
        None
    }

    fn alloc_remote_id(&mut self) -> Option<u32> {
        for _ in 0..65534 {
            self.next_remote += 1;
            if self.next_remote >= 65535 {
                self.next_remote = 1;
            }
            let id = self.next_remote;
            if !self.established.keys().any(|k| k >> 16 == id) {
                return Some(id);
            }
        }
        None
    }

    /// Start an outbound connect: spray SYN with a fresh nonce over
    /// every registered channel. Returns the local (low-16) session id;
    /// `Connected` fires once a SYNR arrives.
    pub fn connect_async<S: DatagramSender>(&mut self, sender: &mut S, now_ms: i64) -> Result<u32> {
        let nonce = *uuid::Uuid::new_v4().as_bytes();
        self.connect_with_nonce(sender, now_ms, nonce)
    }

    /// Outbound connect with a caller-chosen dedup nonce.
    pub fn connect_with_nonce<S: DatagramSender>(
        &mut self,
        sender: &mut S,
        now_ms: i64,
        nonce: [u8; UCP_NONCE_SIZE],
    ) -> Result<u32> {
        if self.channels.is_empty() {
            return Err(Error::InvalidAddress("no UCP channels registered".into()));
        }
        let id = self.alloc_local_id().ok_or(Error::WouldBlock)?;
        let mut sess = UcpSession::new(id, false, nonce, now_ms);
        for ch in &self.channels {
            sess.add_channel(ch.key, ch.peer);
        }
        let frame = encode_frame(id, u64::from(id), CMD_SYN, &nonce)?;
        sess.spray(sender, &frame, false);
        sess.last_send_ms = now_ms;
        self.pending.insert(id, sess);
        log::debug!("[UCP] connect out, local id {:04X}", id);
        Ok(id)
    }

    /// Close a session. Established ids send a fire-and-forget FIN;
    /// pending (low-16) ids are just dropped. No disconnect event is
    /// raised for a local close.
    pub fn close<S: DatagramSender>(&mut self, ssid: u32, sender: &mut S) -> Result<()> {
        if ssid & 0xffff_0000 != 0 {
            let sess = self
                .established
                .remove(&ssid)
                .ok_or(Error::SessionNotFound(ssid as i32))?;
            if let Ok(frame) = encode_frame(ssid, 0, CMD_FIN, &[]) {
                sess.spray(sender, &frame, false);
            }
            Ok(())
        } else if self.pending.remove(&ssid).is_some() {
            Ok(())
        } else {
            Err(Error::SessionNotFound(ssid as i32))
        }
    }

    /// Send application bytes: split into MTU-sized data frames, spray
    /// each on every channel, keep copies in the retransmit queue.
    /// Returns the bytes queued; `WouldBlock` when the window is full.
    pub fn send<S: DatagramSender>(
        &mut self,
        ssid: u32,
        data: &[u8],
        sender: &mut S,
        now_ms: i64,
    ) -> Result<usize> {
        let sess = self
            .established
            .get_mut(&ssid)
            .ok_or(Error::SessionNotFound(ssid as i32))?;
        let mut sent = 0usize;
        while sent < data.len() && sess.sendq.len() < UCP_SENDQ_FULL {
            let chunk = (data.len() - sent).min(UCP_PAYLOAD_MAX);
            let seq = sess.next_send_seq;
            let frame = encode_frame(ssid, seq, CMD_DAT, &data[sent..sent + chunk])?;
            sess.next_send_seq += 1;
            sess.spray(sender, &frame, false);
            sess.sendq.push(seq, data[sent..sent + chunk].to_vec(), now_ms);
            sent += chunk;
        }
        if sent > 0 {
            sess.last_send_ms = now_ms;
        }
        if sent == 0 && !data.is_empty() {
            return Err(Error::WouldBlock);
        }
        Ok(sent)
    }

    /// Process one received datagram. `chan` is the local socket key it
    /// arrived on, `from` the peer address.
    pub fn on_frame<S: DatagramSender>(
        &mut self,
        chan: Key,
        from: SocketAddr,
        frame: &[u8],
        sender: &mut S,
        now_ms: i64,
    ) {
        let Some((header, payload)) = decode_frame(frame) else {
            log::trace!("[UCP] key({}) undecodable frame, {} bytes", chan, frame.len());
            return;
        };
        match header.cmd {
            CMD_SYN => self.on_syn(chan, from, &header, &payload, sender, now_ms),
            CMD_SYNR => self.on_synr(chan, from, &header, now_ms),
            _ => self.on_session_frame(chan, from, &header, payload, sender, now_ms),
        }
    }

    fn on_syn<S: DatagramSender>(
        &mut self,
        chan: Key,
        from: SocketAddr,
        header: &FrameHeader,
        payload: &[u8],
        sender: &mut S,
        now_ms: i64,
    ) {
        if payload.len() != UCP_NONCE_SIZE {
            log::info!("[UCP] key({}) SYN with bad nonce size {}", chan, payload.len());
            return;
        }
        // Same nonce on another channel: refresh the binding, re-answer
        // SYNR so a lost first answer still completes the handshake.
        if let Some(sess) = self
            .established
            .values_mut()
            .find(|s| s.inbound && s.nonce[..] == payload[..])
        {
            sess.add_channel(chan, from);
            if let Ok(reply) = encode_frame(sess.ssid, header.seq, CMD_SYNR, &[]) {
                let _ = sender.send_frame(chan, from, &reply, false);
            }
            return;
        }
        let Some(high) = self.alloc_remote_id() else {
            log::error!("[UCP] session id space exhausted");
            return;
        };
        let ssid = (high << 16) | (header.ssid & 0xffff);
        let mut nonce = [0u8; UCP_NONCE_SIZE];
        nonce.copy_from_slice(payload);
        let mut sess = UcpSession::new(ssid, true, nonce, now_ms);
        sess.add_channel(chan, from);
        if let Ok(reply) = encode_frame(ssid, header.seq, CMD_SYNR, &[]) {
            let _ = sender.send_frame(chan, from, &reply, false);
        }
        self.established.insert(ssid, sess);
        log::info!("[UCP] key({}) new connect ssid({:08X}) from udp://{}", chan, ssid, from);
        self.events.push(UcpEvent::Connected {
            ssid,
            outbound: false,
        });
    }

    fn on_synr(&mut self, chan: Key, from: SocketAddr, header: &FrameHeader, now_ms: i64) {
        let low = header.ssid & 0xffff;
        if let Some(mut sess) = self.pending.remove(&low) {
            sess.ssid = header.ssid;
            sess.add_channel(chan, from);
            sess.last_read_ms = now_ms;
            log::debug!("[UCP] ssid({:08X}) connect success via key({})", header.ssid, chan);
            self.established.insert(header.ssid, sess);
            self.events.push(UcpEvent::Connected {
                ssid: header.ssid,
                outbound: true,
            });
        } else if let Some(sess) = self.established.get_mut(&header.ssid) {
            // A SYNR arriving on an additional channel only updates the
            // channel binding; no second Connected is raised.
            sess.add_channel(chan, from);
            log::debug!("[UCP] ssid({:08X}) SYNR on extra key({})", header.ssid, chan);
        } else {
            log::debug!("[UCP] key({}) SYNR for unknown ssid({:08X})", chan, header.ssid);
        }
    }

    fn on_session_frame<S: DatagramSender>(
        &mut self,
        chan: Key,
        from: SocketAddr,
        header: &FrameHeader,
        payload: Vec<u8>,
        sender: &mut S,
        now_ms: i64,
    ) {
        let Some(sess) = self.established.get_mut(&header.ssid) else {
            // Unknown session: tell the peer to drop its state.
            if header.cmd != CMD_FIN {
                if let Ok(reply) = encode_frame(header.ssid, header.seq, CMD_FIN, &[]) {
                    let _ = sender.send_frame(chan, from, &reply, false);
                }
            }
            return;
        };
        if sess.inbound {
            sess.add_channel(chan, from);
        }
        sess.last_read_ms = now_ms;
        match header.cmd {
            CMD_HRT => {}
            CMD_DAT | CMD_DATR => {
                if header.seq < sess.next_recv_seq {
                    // Already delivered; make sure the peer hears the
                    // cumulative ack again.
                    sess.force_ack = true;
                    return;
                }
                if sess.recvq.len() >= RECVQ_CAP {
                    return;
                }
                sess.recvq.add(header.seq, payload);
                let drained = sess.recvq.drain_in_order(sess.next_recv_seq);
                if !drained.is_empty() {
                    sess.next_recv_seq += drained.len() as u64;
                    let total: usize = drained.iter().map(Vec::len).sum();
                    let mut data = Vec::with_capacity(total);
                    for part in drained {
                        data.extend_from_slice(&part);
                    }
                    self.events.push(UcpEvent::Data {
                        ssid: header.ssid,
                        data,
                    });
                }
            }
            CMD_ACK => {
                if payload.len() % 8 != 0 {
                    let ssid = header.ssid;
                    self.established.remove(&ssid);
                    if let Ok(reply) = encode_frame(ssid, header.seq, CMD_FIN, &[]) {
                        let _ = sender.send_frame(chan, from, &reply, false);
                    }
                    log::info!("[UCP] ssid({:08X}) malformed ACK, dropping session", ssid);
                    self.events.push(UcpEvent::Disconnected {
                        ssid,
                        reason: UcpDisconnect::Error,
                    });
                    return;
                }
                let extras: Vec<u64> = payload
                    .chunks_exact(8)
                    .map(|c| {
                        u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect();
                sess.sendq
                    .ack_del(header.seq, &extras, &mut sess.peer_max_acked);
            }
            CMD_FIN => {
                let ssid = header.ssid;
                self.established.remove(&ssid);
                log::debug!("[UCP] ssid({:08X}) FIN from peer", ssid);
                self.events.push(UcpEvent::Disconnected {
                    ssid,
                    reason: UcpDisconnect::Fin,
                });
            }
            other => {
                log::debug!("[UCP] ssid({:08X}) unknown cmd {}", header.ssid, other);
            }
        }
    }

    /// Periodic driver; call every few milliseconds. Emits due ACKs,
    /// runs the retransmission pass, tears down exhausted sessions and
    /// sends idle heartbeats.
    pub fn runtime<S: DatagramSender>(&mut self, now_ms: i64, sender: &mut S) {
        if self.last_tick_ms + self.cfg.tick_ms > now_ms && self.last_tick_ms <= now_ms {
            return;
        }
        self.last_tick_ms = now_ms;

        for sess in self.established.values_mut() {
            if let Some(frame) = sess.build_ack() {
                sess.spray(sender, &frame, false);
            }
        }

        let mut dead = Vec::new();
        for sess in self.established.values_mut() {
            let max_retries = sess.resend(now_ms, sender, &self.cfg);
            if max_retries > self.cfg.max_retries {
                dead.push(sess.ssid);
            }
        }
        for ssid in dead {
            self.established.remove(&ssid);
            log::info!("[UCP] ssid({:08X}) retransmit limit, timeout disconnect", ssid);
            self.events.push(UcpEvent::Disconnected {
                ssid,
                reason: UcpDisconnect::Timeout,
            });
        }

        for sess in self.established.values_mut() {
            if now_ms - sess.last_send_ms > crate::config::UCP_HEARTBEAT_MS
                || now_ms < sess.last_send_ms
            {
                if let Ok(frame) = encode_frame(sess.ssid, 0, CMD_HRT, &[]) {
                    sess.spray(sender, &frame, false);
                }
                sess.last_send_ms = now_ms;
            }
        }
    }
}
