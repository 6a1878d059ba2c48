// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! WebSocket framing and DEFLATE engine (RFC 6455 / RFC 7692).
//!
//! The decoder assembles fragmented, possibly masked, possibly
//! compressed frames into messages; the encoder splits messages into
//! frames of at most 62 KiB with optional per-message or per-frame
//! DEFLATE. Both deflate variants use sync-flush raw DEFLATE: the
//! 4-byte `00 00 ff ff` flush terminator is stripped on encode and
//! re-appended before inflate.
//!
//! Caps: a single inbound frame payload may not exceed 4 MiB and an
//! assembled message may not exceed 32 MiB; violations are protocol
//! errors that kill the connection.

use base64::Engine;
use flate2::{Compress, Compression as DeflateLevel, Decompress, FlushCompress, FlushDecompress};
use sha1::{Digest, Sha1};

use crate::config::{
    WS_COMPRESS_MIN, WS_FRAME_COMPRESS_MIN, WS_FRAME_IN_MAX, WS_FRAME_OUT_SIZE, WS_MESSAGE_MAX,
};
use crate::error::{Error, Result};

pub const OP_CONTINUE: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const MASK_BIT: u8 = 0x80;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Negotiated compression extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsCompression {
    #[default]
    None,
    /// `permessage-deflate` (whole-message DEFLATE, RFC 7692).
    PerMessage,
    /// `x-webkit-deflate-frame` (per-frame DEFLATE, legacy Safari).
    DeflateFrame,
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Pick the first supported extension from a `Sec-WebSocket-Extensions`
/// header. Returns the negotiated mode and the exact response value.
pub fn negotiate_extension(header: &str) -> (WsCompression, Option<&'static str>) {
    for token in header.split([';', ',']).map(str::trim) {
        if token.eq_ignore_ascii_case("permessage-deflate") {
            return (
                WsCompression::PerMessage,
                Some("permessage-deflate; server_no_context_takeover; client_no_context_takeover"),
            );
        }
        if token.eq_ignore_ascii_case("x-webkit-deflate-frame") {
            return (
                WsCompression::DeflateFrame,
                Some("x-webkit-deflate-frame; no_context_takeover"),
            );
        }
    }
    (WsCompression::None, None)
}

// ---------------------------------------------------------------------------
// DEFLATE helpers
// ---------------------------------------------------------------------------

/// Raw DEFLATE with a sync flush; output ends with `00 00 ff ff`.
fn deflate_sync(src: &[u8]) -> Result<Vec<u8>> {
    let mut enc = Compress::new(DeflateLevel::default(), false);
    let mut out = Vec::with_capacity(src.len() / 2 + 64);
    loop {
        out.reserve(16 * 1024);
        let consumed_before = enc.total_in() as usize;
        enc.compress_vec(&src[consumed_before..], &mut out, FlushCompress::Sync)
            .map_err(|e| Error::Protocol(format!("deflate: {}", e)))?;
        // A sync flush is complete once all input is consumed and the
        // last call left spare output room.
        if enc.total_in() as usize == src.len() && out.len() < out.capacity() {
            break;
        }
    }
    Ok(out)
}

/// Inflate a raw DEFLATE stream whose `00 00 ff ff` terminator was
/// stripped; `cap` bounds the decompressed size.
fn inflate_sync(src: &[u8], cap: usize) -> Result<Vec<u8>> {
    let mut input = Vec::with_capacity(src.len() + DEFLATE_TAIL.len());
    input.extend_from_slice(src);
    input.extend_from_slice(&DEFLATE_TAIL);

    let mut dec = Decompress::new(false);
    let mut out = Vec::with_capacity(src.len() * 3 + 64);
    loop {
        if out.len() > cap {
            return Err(Error::Protocol("inflated message exceeds cap".into()));
        }
        out.reserve(16 * 1024);
        let consumed_before = dec.total_in() as usize;
        dec.decompress_vec(&input[consumed_before..], &mut out, FlushDecompress::Sync)
            .map_err(|e| Error::Protocol(format!("inflate: {}", e)))?;
        if dec.total_in() as usize == input.len() && out.len() < out.capacity() {
            break;
        }
    }
    if out.len() > cap {
        return Err(Error::Protocol("inflated message exceeds cap".into()));
    }
    Ok(out)
}

fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i & 3];
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// One step of [`MessageAssembler::parse`].
#[derive(Debug, PartialEq, Eq)]
pub enum WsParse {
    /// More bytes are needed before any frame completes.
    NeedMore,
    /// A complete data message for the application.
    Message { opcode: u8, payload: Vec<u8> },
    /// A control frame was consumed. `reply` holds a ready-encoded PONG
    /// when the frame was a PING; PONG and CLOSE are swallowed.
    Control { reply: Option<Vec<u8>> },
}

/// Stateful frame-to-message assembler for one session.
#[derive(Default)]
pub struct MessageAssembler {
    compression: WsCompression,
    /// Scratch message buffer. For an in-progress permessage-deflate
    /// message this holds the still-compressed bytes.
    msg: Vec<u8>,
    /// RSV1 seen on the current permessage-deflate message.
    compressed: bool,
    opcode: u8,
    /// Control-frame payload scratch, kept outside the fragment buffer
    /// so an interleaved PING never corrupts a message in progress.
    ctrl_payload: Vec<u8>,
}

impl MessageAssembler {
    pub fn new(compression: WsCompression) -> Self {
        Self {
            compression,
            ..Default::default()
        }
    }

    pub fn set_compression(&mut self, compression: WsCompression) {
        self.compression = compression;
    }

    /// A partial message is buffered iff this is non-zero.
    pub fn pending_len(&self) -> usize {
        self.msg.len()
    }

    fn reset_msg(&mut self) {
        self.msg = Vec::new();
        self.compressed = false;
        self.opcode = OP_TEXT;
    }

    /// Consume frames from `buf`.
    ///
    /// Returns the number of bytes consumed and the outcome. The caller
    /// drops the consumed prefix from its parse buffer and calls again
    /// while progress is made.
    pub fn parse(&mut self, buf: &[u8]) -> (usize, Result<WsParse>) {
        let mut done = 0usize;
        while done < buf.len() {
            match self.parse_one(&buf[done..]) {
                Err(e) => return (done, Err(e)),
                Ok(None) => break,
                Ok(Some((used, fin, control))) => {
                    done += used;
                    if let Some(op) = control {
                        return (done, Ok(self.finish_control(op)));
                    }
                    if fin {
                        return (done, self.finish_message());
                    }
                }
            }
        }
        (done, Ok(WsParse::NeedMore))
    }

    /// Parse one frame header+payload if fully buffered.
    ///
    /// `Ok(Some((consumed, fin, control_opcode)))` when a frame was
    /// consumed; data-frame payloads are folded into the message buffer,
    /// control payloads replace it temporarily via `ctrl` return.
    fn parse_one(&mut self, buf: &[u8]) -> Result<Option<(usize, bool, Option<u8>)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & FIN_BIT != 0;
        let rsv1 = buf[0] & RSV1_BIT != 0;
        let opcode = buf[0] & 0x0f;
        let masked = buf[1] & MASK_BIT != 0;
        let len7 = (buf[1] & 0x7f) as usize;

        let mut pos = 2usize;
        let payload_len = match len7 {
            126 => {
                if buf.len() < pos + 2 {
                    return Ok(None);
                }
                let n = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
                pos += 2;
                n
            }
            127 => {
                if buf.len() < pos + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[pos..pos + 8]);
                pos += 8;
                let n = u64::from_be_bytes(raw);
                usize::try_from(n)
                    .map_err(|_| Error::Protocol("frame length overflow".into()))?
            }
            n => n,
        };

        let mask = if masked {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            let mut m = [0u8; 4];
            m.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            Some(m)
        } else {
            None
        };

        if payload_len > WS_FRAME_IN_MAX {
            return Err(Error::Protocol(format!(
                "ws frame payload {} exceeds cap",
                payload_len
            )));
        }
        if self.msg.len() + payload_len > WS_MESSAGE_MAX {
            return Err(Error::Protocol("ws message exceeds cap".into()));
        }
        if buf.len() < pos + payload_len {
            return Ok(None);
        }

        let mut payload = buf[pos..pos + payload_len].to_vec();
        if let Some(m) = mask {
            apply_mask(&mut payload, m);
        }

        if opcode >= OP_CLOSE {
            // Control frames are single-frame and never enter the
            // fragment buffer.
            if !fin {
                return Err(Error::Protocol("fragmented control frame".into()));
            }
            self.ctrl_payload = payload;
            return Ok(Some((pos + payload_len, true, Some(opcode))));
        }

        if self.msg.is_empty() && !self.compressed {
            if opcode == OP_CONTINUE {
                return Err(Error::Protocol("continuation without start frame".into()));
            }
            self.opcode = opcode;
        } else if opcode != OP_CONTINUE {
            return Err(Error::Protocol("expected continuation frame".into()));
        }

        if rsv1 {
            match self.compression {
                WsCompression::DeflateFrame => {
                    let inflated = inflate_sync(&payload, WS_MESSAGE_MAX - self.msg.len())?;
                    self.msg.extend_from_slice(&inflated);
                }
                WsCompression::PerMessage => {
                    // Buffer compressed; defer inflation to end-of-message.
                    self.compressed = true;
                    self.msg.clear();
                    self.msg.extend_from_slice(&payload);
                }
                WsCompression::None => {
                    return Err(Error::Protocol("RSV1 set without negotiated extension".into()))
                }
            }
        } else {
            self.msg.extend_from_slice(&payload);
        }

        Ok(Some((pos + payload_len, fin, None)))
    }

    fn finish_message(&mut self) -> Result<WsParse> {
        let payload = if self.compressed && self.compression == WsCompression::PerMessage {
            inflate_sync(&self.msg, WS_MESSAGE_MAX)?
        } else {
            std::mem::take(&mut self.msg)
        };
        let opcode = self.opcode;
        self.reset_msg();
        Ok(WsParse::Message { opcode, payload })
    }

    fn finish_control(&mut self, opcode: u8) -> WsParse {
        let payload = std::mem::take(&mut self.ctrl_payload);
        match opcode {
            OP_PING => {
                let mut reply = Vec::with_capacity(payload.len() + 4);
                // PONG replies are never compressed or masked.
                let _ = encode_message(OP_PONG, &payload, WsCompression::None, None, &mut reply);
                WsParse::Control { reply: Some(reply) }
            }
            // PONG and CLOSE are accepted silently; no CLOSE reply is
            // sent (see DESIGN.md).
            _ => WsParse::Control { reply: None },
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encode a message into one or more frames with the default
/// compression threshold.
pub fn encode_message(
    opcode: u8,
    payload: &[u8],
    compression: WsCompression,
    mask: Option<[u8; 4]>,
    out: &mut Vec<u8>,
) -> Result<()> {
    encode_message_opts(opcode, payload, compression, mask, WS_COMPRESS_MIN, out)
}

/// Encode with an explicit per-message compression threshold.
pub fn encode_message_opts(
    opcode: u8,
    payload: &[u8],
    compression: WsCompression,
    mask: Option<[u8; 4]>,
    compress_min: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    match compression {
        WsCompression::PerMessage if payload.len() >= compress_min => {
            let mut deflated = deflate_sync(payload)?;
            deflated.truncate(deflated.len().saturating_sub(DEFLATE_TAIL.len()));
            write_frames(opcode, &deflated, true, mask, out);
            Ok(())
        }
        WsCompression::DeflateFrame => encode_deflate_frame(opcode, payload, mask, out),
        _ => {
            write_frames(opcode, payload, false, mask, out);
            Ok(())
        }
    }
}

/// Split into frames; `rsv1_first` marks the first frame compressed.
fn write_frames(opcode: u8, data: &[u8], rsv1_first: bool, mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    let mut off = 0usize;
    loop {
        let chunk = (data.len() - off).min(WS_FRAME_OUT_SIZE);
        let first = off == 0;
        let last = off + chunk >= data.len();
        let mut b0 = if first { opcode } else { OP_CONTINUE };
        if first && rsv1_first {
            b0 |= RSV1_BIT;
        }
        if last {
            b0 |= FIN_BIT;
        }
        write_one_frame(b0, &data[off..off + chunk], mask, out);
        off += chunk;
        if last {
            break;
        }
    }
}

/// x-webkit-deflate-frame: each frame compressed independently.
fn encode_deflate_frame(
    opcode: u8,
    data: &[u8],
    mask: Option<[u8; 4]>,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut off = 0usize;
    loop {
        let chunk = (data.len() - off).min(WS_FRAME_OUT_SIZE);
        let first = off == 0;
        let last = off + chunk >= data.len();
        let compress = chunk > WS_FRAME_COMPRESS_MIN;
        let mut b0 = if first { opcode } else { OP_CONTINUE };
        if compress {
            b0 |= RSV1_BIT;
        }
        if last {
            b0 |= FIN_BIT;
        }
        if compress {
            let mut deflated = deflate_sync(&data[off..off + chunk])?;
            deflated.truncate(deflated.len().saturating_sub(DEFLATE_TAIL.len()));
            write_one_frame(b0, &deflated, mask, out);
        } else {
            write_one_frame(b0, &data[off..off + chunk], mask, out);
        }
        off += chunk;
        if last {
            break;
        }
    }
    Ok(())
}

fn write_one_frame(b0: u8, payload: &[u8], mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    out.push(b0);
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if payload.len() < 126 {
        out.push(payload.len() as u8 | mask_bit);
    } else {
        // Outbound frames are capped at 62 KiB, so the 16-bit form
        // always suffices.
        out.push(126 | mask_bit);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    match mask {
        Some(m) => {
            out.extend_from_slice(&m);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], m);
        }
        None => out.extend_from_slice(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(asm: &mut MessageAssembler, mut wire: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut msgs = Vec::new();
        loop {
            let (used, outcome) = asm.parse(wire);
            wire = &wire[used..];
            match outcome.expect("parse should succeed") {
                WsParse::NeedMore => break,
                WsParse::Message { opcode, payload } => msgs.push((opcode, payload)),
                WsParse::Control { .. } => {}
            }
            if wire.is_empty() {
                break;
            }
        }
        msgs
    }

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_negotiate_prefers_first_supported() {
        let (mode, reply) = negotiate_extension("permessage-deflate; client_max_window_bits");
        assert_eq!(mode, WsCompression::PerMessage);
        assert_eq!(
            reply,
            Some("permessage-deflate; server_no_context_takeover; client_no_context_takeover")
        );

        let (mode, reply) = negotiate_extension("x-webkit-deflate-frame");
        assert_eq!(mode, WsCompression::DeflateFrame);
        assert_eq!(reply, Some("x-webkit-deflate-frame; no_context_takeover"));

        let (mode, reply) = negotiate_extension("mux; foo");
        assert_eq!(mode, WsCompression::None);
        assert!(reply.is_none());
    }

    #[test]
    fn test_fragmented_masked_text() {
        // Two client frames carrying "Hello": text start without FIN,
        // then an empty FIN continuation. Mask 37 fa 21 3d.
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut frame1 = vec![0x01, 0x85];
        frame1.extend_from_slice(&mask);
        let mut masked: Vec<u8> = b"Hello".to_vec();
        apply_mask(&mut masked, mask);
        frame1.extend_from_slice(&masked);
        let frame2 = vec![0x80, 0x80, 0x37, 0xfa, 0x21, 0x3d];

        let mut asm = MessageAssembler::new(WsCompression::None);
        let mut wire = frame1;
        wire.extend_from_slice(&frame2);
        let msgs = decode_all(&mut asm, &wire);
        assert_eq!(msgs, vec![(OP_TEXT, b"Hello".to_vec())]);
        assert_eq!(asm.pending_len(), 0);
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let mut asm = MessageAssembler::new(WsCompression::None);
        let mut wire = Vec::new();
        encode_message(OP_BINARY, &[1, 2, 3, 4], WsCompression::None, None, &mut wire)
            .expect("encode");
        let (used, outcome) = asm.parse(&wire[..3]);
        assert_eq!(used, 0);
        assert_eq!(outcome.expect("parse"), WsParse::NeedMore);

        let msgs = decode_all(&mut asm, &wire);
        assert_eq!(msgs, vec![(OP_BINARY, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_permessage_deflate_round_trip() {
        let mut wire = Vec::new();
        encode_message_opts(
            OP_TEXT,
            b"Hello",
            WsCompression::PerMessage,
            None,
            0,
            &mut wire,
        )
        .expect("encode");
        // RSV1 set on the first (only) frame; payload is the raw
        // DEFLATE block with the 00 00 ff ff tail stripped.
        assert_eq!(wire[0] & 0x40, 0x40);
        assert!(!wire.ends_with(&[0x00, 0x00, 0xff, 0xff]));

        let mut asm = MessageAssembler::new(WsCompression::PerMessage);
        let msgs = decode_all(&mut asm, &wire);
        assert_eq!(msgs, vec![(OP_TEXT, b"Hello".to_vec())]);
    }

    #[test]
    fn test_permessage_below_threshold_uncompressed() {
        let mut wire = Vec::new();
        encode_message(OP_TEXT, b"tiny", WsCompression::PerMessage, None, &mut wire)
            .expect("encode");
        assert_eq!(wire[0] & 0x40, 0, "below 128 bytes stays uncompressed");
        assert_eq!(&wire[2..], b"tiny");
    }

    #[test]
    fn test_round_trip_large_multiframe() {
        let payload: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
        for compression in [
            WsCompression::None,
            WsCompression::PerMessage,
            WsCompression::DeflateFrame,
        ] {
            let mut wire = Vec::new();
            encode_message(OP_BINARY, &payload, compression, None, &mut wire).expect("encode");
            let mut asm = MessageAssembler::new(compression);
            let msgs = decode_all(&mut asm, &wire);
            assert_eq!(msgs.len(), 1, "{:?}", compression);
            assert_eq!(msgs[0].0, OP_BINARY);
            assert_eq!(msgs[0].1, payload, "{:?}", compression);
        }
    }

    #[test]
    fn test_round_trip_masked_client_frames() {
        let payload: Vec<u8> = (0..70_000usize).map(|i| (i % 253) as u8).collect();
        for compression in [
            WsCompression::None,
            WsCompression::PerMessage,
            WsCompression::DeflateFrame,
        ] {
            let mut wire = Vec::new();
            encode_message(
                OP_BINARY,
                &payload,
                compression,
                Some([0xde, 0xad, 0xbe, 0xef]),
                &mut wire,
            )
            .expect("encode");
            let mut asm = MessageAssembler::new(compression);
            let msgs = decode_all(&mut asm, &wire);
            assert_eq!(msgs, vec![(OP_BINARY, payload.clone())], "{:?}", compression);
        }
    }

    #[test]
    fn test_empty_message_round_trip() {
        let mut wire = Vec::new();
        encode_message(OP_TEXT, b"", WsCompression::None, None, &mut wire).expect("encode");
        assert_eq!(wire, vec![0x81, 0x00]);
        let mut asm = MessageAssembler::new(WsCompression::None);
        let msgs = decode_all(&mut asm, &wire);
        assert_eq!(msgs, vec![(OP_TEXT, Vec::new())]);
    }

    #[test]
    fn test_ping_yields_pong_reply() {
        let mut wire = Vec::new();
        encode_message(OP_PING, b"probe", WsCompression::None, None, &mut wire).expect("encode");
        let mut asm = MessageAssembler::new(WsCompression::None);
        let (used, outcome) = asm.parse(&wire);
        assert_eq!(used, wire.len());
        match outcome.expect("parse") {
            WsParse::Control { reply: Some(pong) } => {
                assert_eq!(pong[0], FIN_BIT | OP_PONG);
                assert_eq!(&pong[2..], b"probe");
            }
            other => panic!("expected pong reply, got {:?}", other),
        }
    }

    #[test]
    fn test_close_and_pong_swallowed() {
        for op in [OP_CLOSE, OP_PONG] {
            let mut wire = Vec::new();
            encode_message(op, b"", WsCompression::None, None, &mut wire).expect("encode");
            let mut asm = MessageAssembler::new(WsCompression::None);
            let (_, outcome) = asm.parse(&wire);
            assert_eq!(outcome.expect("parse"), WsParse::Control { reply: None });
        }
    }

    #[test]
    fn test_interleaved_ping_keeps_fragments() {
        // start fragment, then PING, then final fragment
        let mut wire = vec![0x01, 0x02, b'h', b'i'];
        wire.extend_from_slice(&[FIN_BIT | OP_PING, 0x00]);
        wire.extend_from_slice(&[FIN_BIT | OP_CONTINUE, 0x01, b'!']);

        let mut asm = MessageAssembler::new(WsCompression::None);
        let mut rest = &wire[..];
        let mut got = Vec::new();
        loop {
            let (used, outcome) = asm.parse(rest);
            rest = &rest[used..];
            match outcome.expect("parse") {
                WsParse::Message { payload, .. } => {
                    got = payload;
                    break;
                }
                WsParse::Control { .. } | WsParse::NeedMore => {
                    if rest.is_empty() {
                        break;
                    }
                }
            }
        }
        assert_eq!(got, b"hi!");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut wire = vec![FIN_BIT | OP_BINARY, 127];
        wire.extend_from_slice(&(5u64 * 1024 * 1024).to_be_bytes());
        let mut asm = MessageAssembler::new(WsCompression::None);
        let (_, outcome) = asm.parse(&wire);
        assert!(outcome.is_err(), "frame above 4 MiB must be rejected");
    }

    #[test]
    fn test_unexpected_continuation_rejected() {
        let wire = [FIN_BIT | OP_CONTINUE, 0x01, b'x'];
        let mut asm = MessageAssembler::new(WsCompression::None);
        let (_, outcome) = asm.parse(&wire);
        assert!(outcome.is_err());
    }

    #[test]
    fn test_scratch_empty_iff_no_partial_frame() {
        let mut asm = MessageAssembler::new(WsCompression::None);
        assert_eq!(asm.pending_len(), 0);
        let start = [0x01, 0x03, b'a', b'b', b'c'];
        let (used, outcome) = asm.parse(&start);
        assert_eq!(used, start.len());
        assert_eq!(outcome.expect("parse"), WsParse::NeedMore);
        assert_eq!(asm.pending_len(), 3, "partial message buffered");
    }
}
