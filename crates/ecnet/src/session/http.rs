// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! HTTP/WebSocket session state machine.
//!
//! A session enters here tagged HTTP (or HTTPS) and mutates in place to
//! WS (or WSS) when a valid upgrade request arrives. Before the upgrade
//! the parse buffer yields HTTP requests; after it, WebSocket messages.

use crate::error::Result;
use crate::http::{parse_request, Request};
use crate::ws::{
    accept_key, encode_message, negotiate_extension, MessageAssembler, WsCompression, WsParse,
};

/// One step of [`HttpState::read`].
pub enum HttpRead {
    /// Need more bytes.
    NeedMore,
    /// Complete HTTP request (not an upgrade).
    Request(Request),
    /// Complete WebSocket data message.
    WsMessage { opcode: u8, payload: Vec<u8> },
    /// Bytes the session must queue for sending (PONG, 400 on a bad
    /// upgrade) without surfacing anything to the application.
    Reply(Vec<u8>),
    /// WebSocket handshake succeeded; the response bytes must be sent
    /// and the session's protocol tag flips to WS/WSS.
    Upgraded(Vec<u8>),
}

/// Per-session HTTP/WS protocol state.
pub struct HttpState {
    ws: bool,
    compression: WsCompression,
    assembler: MessageAssembler,
}

impl Default for HttpState {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpState {
    pub fn new() -> Self {
        Self {
            ws: false,
            compression: WsCompression::None,
            assembler: MessageAssembler::new(WsCompression::None),
        }
    }

    /// Whether the WebSocket upgrade has completed.
    pub fn is_ws(&self) -> bool {
        self.ws
    }

    pub fn compression(&self) -> WsCompression {
        self.compression
    }

    /// Consume from the session parse buffer.
    ///
    /// Returns bytes consumed plus the outcome; the caller drops the
    /// consumed prefix and calls again while progress is made.
    pub fn read(&mut self, key: i32, buf: &[u8]) -> (usize, Result<HttpRead>) {
        if self.ws {
            let mut total = 0usize;
            loop {
                let (used, outcome) = self.assembler.parse(&buf[total..]);
                total += used;
                let read = match outcome {
                    Err(e) => return (total, Err(e)),
                    Ok(WsParse::NeedMore) => HttpRead::NeedMore,
                    Ok(WsParse::Message { opcode, payload }) => {
                        HttpRead::WsMessage { opcode, payload }
                    }
                    Ok(WsParse::Control { reply: Some(pong) }) => HttpRead::Reply(pong),
                    // Swallowed control frame (PONG/CLOSE): keep going,
                    // later frames may already be buffered.
                    Ok(WsParse::Control { reply: None }) => continue,
                };
                return (total, Ok(read));
            }
        }

        match parse_request(buf) {
            Err(e) => (0, Err(e)),
            Ok(None) => (0, Ok(HttpRead::NeedMore)),
            Ok(Some((req, used))) => {
                if req.is_method("GET") {
                    if let Some(ws_key) = req.websocket_key() {
                        let ws_key = ws_key.to_string();
                        return (used, self.upgrade_websocket(key, &ws_key, &req));
                    }
                }
                (used, Ok(HttpRead::Request(req)))
            }
        }
    }

    /// Handle a WebSocket upgrade request (server side).
    fn upgrade_websocket(&mut self, key: i32, ws_key: &str, req: &Request) -> Result<HttpRead> {
        let version_ok = req
            .header("Sec-WebSocket-Version")
            .map(|v| v.trim() == "13")
            .unwrap_or(false);
        if !version_ok {
            log::info!("[WS] ucid({}) upgrade refused, version != 13", key);
            let resp = b"HTTP/1.1 400 Bad Request\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n";
            return Ok(HttpRead::Reply(resp.to_vec()));
        }

        let mut resp = String::with_capacity(256);
        resp.push_str("HTTP/1.1 101 Switching Protocols\r\n");
        resp.push_str("Upgrade: websocket\r\n");
        resp.push_str("Connection: Upgrade\r\n");
        resp.push_str("Sec-WebSocket-Accept: ");
        resp.push_str(&accept_key(ws_key));
        resp.push_str("\r\n");
        if let Some(proto) = req.header("Sec-WebSocket-Protocol") {
            resp.push_str("Sec-WebSocket-Protocol: ");
            resp.push_str(proto);
            resp.push_str("\r\n");
        }
        self.compression = WsCompression::None;
        if let Some(exts) = req.header("Sec-WebSocket-Extensions") {
            let (mode, answer) = negotiate_extension(exts);
            if let Some(line) = answer {
                resp.push_str("Sec-WebSocket-Extensions: ");
                resp.push_str(line);
                resp.push_str("\r\n");
            }
            self.compression = mode;
        }
        resp.push_str("\r\n");

        self.ws = true;
        self.assembler.set_compression(self.compression);
        log::info!(
            "[WS] ucid({}) upgrade success, compression {:?}",
            key,
            self.compression
        );
        Ok(HttpRead::Upgraded(resp.into_bytes()))
    }

    /// Encode application bytes for sending: WebSocket frames after the
    /// upgrade, passthrough before it.
    pub fn encode_send(&self, opcode: u8, data: &[u8], mask: Option<[u8; 4]>) -> Result<Vec<u8>> {
        if !self.ws {
            return Ok(data.to_vec());
        }
        let mut out = Vec::with_capacity(data.len() + 16);
        encode_message(opcode, data, self.compression, mask, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::OP_TEXT;

    fn feed(state: &mut HttpState, mut buf: &[u8]) -> Vec<HttpRead> {
        let mut out = Vec::new();
        loop {
            let (used, outcome) = state.read(7, buf);
            buf = &buf[used..];
            match outcome.expect("read should succeed") {
                HttpRead::NeedMore => break,
                other => out.push(other),
            }
            if buf.is_empty() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_plain_request_passthrough() {
        let mut st = HttpState::new();
        let got = feed(&mut st, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(got.len(), 1);
        match &got[0] {
            HttpRead::Request(req) => assert_eq!(req.url, "/x"),
            _ => panic!("expected request"),
        }
        assert!(!st.is_ws());
    }

    #[test]
    fn test_upgrade_rfc_accept_key() {
        let mut st = HttpState::new();
        let raw = "GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let got = feed(&mut st, raw.as_bytes());
        assert_eq!(got.len(), 1);
        match &got[0] {
            HttpRead::Upgraded(resp) => {
                let text = String::from_utf8_lossy(resp);
                assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
                assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
            }
            _ => panic!("expected upgrade"),
        }
        assert!(st.is_ws());
        assert_eq!(st.compression(), WsCompression::None);
    }

    #[test]
    fn test_upgrade_negotiates_permessage_deflate() {
        let mut st = HttpState::new();
        let raw = "GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\r\n";
        let got = feed(&mut st, raw.as_bytes());
        match &got[0] {
            HttpRead::Upgraded(resp) => {
                let text = String::from_utf8_lossy(resp);
                assert!(text.contains(
                    "Sec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover; client_no_context_takeover\r\n"
                ));
            }
            _ => panic!("expected upgrade"),
        }
        assert_eq!(st.compression(), WsCompression::PerMessage);
    }

    #[test]
    fn test_bad_version_gets_400_not_upgrade() {
        let mut st = HttpState::new();
        let raw = "GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 8\r\n\r\n";
        let got = feed(&mut st, raw.as_bytes());
        match &got[0] {
            HttpRead::Reply(resp) => {
                assert!(String::from_utf8_lossy(resp).starts_with("HTTP/1.1 400 "));
            }
            _ => panic!("expected 400 reply"),
        }
        assert!(!st.is_ws());
    }

    #[test]
    fn test_ws_messages_after_upgrade() {
        let mut st = HttpState::new();
        let raw = "GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let _ = feed(&mut st, raw.as_bytes());
        assert!(st.is_ws());

        // Client-masked text frame "hi".
        let mut frame = vec![0x81, 0x82, 1, 2, 3, 4];
        frame.extend_from_slice(&[b'h' ^ 1, b'i' ^ 2]);
        let got = feed(&mut st, &frame);
        assert_eq!(got.len(), 1);
        match &got[0] {
            HttpRead::WsMessage { opcode, payload } => {
                assert_eq!(*opcode, OP_TEXT);
                assert_eq!(payload, b"hi");
            }
            _ => panic!("expected ws message"),
        }
    }

    #[test]
    fn test_encode_send_frames_after_upgrade() {
        let mut st = HttpState::new();
        assert_eq!(
            st.encode_send(OP_TEXT, b"raw", None).expect("encode"),
            b"raw".to_vec(),
            "passthrough before upgrade"
        );
        let raw = "GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let _ = feed(&mut st, raw.as_bytes());
        let framed = st.encode_send(OP_TEXT, b"msg", None).expect("encode");
        assert_eq!(framed, vec![0x81, 0x03, b'm', b's', b'g']);
    }
}
