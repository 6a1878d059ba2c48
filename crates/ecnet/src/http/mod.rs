// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! HTTP/1.1 request objects and response assembly.
//!
//! Parsing is incremental over the session parse buffer: a request is
//! surfaced only once its header block and any `Content-Length` entity
//! are fully buffered.

pub mod files;

use crate::error::{Error, Result};

/// Maximum header count accepted per request.
const MAX_HEADERS: usize = 64;

/// Parsed request: method, URL, header list, entity.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub entity: Vec<u8>,
    /// HTTP/1.x minor version.
    pub version: u8,
}

impl Request {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_method(&self, m: &str) -> bool {
        self.method.eq_ignore_ascii_case(m)
    }

    /// Keep-alive intent: explicit `Connection` wins, HTTP/1.1 defaults
    /// to keep-alive.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.to_ascii_lowercase().contains("keep-alive") => true,
            Some(_) | None => self.version >= 1,
        }
    }

    pub fn accepts_gzip(&self) -> bool {
        self.header("Accept-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false)
    }

    /// `Sec-WebSocket-Key` when this is a WebSocket upgrade request.
    pub fn websocket_key(&self) -> Option<&str> {
        let upgrading = self
            .header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if upgrading {
            self.header("Sec-WebSocket-Key")
        } else {
            None
        }
    }
}

/// Try to parse one request from `buf`.
///
/// - `Ok(Some((request, consumed)))`: complete request;
/// - `Ok(None)`: need more bytes;
/// - `Err(_)`: malformed input, the session must die.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::Protocol(format!("http parse: {}", e))),
    };

    let method = req.method.unwrap_or("").to_string();
    let url = req.path.unwrap_or("").to_string();
    let version = req.version.unwrap_or(0);
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > crate::config::HTTP_DOWNFILE_MAX {
        return Err(Error::Protocol("entity too large".into()));
    }
    let total = header_len + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((
        Request {
            method,
            url,
            headers,
            entity: buf[header_len..total].to_vec(),
            version,
        },
        total,
    )))
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub(crate) const SERVER_NAME: &str = "eclib web server";

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        413 => "Payload Too Large",
        _ => "Error",
    }
}

/// Response under construction.
pub struct ResponseBuilder {
    head: String,
}

impl ResponseBuilder {
    pub fn new(status: u16, keep_alive: bool) -> Self {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nServer: {}\r\n",
            status,
            reason(status),
            SERVER_NAME
        );
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        Self { head }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.head.push_str(name);
        self.head.push_str(": ");
        self.head.push_str(value);
        self.head.push_str("\r\n");
        self
    }

    /// Finish with a body already counted by the caller.
    pub fn body(self, body: &[u8]) -> Vec<u8> {
        let mut out = self.head.into_bytes();
        let mut len_line = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        out.append(&mut len_line);
        out.extend_from_slice(body);
        out
    }

    /// Finish with an explicit `Content-Length` but no inline body (the
    /// body follows separately, e.g. via a rolled send job or HEAD).
    pub fn content_length_only(self, len: u64) -> Vec<u8> {
        let mut out = self.head.into_bytes();
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", len).as_bytes());
        out
    }
}

/// Plain status response with an empty body.
pub fn status_response(status: u16, keep_alive: bool) -> Vec<u8> {
    ResponseBuilder::new(status, keep_alive).body(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let raw = b"GET /a/b?x=1 HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n";
        let (req, used) = parse_request(raw).expect("valid").expect("complete");
        assert_eq!(used, raw.len());
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/a/b?x=1");
        assert_eq!(req.header("host"), Some("h"));
        assert!(req.keep_alive());
        assert!(req.entity.is_empty());
    }

    #[test]
    fn test_parse_partial() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(parse_request(raw).expect("no error").is_none());
    }

    #[test]
    fn test_parse_entity_waits_for_body() {
        let raw = b"POST /p HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        assert!(parse_request(raw).expect("no error").is_none());

        let full = b"POST /p HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd";
        let (req, used) = parse_request(full).expect("valid").expect("complete");
        assert_eq!(used, full.len());
        assert_eq!(req.entity, b"abcd");
    }

    #[test]
    fn test_parse_malformed_is_error() {
        let raw = b"\x16\x03\x01 nonsense\r\n\r\n";
        assert!(parse_request(raw).is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let parse = |s: &str| {
            parse_request(s.as_bytes())
                .expect("valid")
                .expect("complete")
                .0
        };
        assert!(parse("GET / HTTP/1.1\r\nHost: h\r\n\r\n").keep_alive());
        assert!(!parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!parse("GET / HTTP/1.0\r\nHost: h\r\n\r\n").keep_alive());
        assert!(parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").keep_alive());
    }

    #[test]
    fn test_websocket_key_requires_upgrade_header() {
        let parse = |s: &str| {
            parse_request(s.as_bytes())
                .expect("valid")
                .expect("complete")
                .0
        };
        let up = parse(
            "GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: abc\r\n\r\n",
        );
        assert_eq!(up.websocket_key(), Some("abc"));
        let plain = parse("GET /chat HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n");
        assert_eq!(plain.websocket_key(), None);
    }

    #[test]
    fn test_response_builder() {
        let resp = ResponseBuilder::new(200, true)
            .header("Accept-Ranges", "bytes")
            .body(b"hi");
        let text = String::from_utf8_lossy(&resp);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: eclib web server\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Content-Length: 2\r\n\r\nhi"));
    }

    #[test]
    fn test_status_response_close() {
        let resp = status_response(404, false);
        let text = String::from_utf8_lossy(&resp);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }
}
