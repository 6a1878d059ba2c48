// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! End-to-end HTTP/WS exercises over a loopback socket: a real
//! `HttpServer` on its own thread, a plain `std::net::TcpStream` as
//! the peer.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use ecnet::config::{HttpConfig, ServerConfig};
use ecnet::server::http::HttpServer;
use ecnet::server::ServerEvent;

struct TestServer {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _root: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Spin up a server over a fresh document root; WebSocket messages are
/// echoed back.
fn start_server(files: &[(&str, Vec<u8>)]) -> TestServer {
    let root = tempfile::tempdir().expect("tempdir");
    for (name, data) in files {
        std::fs::write(root.path().join(name), data).expect("write file");
    }
    let http_cfg = HttpConfig {
        doc_root: root.path().to_path_buf(),
        ..Default::default()
    };
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let (port_tx, port_rx) = mpsc::channel();

    let handle = std::thread::spawn(move || {
        let mut srv =
            HttpServer::new(ServerConfig::default(), http_cfg).expect("server should start");
        let lkey = srv.listen(0, None, false).expect("listen");
        let port = srv
            .server()
            .local_addr(lkey)
            .expect("listener address")
            .port();
        port_tx.send(port).expect("report port");

        while !stop2.load(Ordering::Relaxed) {
            for event in srv.runtime(Duration::from_millis(20)) {
                if let ServerEvent::Ws {
                    key,
                    opcode,
                    payload,
                } = event
                {
                    let _ = srv.server().send_ws(key, opcode, &payload);
                }
            }
        }
    });

    let port = port_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server must come up");
    TestServer {
        port,
        stop,
        handle: Some(handle),
        _root: root,
    }
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream
}

/// Read one HTTP response: the header block plus a `Content-Length`
/// body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).expect("read headers");
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let body_len = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse::<usize>().expect("content length"))
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < body_len {
        let n = stream.read(&mut chunk).expect("read body");
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(body_len);
    (head, body)
}

#[test]
fn test_head_large_file_keeps_connection_open() {
    let body = vec![0x42u8; 5 * 1024 * 1024];
    let srv = start_server(&[("big.bin", body)]);
    let mut stream = connect(srv.port);

    stream
        .write_all(b"HEAD /big.bin HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
        .expect("send request");
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert!(head.contains("Accept-Ranges: bytes\r\n"));
    assert!(head.contains("Content-Length: 5242880\r\n"));
    assert!(body.is_empty(), "HEAD carries no body");

    // The connection must still be usable.
    stream
        .write_all(b"HEAD /big.bin HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
        .expect("second request on the same connection");
    let (head2, _) = read_response(&mut stream);
    assert!(head2.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_range_get_exact_bytes() {
    let body: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 249) as u8).collect();
    let srv = start_server(&[("big.bin", body.clone())]);
    let mut stream = connect(srv.port);

    stream
        .write_all(b"GET /big.bin HTTP/1.1\r\nHost: h\r\nRange: bytes=1000-1999\r\n\r\n")
        .expect("send request");
    let (head, got) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{}", head);
    assert!(head.contains("Content-Range: bytes 1000-1999/5242880\r\n"));
    assert!(head.contains("Content-Length: 1000\r\n"));
    assert_eq!(got, &body[1000..2000]);
}

#[test]
fn test_large_range_streams_via_send_job() {
    let body: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    let srv = start_server(&[("big.bin", body.clone())]);
    let mut stream = connect(srv.port);

    stream
        .write_all(b"GET /big.bin HTTP/1.1\r\nHost: h\r\nRange: bytes=0-2097151\r\n\r\n")
        .expect("send request");
    let (head, got) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{}", head);
    assert!(head.contains("Content-Length: 2097152\r\n"));
    assert_eq!(got.len(), 2 * 1024 * 1024);
    assert_eq!(got, &body[..2 * 1024 * 1024]);
}

#[test]
fn test_request_split_across_writes_is_preserved() {
    let srv = start_server(&[("index.html", b"<html>ok</html>".to_vec())]);
    let mut stream = connect(srv.port);

    // Two bytes are below the sniff threshold; the rest arrives later.
    stream.write_all(b"GE").expect("first fragment");
    stream.flush().expect("flush");
    std::thread::sleep(Duration::from_millis(50));
    stream
        .write_all(b"T / HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("second fragment");

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert_eq!(body, b"<html>ok</html>");
}

#[test]
fn test_missing_file_404_and_traversal_guard() {
    let srv = start_server(&[("index.html", b"x".to_vec())]);
    let mut stream = connect(srv.port);
    stream
        .write_all(b"GET /nope.txt HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("send request");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 "), "{}", head);

    stream
        .write_all(b"GET /../secret HTTP/1.1\r\nHost: h\r\n\r\n")
        .expect("send request");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 "), "{}", head);
}

#[test]
fn test_websocket_upgrade_and_echo() {
    let srv = start_server(&[]);
    let mut stream = connect(srv.port);

    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .expect("send handshake");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", head);
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // Masked client text frame "Hello".
    let mask = [0x37, 0xfa, 0x21, 0x3d];
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&mask);
    for (i, b) in b"Hello".iter().enumerate() {
        frame.push(b ^ mask[i % 4]);
    }
    stream.write_all(&frame).expect("send frame");

    // Echo comes back unmasked from the server.
    let mut echo = [0u8; 7];
    stream.read_exact(&mut echo).expect("read echo");
    assert_eq!(&echo, &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
}

#[test]
fn test_fragmented_masked_ws_message() {
    let srv = start_server(&[]);
    let mut stream = connect(srv.port);
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .expect("send handshake");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101 "), "{}", head);

    // "Hello" split over a text start frame and an empty continuation.
    let mask = [0x37, 0xfa, 0x21, 0x3d];
    let mut frame1 = vec![0x01, 0x85];
    frame1.extend_from_slice(&mask);
    for (i, b) in b"Hello".iter().enumerate() {
        frame1.push(b ^ mask[i % 4]);
    }
    let frame2 = [0x80, 0x80, 0x37, 0xfa, 0x21, 0x3d];
    stream.write_all(&frame1).expect("first frame");
    stream.write_all(&frame2).expect("final frame");

    let mut echo = [0u8; 7];
    stream.read_exact(&mut echo).expect("read echo");
    assert_eq!(&echo[2..], b"Hello");
}

#[test]
fn test_bad_method_gets_400() {
    let srv = start_server(&[("index.html", b"x".to_vec())]);
    let mut stream = connect(srv.port);
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nhi")
        .expect("send request");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 "), "{}", head);
}
