// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! # ecnet: asynchronous server networking stack
//!
//! A single-threaded, readiness-driven server stack composing a
//! platform multiplexer with a layered session pipeline: plain TCP,
//! TLS 1.2, HTTP/1.1 with range-GET file serving, and RFC 6455
//! WebSocket with permessage-deflate and x-webkit-deflate-frame. A
//! parallel engine, UCP, provides reliable in-order datagram sessions
//! over UDP with selective acknowledgement, fast retransmit and
//! multi-channel spray.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ecnet::config::{HttpConfig, ServerConfig};
//! use ecnet::server::http::HttpServer;
//!
//! fn main() -> ecnet::Result<()> {
//!     let http = HttpConfig {
//!         doc_root: "/var/www".into(),
//!         ..Default::default()
//!     };
//!     let mut srv = HttpServer::new(ServerConfig::default(), http)?;
//!     srv.listen(8080, None, false)?;
//!     loop {
//!         for event in srv.runtime(Duration::from_millis(100)) {
//!             // WebSocket messages, connects, disconnects...
//!             let _ = event;
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Application layer                       |
//! |        event list <- runtime() | send()/close_key()          |
//! +--------------------------------------------------------------+
//! |  EventServer: session table, upgrade chain, attack grace,    |
//! |  read budgets, send-buffer drain, file send jobs             |
//! +--------------------------------------------------------------+
//! |  Sessions: TCP -> TLS -> HTTP(S) -> WS(S)   |  UCP engine    |
//! |  (sniff-based in-place upgrades)            |  (UDP)         |
//! +--------------------------------------------------------------+
//! |  Poller: key-indexed readiness multiplexing over mio         |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Concurrency model
//!
//! One thread owns each [`server::EventServer`] and drives its
//! `runtime` loop; every session callback happens on that thread.
//! Parallelism means running several independent instances. All
//! session I/O is non-blocking; `runtime` is the only place the thread
//! sleeps.

pub mod buffer;
pub mod config;
mod error;
pub mod http;
pub mod poller;
pub mod server;
pub mod session;
pub mod ucp;
pub mod ws;

pub use error::{Error, Result};
