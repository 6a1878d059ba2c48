// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Send buffer cap would be exceeded; nothing was appended.
    #[error("send buffer full")]
    BufferFull,

    /// No session or socket is registered under this key.
    #[error("unknown key {0}")]
    SessionNotFound(i32),

    /// The operation cannot make progress right now (e.g. the UCP
    /// in-flight window is full).
    #[error("would block")]
    WouldBlock,

    /// The descriptor table reached `min(RLIMIT_NOFILE, 16384)` minus
    /// the accept reserve.
    #[error("descriptor limit reached")]
    FdLimit,

    /// Malformed peer input (HTTP, WebSocket, TLS or UCP framing).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS credentials could not be loaded or were not loaded yet.
    #[error("certificate error: {0}")]
    CertLoad(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, Error>;
