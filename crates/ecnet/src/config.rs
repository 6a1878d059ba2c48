// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Policy constants and per-instance configuration.
//!
//! The constants are the protocol/resource caps of the stack; the config
//! structs let an instance override the tunable subset.

/// Block size of the shared send-buffer pool.
pub const SNDBUF_BLOCK_SIZE: usize = 64 * 1024;

/// Number of blocks pre-warmed into the pool (4 MiB).
pub const SNDBUF_POOL_BLOCKS: usize = (4 * 1024 * 1024) / SNDBUF_BLOCK_SIZE;

/// Per-session send buffer cap.
pub const SNDBUF_MAX_SIZE: usize = 32 * 1024 * 1024;

/// Default per-read budget offered to the application.
pub const READ_ONCE_SIZE: usize = 32 * 1024;

/// Hard ceiling on the descriptor table, before the OS rlimit is applied.
pub const MAX_FDS: usize = 16384;

/// Descriptors kept free so accept can never exhaust the process.
pub const RESERVED_FDS: usize = 80;

/// Seconds an "attack" session lingers before the tick walk closes it.
pub const ATTACK_GRACE_SECS: u64 = 30;

/// Maximum events drained per `wait` call.
pub const MAX_POLL_EVENTS: usize = 128;

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Outbound WebSocket frame payload cap (fits the 16-bit length form).
pub const WS_FRAME_OUT_SIZE: usize = 62 * 1024;

/// Largest single inbound frame payload accepted.
pub const WS_FRAME_IN_MAX: usize = 4 * 1024 * 1024;

/// Largest assembled inbound message accepted.
pub const WS_MESSAGE_MAX: usize = 32 * 1024 * 1024;

/// Messages below this size are never permessage-deflate compressed.
pub const WS_COMPRESS_MIN: usize = 128;

/// Frames at or below this size are not deflate-frame compressed.
pub const WS_FRAME_COMPRESS_MIN: usize = 256;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Whole-file GET responses above this size yield 413.
pub const HTTP_DOWNFILE_MAX: usize = 32 * 1024 * 1024;

/// Single Range window cap; longer ranges are clamped.
pub const HTTP_RANGE_MAX: usize = 8 * 1024 * 1024;

/// Chunk size for rolled file send jobs.
pub const HTTP_SENDJOB_CHUNK: usize = 30 * 1024;

// ---------------------------------------------------------------------------
// UCP
// ---------------------------------------------------------------------------

/// Assumed path MTU.
pub const UCP_MTU: usize = 1492;

/// Max UCP datagram: MTU minus IPv4 + UDP headers.
pub const UCP_FRAME_MAX: usize = UCP_MTU - 28;

/// UCP header size (64-bit sequence numbers).
pub const UCP_HEADER_SIZE: usize = 20;

/// Max payload per UCP data frame.
pub const UCP_PAYLOAD_MAX: usize = UCP_FRAME_MAX - UCP_HEADER_SIZE;

/// Retransmit queue capacity (in-flight frames per session).
pub const UCP_SENDQ_FRAMES: usize = 512;

/// `send` refuses new frames once the queue holds this many.
pub const UCP_SENDQ_FULL: usize = UCP_SENDQ_FRAMES - 2;

/// Heartbeat after this much send-side silence.
pub const UCP_HEARTBEAT_MS: i64 = 20_000;

/// Retransmissions per session per tick.
pub const UCP_RESEND_BURST: usize = 16;

/// Times the same cumulative ACK value is repeated before going quiet.
pub const UCP_ACK_REPEAT: u32 = 3;

/// Session-id nonce length (connection dedup across channels).
pub const UCP_NONCE_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Event-server tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Kernel receive buffer for accepted/outbound sockets, KiB.
    pub rcvbuf_kb: usize,
    /// Kernel send buffer for accepted/outbound sockets, KiB.
    pub sndbuf_kb: usize,
    /// Per-session send buffer cap in bytes.
    pub sndbuf_max: usize,
    /// Grace window for attack sessions, seconds.
    pub attack_grace_secs: u64,
    /// Default read budget per wakeup, bytes.
    pub read_once: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rcvbuf_kb: 128,
            sndbuf_kb: 128,
            sndbuf_max: SNDBUF_MAX_SIZE,
            attack_grace_secs: ATTACK_GRACE_SECS,
            read_once: READ_ONCE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Clamp the kernel buffer sizes to the supported range.
    pub fn clamped(mut self) -> Self {
        self.rcvbuf_kb = self.rcvbuf_kb.clamp(32, 262_144);
        self.sndbuf_kb = self.sndbuf_kb.clamp(32, 262_144);
        self
    }
}

/// Static-file HTTP service tuning.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Document root; request paths are resolved beneath it.
    pub doc_root: std::path::PathBuf,
    /// Whole-file response cap (413 above it). 2 MiB on constrained
    /// targets, 32 MiB otherwise.
    pub downfile_max: usize,
    /// Range window cap.
    pub range_max: usize,
    /// Optional `user:password` for Basic auth; None disables the check.
    pub basic_auth: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            doc_root: std::path::PathBuf::from("."),
            downfile_max: HTTP_DOWNFILE_MAX,
            range_max: HTTP_RANGE_MAX,
            basic_auth: None,
        }
    }
}

/// UCP engine tuning.
#[derive(Debug, Clone)]
pub struct UcpConfig {
    /// Base retransmission timeout, ms; doubles per retry.
    pub base_rto_ms: i64,
    /// Fast-retransmit gap: acked seqs beyond an unacked frame before its
    /// first early retransmission.
    pub ack_delta: u64,
    /// Retry count that tears the session down.
    pub max_retries: u32,
    /// Retransmissions per session per tick.
    pub resend_burst: usize,
    /// Runtime tick interval, ms.
    pub tick_ms: i64,
}

impl Default for UcpConfig {
    fn default() -> Self {
        Self {
            base_rto_ms: 260,
            ack_delta: 5,
            max_retries: 6,
            resend_burst: UCP_RESEND_BURST,
            tick_ms: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_constants() {
        assert_eq!(UCP_FRAME_MAX, 1464);
        assert_eq!(UCP_PAYLOAD_MAX, 1444);
        assert_eq!(UCP_SENDQ_FULL, 510);
        assert_eq!(SNDBUF_POOL_BLOCKS, 64);
    }

    #[test]
    fn test_server_config_clamps() {
        let cfg = ServerConfig {
            rcvbuf_kb: 1,
            sndbuf_kb: usize::MAX,
            ..Default::default()
        }
        .clamped();
        assert_eq!(cfg.rcvbuf_kb, 32);
        assert_eq!(cfg.sndbuf_kb, 262_144);
    }

    #[test]
    fn test_defaults_match_policy() {
        let ucp = UcpConfig::default();
        assert_eq!(ucp.base_rto_ms, 260);
        assert_eq!(ucp.ack_delta, 5);
        assert_eq!(ucp.max_retries, 6);

        let http = HttpConfig::default();
        assert_eq!(http.downfile_max, 32 * 1024 * 1024);
        assert!(http.basic_auth.is_none());
    }
}
