// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! UCP wire codec.
//!
//! 20-byte little-endian header followed by the payload:
//!
//! ```text
//! offset 0   crc32 over bytes 4..end (header tail + payload)
//! offset 4   session-id u32
//! offset 8   seq u64
//! offset 16  cmd u8
//! offset 17  reserved u8
//! offset 18  payload length u16
//! ```
//!
//! After the CRC is written, everything from offset 4 on is XOR-masked
//! with the CRC value. The mask cheaply rejects malformed packets and
//! removes plaintext markers; it is not security.

use crate::config::{UCP_HEADER_SIZE, UCP_PAYLOAD_MAX};
use crate::error::{Error, Result};

pub const CMD_HRT: u8 = 20;
pub const CMD_SYN: u8 = 21;
pub const CMD_SYNR: u8 = 22;
pub const CMD_DAT: u8 = 30;
pub const CMD_DATR: u8 = 31;
pub const CMD_ACK: u8 = 32;
pub const CMD_FIN: u8 = 33;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub ssid: u32,
    pub seq: u64,
    pub cmd: u8,
    pub len: u16,
}

/// XOR with the mask, little-endian word at a time.
pub fn xor_mask_le(data: &mut [u8], mask: u32) {
    let words = data.len() / 4;
    for i in 0..words {
        let off = i * 4;
        let v = u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]) ^ mask;
        data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    let mb = mask.to_le_bytes();
    for (i, b) in data[words * 4..].iter_mut().enumerate() {
        *b ^= mb[i & 3];
    }
}

/// Encode one frame.
pub fn encode_frame(ssid: u32, seq: u64, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > UCP_PAYLOAD_MAX {
        return Err(Error::Protocol(format!(
            "ucp payload {} exceeds {}",
            payload.len(),
            UCP_PAYLOAD_MAX
        )));
    }
    let mut out = vec![0u8; UCP_HEADER_SIZE + payload.len()];
    out[4..8].copy_from_slice(&ssid.to_le_bytes());
    out[8..16].copy_from_slice(&seq.to_le_bytes());
    out[16] = cmd;
    out[17] = 0;
    out[18..20].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    out[UCP_HEADER_SIZE..].copy_from_slice(payload);

    let crc = crc32fast::hash(&out[4..]);
    out[0..4].copy_from_slice(&crc.to_le_bytes());
    xor_mask_le(&mut out[4..], crc);
    Ok(out)
}

/// Decode and validate one frame. None on any mismatch: short input,
/// CRC failure, length disagreement.
pub fn decode_frame(frame: &[u8]) -> Option<(FrameHeader, Vec<u8>)> {
    if frame.len() < UCP_HEADER_SIZE {
        return None;
    }
    let crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let mut body = frame[4..].to_vec();
    xor_mask_le(&mut body, crc);
    if crc32fast::hash(&body) != crc {
        return None;
    }
    let header = FrameHeader {
        ssid: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
        seq: u64::from_le_bytes([
            body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
        ]),
        cmd: body[12],
        len: u16::from_le_bytes([body[14], body[15]]),
    };
    if header.len as usize + UCP_HEADER_SIZE != frame.len() {
        return None;
    }
    Some((header, body[UCP_HEADER_SIZE - 4..].to_vec()))
}
