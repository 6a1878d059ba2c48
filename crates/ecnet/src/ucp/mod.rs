// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! UCP: reliable, ordered datagram sessions over UDP.
//!
//! A UCP session is a logical channel identified by a 32-bit id whose
//! low half is chosen by the connecting side and whose high half is
//! assigned by the accepting side at handshake completion. Packets are
//! sprayed over every registered UDP channel of the session; the
//! receive side reorders, deduplicates and acknowledges cumulatively
//! with a greatest-seen hint that drives fast retransmission.
//!
//! The engine is clocked and transported externally: feed inbound
//! datagrams to [`UcpEndpoint::on_frame`], call
//! [`UcpEndpoint::runtime`] every few milliseconds, and collect
//! notifications with [`UcpEndpoint::poll_events`].

mod endpoint;
mod queue;
pub mod wire;

pub use endpoint::{DatagramSender, UcpChannel, UcpDisconnect, UcpEndpoint, UcpEvent};
pub use queue::{RecvQueue, SendQueue};
