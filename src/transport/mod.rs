// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The UDP/TCP transport multiplexer (§4.6): per-stream UDP socket pairs,
//! the TCP interleaved write path, and the ring-buffer async processor
//! that decouples reading from processing.

pub mod interleaved;
pub mod ring;
pub mod udp;

/// A negotiated `Transport` header, reduced to what the rest of this crate
/// needs: which channel pair (TCP) or port pair (UDP) carries this track's
/// RTP/RTCP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSpec {
    Tcp {
        channels: (u8, u8),
    },
    Udp {
        client_ports: (u16, u16),
        server_ports: Option<(u16, u16)>,
    },
}

impl TransportSpec {
    pub fn is_tcp(&self) -> bool {
        matches!(self, TransportSpec::Tcp { .. })
    }
}
