// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP 1.0 ([RFC 2326](https://datatracker.ietf.org/doc/html/rfc2326)) client
//! and server core.
//!
//! This crate owns four tightly coupled layers: the RTSP wire codec and
//! session state machine ([`message`], [`auth`], [`client`], [`server`]),
//! the UDP/TCP transport multiplexer ([`transport`]), the RTP H.264/H.265
//! payload framing ([`codec`]), and the timestamp/loss/RTCP bookkeeping
//! shared by both client and server roles ([`timestamp`], [`rtcp`]).
//!
//! The SDP *text* grammar is not reimplemented here; [`sdp_types`]
//! re-exports the structured descriptors this crate consumes and produces,
//! built on top of the `sdp` crate.

use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;

pub mod auth;
mod bitstream;
pub mod client;
pub mod codec;
pub mod header;
pub mod message;
pub mod rtcp;
pub mod sdp_types;
pub mod server;
pub mod timestamp;
pub mod transport;
pub mod url;

pub use crate::timestamp::{NtpTimestamp, Timestamp};
pub use crate::url::RtspUrl;

/// Constructs an [`Error`] and returns it via `?`/early-return, mirroring
/// `anyhow!`/`failure::bail!` but filling in [`ErrorInt`] variants that
/// carry connection/message context rather than a bare string.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::wrap!($e))
    };
}

/// Boxes an [`ErrorInt`] into the public [`Error`] type.
macro_rules! wrap {
    ($e:expr) => {
        crate::Error(Box::new($e))
    };
}

pub(crate) use bail;
pub(crate) use wrap;

/// Describes a single TCP connection to/from an RTSP peer, for error
/// messages and logging. Cheap to copy; carries no owned data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionContext {
    pub local_addr: std::net::SocketAddr,
    pub peer_addr: std::net::SocketAddr,
    pub established_wall: std::time::SystemTime,
    pub established_mono: std::time::Instant,
}

impl ConnectionContext {
    pub fn new(local_addr: std::net::SocketAddr, peer_addr: std::net::SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: std::time::SystemTime::now(),
            established_mono: std::time::Instant::now(),
        }
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.peer_addr, self.local_addr)
    }
}

/// Describes where within the RTSP byte stream a given request, response, or
/// interleaved frame began, for error messages and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtspMessageContext {
    /// Byte position within the connection's read stream at which this
    /// message began.
    pub pos: u64,
    pub received_wall: std::time::SystemTime,
    pub received_mono: std::time::Instant,
}

impl RtspMessageContext {
    pub fn new(pos: u64) -> Self {
        Self {
            pos,
            received_wall: std::time::SystemTime::now(),
            received_mono: std::time::Instant::now(),
        }
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pos {}", self.pos)
    }
}

/// The crate-wide error type: a thin, cheaply-movable wrapper around a
/// boxed [`ErrorInt`], so that `Result<T, Error>` stays small regardless of
/// how much context a given failure variant carries.
#[derive(Debug)]
pub struct Error(pub(crate) Box<ErrorInt>);

impl Error {
    /// True if retrying the operation (e.g. after re-authenticating) might
    /// succeed; false if the connection should simply be closed.
    pub fn is_permanent(&self) -> bool {
        !matches!(&*self.0, ErrorInt::Auth { .. } | ErrorInt::Loss { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        wrap!(ErrorInt::Io(e))
    }
}

/// The kinds of failure distinguished by §7 of the design: protocol framing
/// errors, transport I/O, state-machine misuse, authentication, loss
/// (non-fatal, counted), depacketizer control signals, and hard limits.
#[derive(Debug, thiserror::Error)]
pub enum ErrorInt {
    #[error("[{conn_ctx}, {msg_ctx}] malformed RTSP message on channel {channel_id:?} (stream {stream_id:?}): {description}")]
    RtspDataMessageError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        stream_id: usize,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] bad RTP packet on channel {channel_id} (stream {stream_id}) ssrc={ssrc:08x} seq={sequence_number:04x}: {description}")]
    RtpPacketError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        stream_id: usize,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("[{conn_ctx}] protocol error: {description}")]
    Protocol {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("[{conn_ctx}] transport error: {description}")]
    Transport {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("request issued in wrong session state: {description}")]
    State { description: String },

    #[error("authentication failed: {description}")]
    Auth { description: String },

    #[error("packet loss: {description}")]
    Loss { description: String },

    #[error("limit exceeded: {description}")]
    Limit { description: String },

    #[error("timed out waiting for {description}")]
    Timeout { description: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A wall-clock/RTP-clock pair. `Timestamp`/`NtpTimestamp` live in
/// [`timestamp`]; re-exported at the crate root because nearly every
/// public type in [`codec`] and [`client`] references one.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    let buf_start = buf.as_ptr() as usize;
    let subset_start = subset.as_ptr() as usize;
    if subset_start < buf_start {
        return None;
    }
    let start = subset_start - buf_start;
    let end = start + subset.len();
    if end > buf.len() {
        return None;
    }
    Some(start..end)
}

/// A frame-level access-unit size/count guard shared by both H.264 and
/// H.265 payload utilities.
pub(crate) const MAX_NALU_SIZE: usize = 3 * 1024 * 1024;
pub(crate) const MAX_NALUS_PER_GROUP: usize = 20;
pub(crate) const MAX_ACCESS_UNIT_SIZE: usize = 8 * 1024 * 1024;

/// Clamps a frame-length-like quantity to a `NonZeroU32`, falling back to
/// `1` rather than panicking; used only for values that are already known
/// to be non-negative but whose zero-ness is a don't-care for the caller.
pub(crate) fn nonzero_or_one(v: u32) -> NonZeroU32 {
    NonZeroU32::new(v).unwrap_or_else(|| NonZeroU32::new(1).unwrap())
}
