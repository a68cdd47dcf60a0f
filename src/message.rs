// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP request/response/interleaved-frame wire codec (§4.1, §6).
//!
//! Parsing is line-oriented and asynchronous (driven off whatever
//! `AsyncBufRead` the transport layer hands us — a buffered TCP stream in
//! practice); serialization produces a single contiguous `Bytes` per
//! message so a write is always one `write_all` plus a flush (§4.1's
//! "write must flush before returning").

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::header::Header;
use crate::url::RtspUrl;
use crate::{bail, wrap, ConnectionContext, Error, ErrorInt, RtspMessageContext};

/// Maximum length of a request/response body carried on the RTSP control
/// channel (§3, §4.1).
pub const MAX_CONTENT_LENGTH: usize = 4096;

const MAX_METHOD_LEN: usize = 128;
const MAX_URL_LEN: usize = 1024;
const MAX_LINE_LEN: usize = 8192;
const PROTOCOL: &str = "RTSP/1.0";

/// The standard RTSP 1.0 method set (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Record,
    Teardown,
    GetParameter,
    SetParameter,
    Redirect,
    PlayNotify,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Record => "RECORD",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Redirect => "REDIRECT",
            Method::PlayNotify => "PLAY_NOTIFY",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "RECORD" => Method::Record,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "REDIRECT" => Method::Redirect,
            "PLAY_NOTIFY" => Method::PlayNotify,
            other => return Err(format!("unrecognized RTSP method {:?}", other)),
        })
    }
}

/// Looks up the standard reason phrase for a known status code; `None` for
/// codes this crate doesn't have a table entry for (the response's own
/// reason phrase, if present, wins in that case; see §4.1).
pub fn default_reason(status: u16) -> Option<&'static str> {
    Some(match status {
        100 => "Continue",
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        456 => "Header Field Not Valid for Resource",
        457 => "Invalid Range",
        458 => "Parameter Is Read-Only",
        459 => "Aggregate Operation Not Allowed",
        460 => "Only Aggregate Operation Allowed",
        461 => "Unsupported Transport",
        462 => "Destination Unreachable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "RTSP Version Not Supported",
        551 => "Option Not Supported",
        _ => return None,
    })
}

/// An RTSP request (§3, §4.1).
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: RtspUrl,
    pub header: Header,
    pub content: Bytes,
}

impl Request {
    pub fn new(method: Method, url: RtspUrl) -> Self {
        Self {
            method,
            url,
            header: Header::new(),
            content: Bytes::new(),
        }
    }

    /// Serializes the request, stripping credentials from the URL and
    /// setting `Content-Length` to the exact body size (§4.1).
    pub fn serialize(&self) -> Bytes {
        let url = self.url.clone_without_credentials();
        let mut buf = BytesMut::with_capacity(256 + self.content.len());
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(url.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(PROTOCOL.as_bytes());
        buf.put_slice(b"\r\n");
        let mut header = self.header.clone();
        if !self.content.is_empty() {
            header.set("Content-Length", self.content.len().to_string());
        } else {
            header.remove("Content-Length");
        }
        buf.put_slice(header.to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.content);
        buf.freeze()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), Error> {
        let bytes = self.serialize();
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }
}

/// An RTSP response (§3, §4.1).
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub header: Header,
    pub content: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        let reason = default_reason(status).unwrap_or("").to_string();
        Self {
            status,
            reason,
            header: Header::new(),
            content: Bytes::new(),
        }
    }

    pub fn with_content(mut self, content_type: &str, content: Bytes) -> Self {
        self.header.set("Content-Type", content_type);
        self.content = content;
        self
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.content.len());
        buf.put_slice(PROTOCOL.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason.as_bytes());
        buf.put_slice(b"\r\n");
        let mut header = self.header.clone();
        if !self.content.is_empty() {
            header.set("Content-Length", self.content.len().to_string());
        } else {
            header.remove("Content-Length");
        }
        buf.put_slice(header.to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.content);
        buf.freeze()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), Error> {
        let bytes = self.serialize();
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }
}

/// `$ channel length payload` (§3, §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

pub const INTERLEAVED_TAG: u8 = b'$';

impl InterleavedFrame {
    pub fn serialize(&self) -> Bytes {
        assert!(self.payload.len() <= u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u8(INTERLEAVED_TAG);
        buf.put_u8(self.channel);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Tagged union returned by the peek-`$` reader multiplexer (§4.1): either
/// an interleaved RTP/RTCP frame, or the raw header block of an RTSP
/// message (caller decides request vs. response parsing based on its
/// role).
pub enum Item {
    Request(Request),
    Response(Response),
    Interleaved(InterleavedFrame),
}

/// Which side of the connection is reading: a client expects `Response`s
/// (plus interleaved data), a server expects `Request`s (plus interleaved
/// data from an ANNOUNCE/RECORD publisher).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    conn_ctx: &ConnectionContext,
    msg_ctx: &RtspMessageContext,
    max_len: usize,
) -> Result<String, Error> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await.map_err(|e| {
        wrap!(ErrorInt::Transport {
            conn_ctx: *conn_ctx,
            description: format!("read error: {}", e),
        })
    })?;
    if n == 0 {
        bail!(ErrorInt::Transport {
            conn_ctx: *conn_ctx,
            description: "connection closed mid-message".to_string(),
        });
    }
    if buf.len() > max_len || !buf.ends_with(b"\n") {
        bail!(ErrorInt::RtspDataMessageError {
            conn_ctx: *conn_ctx,
            msg_ctx: *msg_ctx,
            channel_id: 0,
            stream_id: 0,
            description: format!("oversize line (> {} bytes)", max_len),
        });
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| {
        wrap!(ErrorInt::RtspDataMessageError {
            conn_ctx: *conn_ctx,
            msg_ctx: *msg_ctx,
            channel_id: 0,
            stream_id: 0,
            description: "non-UTF-8 line".to_string(),
        })
    })
}

async fn read_header_block<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    conn_ctx: &ConnectionContext,
    msg_ctx: &RtspMessageContext,
) -> Result<Header, Error> {
    let mut header = Header::new();
    loop {
        let line = read_line_limited(reader, conn_ctx, msg_ctx, MAX_LINE_LEN).await?;
        if line.is_empty() {
            return Ok(header);
        }
        header.append_line(&line).map_err(|description| {
            wrap!(ErrorInt::RtspDataMessageError {
                conn_ctx: *conn_ctx,
                msg_ctx: *msg_ctx,
                channel_id: 0,
                stream_id: 0,
                description,
            })
        })?;
    }
}

async fn read_content<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    conn_ctx: &ConnectionContext,
    msg_ctx: &RtspMessageContext,
    header: &Header,
) -> Result<Bytes, Error> {
    let content_length = match header.get("Content-Length") {
        None => return Ok(Bytes::new()),
        Some(v) => v.trim().parse::<usize>().map_err(|_| {
            wrap!(ErrorInt::RtspDataMessageError {
                conn_ctx: *conn_ctx,
                msg_ctx: *msg_ctx,
                channel_id: 0,
                stream_id: 0,
                description: format!("malformed Content-Length {:?}", v),
            })
        })?,
    };
    if content_length > MAX_CONTENT_LENGTH {
        bail!(ErrorInt::Limit {
            description: format!(
                "Content-Length {} exceeds {}-byte limit",
                content_length, MAX_CONTENT_LENGTH
            ),
        });
    }
    let mut buf = vec![0u8; content_length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut buf)
        .await
        .map_err(|e| {
            wrap!(ErrorInt::RtspDataMessageError {
                conn_ctx: *conn_ctx,
                msg_ctx: *msg_ctx,
                channel_id: 0,
                stream_id: 0,
                description: format!("truncated body: {}", e),
            })
        })?;
    Ok(Bytes::from(buf))
}

/// Reads one interleaved frame or RTSP message, per the peek-`$`
/// multiplexer described in §4.1/§4.6. Never consumes bytes belonging to a
/// message it doesn't end up returning.
pub async fn read_item<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    conn_ctx: &ConnectionContext,
    role: Role,
) -> Result<(Item, RtspMessageContext), Error> {
    let msg_ctx = RtspMessageContext::new(0);
    let buf = reader.fill_buf().await.map_err(|e| {
        wrap!(ErrorInt::Transport {
            conn_ctx: *conn_ctx,
            description: format!("read error: {}", e),
        })
    })?;
    if buf.is_empty() {
        bail!(ErrorInt::Transport {
            conn_ctx: *conn_ctx,
            description: "connection closed".to_string(),
        });
    }
    if buf[0] == INTERLEAVED_TAG {
        reader.consume(1);
        let mut hdr = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(reader, &mut hdr)
            .await
            .map_err(|e| {
                wrap!(ErrorInt::Transport {
                    conn_ctx: *conn_ctx,
                    description: format!("truncated interleaved frame header: {}", e),
                })
            })?;
        let channel = hdr[0];
        let len = u16::from_be_bytes([hdr[1], hdr[2]]) as usize;
        let mut payload = vec![0u8; len];
        tokio::io::AsyncReadExt::read_exact(reader, &mut payload)
            .await
            .map_err(|e| {
                wrap!(ErrorInt::Transport {
                    conn_ctx: *conn_ctx,
                    description: format!("truncated interleaved frame payload: {}", e),
                })
            })?;
        return Ok((
            Item::Interleaved(InterleavedFrame {
                channel,
                payload: Bytes::from(payload),
            }),
            msg_ctx,
        ));
    }

    let line = read_line_limited(reader, conn_ctx, &msg_ctx, MAX_LINE_LEN).await?;
    if line.starts_with("RTSP/") {
        if role == Role::Server {
            bail!(ErrorInt::Protocol {
                conn_ctx: *conn_ctx,
                description: "server received a status line".to_string(),
            });
        }
        let mut parts = line.splitn(3, ' ');
        let proto = parts.next().unwrap_or("");
        if proto != PROTOCOL {
            bail!(ErrorInt::RtspDataMessageError {
                conn_ctx: *conn_ctx,
                msg_ctx,
                channel_id: 0,
                stream_id: 0,
                description: format!("unsupported protocol version {:?}", proto),
            });
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                wrap!(ErrorInt::RtspDataMessageError {
                    conn_ctx: *conn_ctx,
                    msg_ctx,
                    channel_id: 0,
                    stream_id: 0,
                    description: format!("malformed status line {:?}", line),
                })
            })?;
        let mut reason = parts.next().unwrap_or("").to_string();
        if reason.is_empty() {
            reason = default_reason(status).unwrap_or("").to_string();
        }
        let header = read_header_block(reader, conn_ctx, &msg_ctx).await?;
        let content = read_content(reader, conn_ctx, &msg_ctx, &header).await?;
        return Ok((
            Item::Response(Response {
                status,
                reason,
                header,
                content,
            }),
            msg_ctx,
        ));
    }

    if role == Role::Client {
        bail!(ErrorInt::Protocol {
            conn_ctx: *conn_ctx,
            description: "client received a request line".to_string(),
        });
    }
    let mut parts = line.splitn(3, ' ');
    let method_str = parts.next().unwrap_or("");
    if method_str.len() > MAX_METHOD_LEN {
        bail!(ErrorInt::RtspDataMessageError {
            conn_ctx: *conn_ctx,
            msg_ctx,
            channel_id: 0,
            stream_id: 0,
            description: "oversize method token".to_string(),
        });
    }
    let method = Method::from_str(method_str).map_err(|description| {
        wrap!(ErrorInt::RtspDataMessageError {
            conn_ctx: *conn_ctx,
            msg_ctx,
            channel_id: 0,
            stream_id: 0,
            description,
        })
    })?;
    let url_str = parts.next().unwrap_or("");
    if url_str.len() > MAX_URL_LEN {
        bail!(ErrorInt::RtspDataMessageError {
            conn_ctx: *conn_ctx,
            msg_ctx,
            channel_id: 0,
            stream_id: 0,
            description: "oversize URL token".to_string(),
        });
    }
    let url = RtspUrl::parse(url_str)?;
    let proto = parts.next().unwrap_or("");
    if proto != PROTOCOL {
        bail!(ErrorInt::RtspDataMessageError {
            conn_ctx: *conn_ctx,
            msg_ctx,
            channel_id: 0,
            stream_id: 0,
            description: format!("unsupported protocol version {:?}", proto),
        });
    }
    let header = read_header_block(reader, conn_ctx, &msg_ctx).await?;
    let content = read_content(reader, conn_ctx, &msg_ctx, &header).await?;
    Ok((
        Item::Request(Request {
            method,
            url,
            header,
            content,
        }),
        msg_ctx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConnectionContext {
        ConnectionContext::new("127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap())
    }

    #[tokio::test]
    async fn round_trips_options_request() {
        let raw = b"OPTIONS rtsp://example.com/media.mp4 RTSP/1.0\r\nCSeq: 1\r\nRequire: implicit-play\r\nProxy-Require: gzipped-messages\r\n\r\n";
        let mut reader = &raw[..];
        let (item, _) = read_item(&mut reader, &ctx(), Role::Server).await.unwrap();
        let req = match item {
            Item::Request(r) => r,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.url.to_string(), "rtsp://example.com/media.mp4");
        assert_eq!(req.serialize(), Bytes::from_static(raw));
    }

    #[tokio::test]
    async fn round_trips_response_with_duplicate_header() {
        let raw = b"RTSP/1.0 401 Unauthorized\r\nCSeq: 2\r\nWWW-Authenticate: Basic realm=\"x\"\r\nWWW-Authenticate: Digest realm=\"x\", nonce=\"y\"\r\n\r\n";
        let mut reader = &raw[..];
        let (item, _) = read_item(&mut reader, &ctx(), Role::Client).await.unwrap();
        let resp = match item {
            Item::Response(r) => r,
            _ => panic!("expected response"),
        };
        assert_eq!(resp.status, 401);
        assert_eq!(resp.header.get_all("www-authenticate").count(), 2);
        assert_eq!(resp.serialize(), Bytes::from_static(raw));
    }

    #[tokio::test]
    async fn interleaved_frame_is_not_mistaken_for_a_message() {
        let mut raw = vec![b'$', 0, 0, 4];
        raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let mut reader = &raw[..];
        let (item, _) = read_item(&mut reader, &ctx(), Role::Client).await.unwrap();
        match item {
            Item::Interleaved(f) => {
                assert_eq!(f.channel, 0);
                assert_eq!(&f.payload[..], &[0xde, 0xad, 0xbe, 0xef]);
            }
            _ => panic!("expected interleaved frame"),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_version() {
        let raw = b"OPTIONS rtsp://example.com/ RTSP/2.0\r\n\r\n";
        let mut reader = &raw[..];
        assert!(read_item(&mut reader, &ctx(), Role::Server).await.is_err());
    }

    #[tokio::test]
    async fn content_length_over_limit_is_rejected() {
        let raw = format!(
            "OPTIONS rtsp://example.com/ RTSP/1.0\r\nContent-Length: {}\r\n\r\n",
            MAX_CONTENT_LENGTH + 1
        );
        let mut reader = raw.as_bytes();
        assert!(read_item(&mut reader, &ctx(), Role::Server).await.is_err());
    }

    #[test]
    fn unknown_status_code_preserves_verbatim_reason() {
        let mut r = Response::new(299);
        r.reason = "Nonstandard Thing".to_string();
        assert!(r.serialize().starts_with(b"RTSP/1.0 299 Nonstandard Thing\r\n"));
    }

    #[test]
    fn known_status_code_autofills_reason() {
        let r = Response::new(405);
        assert_eq!(r.reason, "Method Not Allowed");
    }
}
