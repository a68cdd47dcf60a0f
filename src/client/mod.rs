// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side RTSP session state machine (§4.7): `Start` → `Describe` →
//! `SetupAll` → `Play`/`Record`, with keepalive and UDP health-check.

pub mod rtp;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::auth::{authorize_request, Challenge, Credentials};
use crate::codec;
use crate::header::names;
use crate::message::{read_item, Item, Method, Request, Response, Role};
use crate::sdp_types::{self, MediaDescription, MediaType, SessionDescription};
use crate::timestamp::{GlobalTimestampDecoder, Timeline};
use crate::transport::{udp::UdpPair, TransportSpec};
use crate::url::RtspUrl;
use crate::{bail, wrap, ConnectionContext, Error, ErrorInt};

pub use crate::rtcp::SenderReport;
pub use rtp::{Packet, SenderReportItem};

/// Caller-configurable knobs (§6's "constructor parameters" surface: no CLI
/// in this crate, just fields a caller sets before `describe()`).
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub creds: Option<Credentials>,
    pub user_agent: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Period with no keepalive send before the connection is considered
    /// idle-dead; half the session's advertised timeout by default, reset
    /// once an actual `Session:` header is observed.
    pub keepalive_interval: Duration,
    /// Window with no RTP/RTCP after PLAY before a UDP transport is
    /// considered dead and TCP interleaving is retried (§4.7, §8.12).
    pub check_stream_period: Duration,
    pub ignore_spurious_data: bool,
    pub ignore_zero_seq: bool,
    pub prefer_tcp: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            creds: None,
            user_agent: "rtsp-core".to_string(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            check_stream_period: Duration::from_secs(15),
            ignore_spurious_data: false,
            ignore_zero_seq: false,
            prefer_tcp: false,
        }
    }
}

/// One item pulled off a playing/recording session: a depacketized frame
/// when the stream's codec is understood, a raw RTP packet when it isn't
/// (or no depacketizer could be built for it), or an RTCP sender report.
#[derive(Debug)]
pub enum PacketItem {
    CodecItem(codec::CodecItem),
    RtpPacket(Packet),
    SenderReport(SenderReportItem),
}

/// The client-visible session states (§4.7): `Initial` before any SETUP,
/// `Preplay`/`Prerecord` once every track is set up but before PLAY/RECORD,
/// `Play`/`Record` once the corresponding method has succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    Preplay,
    Prerecord,
    Play,
    Record,
}

/// A single SETUP'd track: its media description, negotiated transport, and
/// the per-stream demultiplexing state (sequence checker, timeline).
struct Track {
    media: MediaDescription,
    transport: TransportSpec,
    checker: rtp::StrictSequenceChecker,
    timeline: Timeline,
    udp: Option<UdpPair>,
    last_packet_at: Option<Instant>,
    /// `None` when the track's encoding has no depacketizer (an
    /// unrecognized codec, or one this crate doesn't implement); such
    /// tracks surface as raw [`PacketItem::RtpPacket`]s instead.
    depacketizer: Option<codec::Depacketizer>,
}

/// A datagram from either transport, tagged with enough to demultiplex it:
/// the raw framed item for TCP, or the stream index and RTP/RTCP-ness for
/// UDP (whose socket pair already pins it to one track).
enum Source {
    Tcp(Item, crate::RtspMessageContext),
    Udp {
        idx: usize,
        is_rtcp: bool,
        data: Bytes,
    },
}

/// A client-side RTSP session: owns the TCP control connection, the
/// negotiated session id, and every SETUP'd track.
pub struct Session {
    conn_ctx: ConnectionContext,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    base_url: RtspUrl,
    options: SessionOptions,
    cseq: u32,
    session_id: Option<String>,
    session_timeout: Duration,
    state: ClientState,
    challenge: Option<Challenge>,
    tracks: Vec<Track>,
    global_decoder: GlobalTimestampDecoder,
    last_activity: Instant,
}

impl Session {
    /// `Start(scheme, host)`: opens the TCP connection (§4.7). `DESCRIBE` is
    /// issued immediately afterward by [`Session::describe`] so that a
    /// caller always has the `SessionDescription` before deciding which
    /// medias to `SETUP`.
    pub async fn connect(url: &RtspUrl, options: SessionOptions) -> Result<Self, Error> {
        let addr = format!("{}:{}", url.host(), url.port_or_default());
        let stream = TcpStream::connect(&addr).await.map_err(Error::from)?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().map_err(Error::from)?;
        let peer_addr: SocketAddr = stream.peer_addr().map_err(Error::from)?;
        let conn_ctx = ConnectionContext::new(local_addr, peer_addr);
        info!("connected to {} from {}", peer_addr, local_addr);
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            conn_ctx,
            reader: BufReader::new(read_half),
            writer: write_half,
            base_url: url.clone_without_credentials(),
            options,
            cseq: 0,
            session_id: None,
            session_timeout: Duration::from_secs(60),
            state: ClientState::Initial,
            challenge: None,
            tracks: Vec::new(),
            global_decoder: GlobalTimestampDecoder::new(),
            last_activity: Instant::now(),
        })
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    fn base_request(&mut self, method: Method, url: RtspUrl) -> Request {
        let mut req = Request::new(method, url);
        req.header.set(names::CSEQ, self.next_cseq().to_string());
        req.header.set(names::USER_AGENT, self.options.user_agent.clone());
        if let Some(sid) = &self.session_id {
            req.header.set(names::SESSION, sid.clone());
        }
        req
    }

    /// Sends `req`, retrying once with credentials if the first attempt is
    /// challenged with a 401 (§4.2, §4.7).
    async fn send_recv(&mut self, mut req: Request) -> Result<Response, Error> {
        if let (Some(challenge), Some(creds)) = (&self.challenge, &self.options.creds) {
            authorize_request(&mut req, challenge, creds);
        }
        let resp = self.send_recv_once(&req).await?;
        if resp.status != 401 {
            return Ok(resp);
        }
        let creds = self
            .options
            .creds
            .as_ref()
            .ok_or_else(|| wrap!(ErrorInt::Auth { description: "401 with no credentials configured".into() }))?
            .clone();
        let challenge = Challenge::prefer_from_response(&resp).ok_or_else(|| {
            wrap!(ErrorInt::Auth { description: "401 without a parseable WWW-Authenticate".into() })
        })?;
        self.challenge = Some(challenge.clone());
        authorize_request(&mut req, &challenge, &creds);
        let resp = self.send_recv_once(&req).await?;
        if resp.status == 401 {
            bail!(ErrorInt::Auth { description: "authentication rejected after retry".into() });
        }
        Ok(resp)
    }

    async fn send_recv_once(&mut self, req: &Request) -> Result<Response, Error> {
        timeout(self.options.write_timeout, req.write_to(&mut self.writer))
            .await
            .map_err(|_| wrap!(ErrorInt::Timeout { description: "writing request".into() }))??;
        loop {
            let (item, _) = timeout(self.options.read_timeout, read_item(&mut self.reader, &self.conn_ctx, Role::Client))
                .await
                .map_err(|_| wrap!(ErrorInt::Timeout { description: "reading response".into() }))??;
            match item {
                Item::Response(resp) => {
                    self.last_activity = Instant::now();
                    return Ok(resp);
                }
                Item::Interleaved(_) => {
                    // Stray data before PLAY/RECORD; discard and keep waiting.
                    continue;
                }
                Item::Request(_) => bail!(ErrorInt::Protocol {
                    conn_ctx: self.conn_ctx,
                    description: "client received a request line".into(),
                }),
            }
        }
    }

    /// `Describe(URL)` (§4.7): sends DESCRIBE, parses the SDP body.
    pub async fn describe(&mut self, url: &RtspUrl) -> Result<SessionDescription, Error> {
        let req = self.base_request(Method::Describe, url.clone());
        let mut req = req;
        req.header.set(names::ACCEPT, "application/sdp");
        let resp = self.send_recv(req).await?;
        if resp.status != 200 {
            bail!(ErrorInt::Protocol {
                conn_ctx: self.conn_ctx,
                description: format!("DESCRIBE returned {} {}", resp.status, resp.reason),
            });
        }
        let content_base = match resp.header.get(names::CONTENT_BASE) {
            Some(v) => Some(RtspUrl::parse(v)?),
            None => Some(url.clone_without_credentials()),
        };
        self.base_url = content_base.clone().unwrap_or_else(|| url.clone_without_credentials());
        sdp_types::parse(content_base, &resp.content)
    }

    /// `SetupAll(baseURL, medias)` (§4.7): issues one SETUP per media,
    /// preferring TCP interleaving when `prefer_tcp` is set or a prior UDP
    /// attempt failed its health check.
    pub async fn setup_all(&mut self, medias: Vec<MediaDescription>) -> Result<(), Error> {
        for media in medias {
            self.setup_one(media).await?;
        }
        // A publisher's medias are all sendonly from the server's point of view,
        // so the client is about to RECORD; anything else is about to PLAY.
        self.state = if self
            .tracks
            .iter()
            .any(|t| t.media.direction == sdp_types::Direction::SendOnly)
        {
            ClientState::Prerecord
        } else {
            ClientState::Preplay
        };
        Ok(())
    }

    async fn setup_one(&mut self, media: MediaDescription) -> Result<(), Error> {
        let control_url = media.control_url(&self.base_url)?;
        let channel_id = (self.tracks.len() as u8) * 2;
        let want_udp = !self.options.prefer_tcp;
        let mut udp = None;
        let transport_header = if want_udp {
            let pair = UdpPair::bind_client().await?;
            let client_ports = pair.client_ports();
            udp = Some(pair);
            format!(
                "RTP/AVP;unicast;client_port={}-{}",
                client_ports.0, client_ports.1
            )
        } else {
            format!("RTP/AVP/TCP;unicast;interleaved={}-{}", channel_id, channel_id + 1)
        };

        let mut req = self.base_request(Method::Setup, control_url);
        req.header.set(names::TRANSPORT, transport_header);
        let resp = self.send_recv(req).await?;
        if resp.status != 200 {
            bail!(ErrorInt::Protocol {
                conn_ctx: self.conn_ctx,
                description: format!("SETUP returned {} {}", resp.status, resp.reason),
            });
        }
        if self.session_id.is_none() {
            let sid_header = resp.header.get(names::SESSION).ok_or_else(|| {
                wrap!(ErrorInt::Protocol {
                    conn_ctx: self.conn_ctx,
                    description: "SETUP response missing Session header".into(),
                })
            })?;
            let (sid, timeout_secs) = parse_session_header(sid_header);
            self.session_id = Some(sid);
            if let Some(secs) = timeout_secs {
                self.session_timeout = Duration::from_secs(secs);
            }
        }
        let negotiated = resp.header.get(names::TRANSPORT).ok_or_else(|| {
            wrap!(ErrorInt::Protocol {
                conn_ctx: self.conn_ctx,
                description: "SETUP response missing Transport header".into(),
            })
        })?;
        let transport = parse_transport_response(negotiated, channel_id)?;
        if let (TransportSpec::Udp { server_ports, .. }, Some(pair)) = (&transport, udp.as_mut()) {
            if let Some(server_ports) = server_ports {
                pair.set_remote(self.conn_ctx.peer_addr.ip(), *server_ports).await?;
            }
        }
        let clock_rate = media
            .formats
            .first()
            .map(|f| f.clock_rate())
            .unwrap_or(90_000);
        let media_type_str = match media.media_type {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Application => "application",
        };
        let depacketizer = media.formats.first().and_then(|format| {
            let fmtp = media.fmtp_for(format);
            match codec::Depacketizer::new(
                media_type_str,
                format.encoding_name(),
                format.clock_rate(),
                None,
                fmtp,
            ) {
                Ok(d) => Some(d),
                Err(description) => {
                    debug!(
                        "no depacketizer for {}/{}: {}",
                        media_type_str,
                        format.encoding_name(),
                        description
                    );
                    None
                }
            }
        });
        self.tracks.push(Track {
            media,
            transport,
            checker: rtp::StrictSequenceChecker::new(None, None),
            timeline: Timeline::new(crate::nonzero_or_one(clock_rate), None),
            udp,
            last_packet_at: None,
            depacketizer,
        });
        Ok(())
    }

    /// `Play(range?)` (§4.7): transitions `Preplay -> Play` and starts the
    /// read loop (driven by [`Session::next`]).
    pub async fn play(&mut self, range: Option<&str>) -> Result<(), Error> {
        if self.state != ClientState::Preplay {
            bail!(ErrorInt::State {
                description: format!("PLAY issued from state {:?}", self.state),
            });
        }
        let url = self.base_url.clone();
        let mut req = self.base_request(Method::Play, url);
        if let Some(range) = range {
            req.header.set(names::RANGE, range.to_string());
        }
        let resp = self.send_recv(req).await?;
        if resp.status != 200 {
            bail!(ErrorInt::Protocol {
                conn_ctx: self.conn_ctx,
                description: format!("PLAY returned {} {}", resp.status, resp.reason),
            });
        }
        self.state = ClientState::Play;
        info!("PLAY succeeded; session {:?}", self.session_id);
        let now = Instant::now();
        for t in &mut self.tracks {
            t.last_packet_at = Some(now);
        }
        Ok(())
    }

    /// `Record` (§4.7): transitions `Prerecord -> Record`.
    pub async fn record(&mut self) -> Result<(), Error> {
        if self.state != ClientState::Prerecord {
            bail!(ErrorInt::State {
                description: format!("RECORD issued from state {:?}", self.state),
            });
        }
        let url = self.base_url.clone();
        let req = self.base_request(Method::Record, url);
        let resp = self.send_recv(req).await?;
        if resp.status != 200 {
            bail!(ErrorInt::Protocol {
                conn_ctx: self.conn_ctx,
                description: format!("RECORD returned {} {}", resp.status, resp.reason),
            });
        }
        self.state = ClientState::Record;
        info!("RECORD succeeded; session {:?}", self.session_id);
        Ok(())
    }

    /// Sends a keepalive (`GET_PARAMETER`, falling back to `OPTIONS`) at
    /// roughly half the negotiated session timeout (§4.7).
    pub async fn send_keepalive(&mut self) -> Result<(), Error> {
        let url = self.base_url.clone();
        let req = self.base_request(Method::GetParameter, url);
        let resp = self.send_recv(req).await?;
        if resp.status == 501 || resp.status == 405 {
            let url = self.base_url.clone();
            let req = self.base_request(Method::Options, url);
            self.send_recv(req).await?;
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.options.keepalive_interval.min(self.session_timeout / 2)
    }

    /// `Close` (§4.7): sends TEARDOWN and returns to `Initial`.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        let url = self.base_url.clone();
        let req = self.base_request(Method::Teardown, url);
        let _ = self.send_recv(req).await?;
        self.state = ClientState::Initial;
        self.writer.shutdown().await.ok();
        info!("session {:?} torn down", self.session_id);
        Ok(())
    }

    /// UDP health check (§4.7, §8.12): true if stream `idx`'s UDP transport
    /// has gone silent for longer than `check_stream_period` since PLAY.
    pub fn udp_stream_is_dead(&self, idx: usize) -> bool {
        match self.tracks.get(idx) {
            Some(t) if matches!(t.transport, TransportSpec::Udp { .. }) => match t.last_packet_at {
                Some(last) => last.elapsed() > self.options.check_stream_period,
                None => false,
            },
            _ => false,
        }
    }

    /// Handles one already-demultiplexed RTP or RTCP datagram (whether it
    /// arrived as an interleaved TCP frame or a UDP packet): sequence/SSRC
    /// checking, timestamp unwrapping, and depacketization, returning the
    /// item to surface to the caller (if any — an RTP packet that only
    /// advances a multi-packet access unit yields nothing yet).
    fn handle_data(
        &mut self,
        idx: usize,
        channel_id: u8,
        is_rtcp: bool,
        payload: Bytes,
        msg_ctx: crate::RtspMessageContext,
    ) -> Result<Option<PacketItem>, Error> {
        let conn_ctx = self.conn_ctx;
        let track = self.tracks.get_mut(idx).ok_or_else(|| {
            wrap!(ErrorInt::Protocol {
                conn_ctx,
                description: format!("channel {} has no SETUP track", channel_id),
            })
        })?;
        track.last_packet_at = Some(Instant::now());
        if is_rtcp {
            let item = track
                .checker
                .rtcp(&self.options, &msg_ctx, &mut track.timeline, idx, payload)
                .map_err(|description| {
                    wrap!(ErrorInt::RtspDataMessageError {
                        conn_ctx,
                        msg_ctx,
                        channel_id,
                        stream_id: idx,
                        description,
                    })
                })?;
            if let Some(PacketItem::SenderReport(sr)) = item {
                return Ok(Some(if track.depacketizer.is_some() {
                    PacketItem::CodecItem(codec::CodecItem::SenderReport(sr))
                } else {
                    PacketItem::SenderReport(sr)
                }));
            }
            return Ok(None);
        }
        let item = track.checker.rtp(
            &self.options,
            &conn_ctx,
            &msg_ctx,
            &mut track.timeline,
            channel_id,
            idx,
            payload,
        )?;
        let pkt = match item {
            Some(PacketItem::RtpPacket(pkt)) => pkt,
            _ => return Ok(None),
        };
        let track = &mut self.tracks[idx];
        let depacketizer = match track.depacketizer.as_mut() {
            None => return Ok(Some(PacketItem::RtpPacket(pkt))),
            Some(d) => d,
        };
        if let Err(description) = depacketizer.push(pkt) {
            warn!("dropping malformed RTP data on stream {}: {}", idx, description);
            return Ok(None);
        }
        Ok(depacketizer.pull(&conn_ctx)?.map(PacketItem::CodecItem))
    }

    /// Pulls the next RTP packet or RTCP sender report from any track,
    /// dispatching interleaved TCP frames and UDP datagrams uniformly.
    pub async fn next(&mut self) -> Result<PacketItem, Error> {
        loop {
            let has_udp = self.tracks.iter().any(|t| t.udp.is_some());
            let source = if !has_udp {
                let (item, ctx) = read_item(&mut self.reader, &self.conn_ctx, Role::Client).await?;
                Source::Tcp(item, ctx)
            } else {
                let reader = &mut self.reader;
                let conn_ctx = &self.conn_ctx;
                let tracks = &self.tracks;
                let tcp_fut: Pin<Box<dyn Future<Output = Result<Source, Error>> + '_>> =
                    Box::pin(async move {
                        let (item, ctx) = read_item(reader, conn_ctx, Role::Client).await?;
                        Ok(Source::Tcp(item, ctx))
                    });
                let mut futs = vec![tcp_fut];
                for (idx, track) in tracks.iter().enumerate() {
                    if let Some(udp) = track.udp.as_ref() {
                        futs.push(Box::pin(async move {
                            let mut buf = vec![0u8; 65_536];
                            let n = udp.recv_rtp(&mut buf).await?;
                            buf.truncate(n);
                            Ok(Source::Udp {
                                idx,
                                is_rtcp: false,
                                data: Bytes::from(buf),
                            })
                        }));
                        futs.push(Box::pin(async move {
                            let mut buf = vec![0u8; 65_536];
                            let n = udp.recv_rtcp(&mut buf).await?;
                            buf.truncate(n);
                            Ok(Source::Udp {
                                idx,
                                is_rtcp: true,
                                data: Bytes::from(buf),
                            })
                        }));
                    }
                }
                let (result, _idx, _rest) = futures::future::select_all(futs).await;
                result?
            };
            match source {
                Source::Tcp(Item::Interleaved(frame), msg_ctx) => {
                    let idx = (frame.channel / 2) as usize;
                    let is_rtcp = frame.channel % 2 == 1;
                    if let Some(item) =
                        self.handle_data(idx, frame.channel, is_rtcp, frame.payload, msg_ctx)?
                    {
                        return Ok(item);
                    }
                }
                Source::Tcp(Item::Response(_), _) => continue,
                Source::Tcp(Item::Request(_), _) => bail!(ErrorInt::Protocol {
                    conn_ctx: self.conn_ctx,
                    description: "client received a request line".into(),
                }),
                Source::Udp { idx, is_rtcp, data } => {
                    let channel_id = (idx as u8) * 2 + u8::from(is_rtcp);
                    let msg_ctx = crate::RtspMessageContext::new(0);
                    if let Some(item) = self.handle_data(idx, channel_id, is_rtcp, data, msg_ctx)? {
                        return Ok(item);
                    }
                }
            }
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

fn parse_session_header(v: &str) -> (String, Option<u64>) {
    match v.split_once(';') {
        Some((sid, rest)) => {
            let secs = rest
                .trim()
                .strip_prefix("timeout=")
                .and_then(|s| s.parse().ok());
            (sid.trim().to_string(), secs)
        }
        None => (v.trim().to_string(), None),
    }
}

fn parse_transport_response(v: &str, channel_id: u8) -> Result<TransportSpec, Error> {
    let mut interleaved = None;
    let mut client_port = None;
    let mut server_port = None;
    for part in v.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("interleaved=") {
            interleaved = parse_port_pair(rest);
        } else if let Some(rest) = part.strip_prefix("client_port=") {
            client_port = parse_port_pair(rest);
        } else if let Some(rest) = part.strip_prefix("server_port=") {
            server_port = parse_port_pair(rest);
        }
    }
    if let Some((a, b)) = interleaved {
        return Ok(TransportSpec::Tcp {
            channels: (a as u8, b as u8),
        });
    }
    let _ = client_port;
    let (a, b) = server_port.unwrap_or((0, 0));
    Ok(TransportSpec::Udp {
        client_ports: (0, 0),
        server_ports: if a == 0 { None } else { Some((a, b)) },
    })
    .map(|t| {
        let _ = channel_id;
        t
    })
}

fn parse_port_pair(s: &str) -> Option<(u16, u16)> {
    let (a, b) = s.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}
