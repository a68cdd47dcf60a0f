// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server-side RTSP request dispatch (§4.8). The teacher (`retina`) only
//! implements the client role; this module's shape — a capability-set
//! handler trait invoked from one dispatch loop per connection, plus a
//! shared session table — is grounded instead in the pack's server-side
//! RTSP implementations (`jburnhams-airplay2-rs`'s response-builder
//! pattern, `Leonezz-media-server`'s per-session dispatch), adapted to
//! this crate's `Error`/`Header`/`Request` types so the whole crate reads
//! as one voice.

pub mod session;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::auth::{self, Credentials, ValidateResult};
use crate::header::names;
use crate::message::{read_item, Item, Method, Request, Response, Role};
use crate::sdp_types::{MediaDescription, SessionDescription};
use crate::transport::TransportSpec;
use crate::{wrap, ConnectionContext, Error, ErrorInt};

pub use session::{ServerSession, ServerSessionState, ServerTrack, SessionTable};

/// Constructor-supplied knobs (§6: `ReadTimeout`, `WriteTimeout`,
/// `SessionTimeout`, `CheckStreamPeriod`, `MulticastIPRange`,
/// `MulticastRTPPort`, `MulticastRTCPPort`); no CLI surface in this crate.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub session_timeout: Duration,
    pub check_stream_period: Duration,
    pub multicast_ip_range: Option<(Ipv4Addr, Ipv4Addr)>,
    pub multicast_rtp_port: u16,
    pub multicast_rtcp_port: u16,
    pub realm: String,
    pub require_auth: Option<Credentials>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(60),
            check_stream_period: Duration::from_secs(15),
            multicast_ip_range: Some((Ipv4Addr::new(224, 1, 0, 0), Ipv4Addr::new(224, 1, 0, 255))),
            multicast_rtp_port: 5004,
            multicast_rtcp_port: 5005,
            realm: "rtsp-core".to_string(),
            require_auth: None,
        }
    }
}

/// The capability set a server handler implements (§4.8). Every method has
/// a no-op default so a handler only overrides what it cares about; the
/// methods with meaningful return values (`on_describe`, `on_announce`,
/// `on_setup`) must be overridden to serve anything.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_conn_open(&self, _ctx: &ConnectionContext) {}
    async fn on_conn_close(&self, _ctx: &ConnectionContext) {}
    async fn on_session_open(&self, _session_id: &str) {}
    async fn on_session_close(&self, _session_id: &str) {}

    /// Returns the SDP session description to serve for `req`'s URL.
    async fn on_describe(&self, req: &Request) -> Result<SessionDescription, Error>;

    /// Accepts a publisher's SDP; the server then expects SETUP+RECORD.
    async fn on_announce(&self, _req: &Request, _sdp: &SessionDescription) -> Result<(), Error> {
        Err(wrap!(ErrorInt::Protocol {
            conn_ctx: ConnectionContext::new(
                "0.0.0.0:0".parse().unwrap(),
                "0.0.0.0:0".parse().unwrap()
            ),
            description: "ANNOUNCE not supported".into(),
        }))
    }

    /// Allocates transport for one media (by index into the session's
    /// track list) and authorizes the SETUP.
    async fn on_setup(&self, req: &Request, media_index: usize) -> Result<(), Error>;

    async fn on_play(&self, _session_id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn on_record(&self, _session_id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn on_pause(&self, _session_id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn on_packet_rtp(&self, _session_id: &str, _stream_id: usize, _packet: &crate::client::rtp::Packet) {}
    async fn on_packet_rtcp(&self, _session_id: &str, _stream_id: usize, _sr: &crate::rtcp::SenderReport) {}
}

fn response(status: u16) -> Response {
    Response::new(status)
}

fn with_cseq(mut resp: Response, req: &Request) -> Response {
    if let Some(cseq) = req.header.get(names::CSEQ) {
        resp.header.set(names::CSEQ, cseq.to_string());
    }
    resp
}

/// Runs the per-connection dispatch loop (§4.8, §5: one task per TCP
/// connection). Returns once the peer closes the connection or a fatal
/// transport error occurs.
pub async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    sessions: SessionTable,
    config: ServerConfig,
) -> Result<(), Error> {
    stream.set_nodelay(true).ok();
    let local_addr = stream.local_addr().map_err(Error::from)?;
    let peer_addr: SocketAddr = stream.peer_addr().map_err(Error::from)?;
    let conn_ctx = ConnectionContext::new(local_addr, peer_addr);
    handler.on_conn_open(&conn_ctx).await;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let nonce = auth::generate_nonce();
    let mut current_session: Option<String> = None;

    loop {
        let item = match timeout(config.read_timeout, read_item(&mut reader, &conn_ctx, Role::Server)).await {
            Ok(Ok((item, _))) => item,
            Ok(Err(e)) => {
                debug!("connection {} closing: {}", conn_ctx, e);
                break;
            }
            Err(_) => {
                debug!("connection {} read timeout", conn_ctx);
                break;
            }
        };
        let req = match item {
            Item::Request(req) => req,
            Item::Interleaved(_) => continue,
            Item::Response(_) => break,
        };

        if let Some(creds) = &config.require_auth {
            match auth::validate(&req, creds, &config.realm, &nonce) {
                ValidateResult::Ok => {}
                _ => {
                    let mut resp = response(401);
                    auth::set_www_authenticate(&mut resp.header, &config.realm, &nonce, true, true);
                    let resp = with_cseq(resp, &req);
                    let bytes = resp.serialize();
                    write_half.write_all(&bytes).await?;
                    write_half.flush().await?;
                    continue;
                }
            }
        }

        let resp = dispatch(&req, &handler, &sessions, &config, &conn_ctx, &mut current_session).await;
        let resp = with_cseq(resp, &req);
        let bytes = resp.serialize();
        write_half.write_all(&bytes).await.map_err(Error::from)?;
        write_half.flush().await.map_err(Error::from)?;

        if req.method == Method::Teardown {
            if let Some(id) = current_session.take() {
                sessions.remove(&id);
                handler.on_session_close(&id).await;
            }
        }
    }

    if let Some(id) = current_session {
        sessions.remove(&id);
        handler.on_session_close(&id).await;
    }
    handler.on_conn_close(&conn_ctx).await;
    Ok(())
}

async fn dispatch(
    req: &Request,
    handler: &Arc<dyn Handler>,
    sessions: &SessionTable,
    config: &ServerConfig,
    conn_ctx: &ConnectionContext,
    current_session: &mut Option<String>,
) -> Response {
    match req.method {
        Method::Options => {
            let mut resp = response(200);
            resp.header.set(
                names::PUBLIC,
                "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, GET_PARAMETER, SET_PARAMETER",
            );
            resp
        }
        Method::Describe => match handler.on_describe(req).await {
            Ok(sdp) => {
                let body = serialize_sdp(&sdp);
                response(200).with_content("application/sdp", body)
            }
            Err(_) => response(404),
        },
        Method::Announce => {
            let sdp = match crate::sdp_types::parse(Some(req.url.clone_without_credentials()), &req.content) {
                Ok(sdp) => sdp,
                Err(_) => return response(400),
            };
            match handler.on_announce(req, &sdp).await {
                Ok(()) => {
                    let session = sessions.create(config.session_timeout);
                    let mut guard = session.lock().unwrap();
                    guard.state = ServerSessionState::Initial;
                    let id = guard.id.clone();
                    drop(guard);
                    *current_session = Some(id.clone());
                    handler.on_session_open(&id).await;
                    let mut resp = response(200);
                    resp.header.set(names::SESSION, id);
                    resp
                }
                Err(_) => response(454),
            }
        }
        Method::Setup => handle_setup(req, handler, sessions, config, current_session).await,
        Method::Play => handle_transition(req, handler, sessions, current_session, ServerSessionState::Play).await,
        Method::Record => {
            handle_transition(req, handler, sessions, current_session, ServerSessionState::Record).await
        }
        Method::Pause => {
            let id = match session_id_for(req, current_session) {
                Some(id) => id,
                None => return response(454),
            };
            match handler.on_pause(&id).await {
                Ok(()) => response(200),
                Err(_) => response(500),
            }
        }
        Method::Teardown => {
            let _ = conn_ctx;
            match session_id_for(req, current_session) {
                Some(_) => response(200),
                None => response(454),
            }
        }
        Method::GetParameter | Method::SetParameter => response(200),
        Method::Redirect | Method::PlayNotify => response(501),
    }
}

fn session_id_for(req: &Request, current_session: &Option<String>) -> Option<String> {
    req.header
        .get(names::SESSION)
        .map(|s| s.to_string())
        .or_else(|| current_session.clone())
}

async fn handle_setup(
    req: &Request,
    handler: &Arc<dyn Handler>,
    sessions: &SessionTable,
    config: &ServerConfig,
    current_session: &mut Option<String>,
) -> Response {
    let media_index = current_session
        .as_ref()
        .and_then(|id| sessions.get(id))
        .map(|s| s.lock().unwrap().tracks.len())
        .unwrap_or(0);

    if let Err(_) = handler.on_setup(req, media_index).await {
        return response(461);
    }

    let transport_header = match req.header.get(names::TRANSPORT) {
        Some(v) => v,
        None => return response(461),
    };
    let transport = match parse_requested_transport(transport_header) {
        Some(t) => t,
        None => return response(461),
    };

    let session = match current_session.as_ref().and_then(|id| sessions.get(id)) {
        Some(s) => s,
        None => {
            let s = sessions.create(config.session_timeout);
            let id = s.lock().unwrap().id.clone();
            *current_session = Some(id.clone());
            handler.on_session_open(&id).await;
            s
        }
    };

    let mut guard = session.lock().unwrap();
    guard.touch();
    guard.tracks.push(ServerTrack {
        media: MediaDescription {
            media_type: crate::sdp_types::MediaType::Video,
            direction: crate::sdp_types::Direction::SendRecv,
            control: None,
            formats: Vec::new(),
            fmtp: std::collections::HashMap::new(),
        },
        transport: transport.clone(),
    });
    let id = guard.id.clone();
    drop(guard);

    let mut resp = response(200);
    resp.header.set(names::SESSION, id);
    resp.header.set(names::TRANSPORT, render_transport(&transport));
    resp
}

async fn handle_transition(
    req: &Request,
    handler: &Arc<dyn Handler>,
    sessions: &SessionTable,
    current_session: &mut Option<String>,
    target: ServerSessionState,
) -> Response {
    let id = match req.header.get(names::SESSION) {
        Some(id) => id.to_string(),
        None => return response(454),
    };
    let session = match sessions.get(&id) {
        Some(s) => s,
        None => return response(454),
    };
    *current_session = Some(id.clone());

    let result = match target {
        ServerSessionState::Play => handler.on_play(&id).await,
        ServerSessionState::Record => handler.on_record(&id).await,
        _ => Ok(()),
    };
    match result {
        Ok(()) => {
            let mut guard = session.lock().unwrap();
            guard.touch();
            guard.state = target;
            response(200)
        }
        Err(_) => response(455),
    }
}

fn parse_requested_transport(v: &str) -> Option<TransportSpec> {
    for part in v.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("interleaved=") {
            let (a, b) = rest.split_once('-')?;
            return Some(TransportSpec::Tcp {
                channels: (a.parse().ok()?, b.parse().ok()?),
            });
        }
        if let Some(rest) = part.strip_prefix("client_port=") {
            let (a, b) = rest.split_once('-')?;
            return Some(TransportSpec::Udp {
                client_ports: (a.parse().ok()?, b.parse().ok()?),
                server_ports: None,
            });
        }
    }
    None
}

fn render_transport(t: &TransportSpec) -> String {
    match t {
        TransportSpec::Tcp { channels } => {
            format!("RTP/AVP/TCP;unicast;interleaved={}-{}", channels.0, channels.1)
        }
        TransportSpec::Udp { client_ports, server_ports } => {
            let server = server_ports.unwrap_or((0, 0));
            format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_ports.0, client_ports.1, server.0, server.1
            )
        }
    }
}

fn serialize_sdp(sdp: &SessionDescription) -> bytes::Bytes {
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str("o=- 0 0 IN IP4 0.0.0.0\r\n");
    out.push_str("s=rtsp-core\r\n");
    out.push_str("t=0 0\r\n");
    for media in &sdp.medias {
        let kind = match media.media_type {
            crate::sdp_types::MediaType::Video => "video",
            crate::sdp_types::MediaType::Audio => "audio",
            crate::sdp_types::MediaType::Application => "application",
        };
        let pts: Vec<String> = media.formats.iter().map(|f| f.payload_type().to_string()).collect();
        out.push_str(&format!("m={} 0 RTP/AVP {}\r\n", kind, pts.join(" ")));
        for f in &media.formats {
            out.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                f.payload_type(),
                f.encoding_name(),
                f.clock_rate()
            ));
        }
        if let Some(control) = &media.control {
            out.push_str(&format!("a=control:{}\r\n", control));
        }
    }
    bytes::Bytes::from(out.into_bytes())
}

/// Periodically sweeps `sessions` for idle timeout, invoking
/// `on_session_close` for each evicted session (§4.8, §5).
pub async fn run_session_reaper(sessions: SessionTable, handler: Arc<dyn Handler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for id in sessions.sweep_expired() {
            warn!("session {} timed out", id);
            handler.on_session_close(&id).await;
        }
    }
}

/// Joins the server's multicast sender group for one stream, binding the
/// configured `(group, port)` pair the way every reader of that stream
/// will (§4.8's "one `(group, port)` pair per stream across all readers").
pub async fn join_multicast_sender(config: &ServerConfig) -> Result<tokio::net::UdpSocket, Error> {
    let (low, _high) = config
        .multicast_ip_range
        .ok_or_else(|| wrap!(ErrorInt::Transport {
            conn_ctx: ConnectionContext::new("0.0.0.0:0".parse().unwrap(), "0.0.0.0:0".parse().unwrap()),
            description: "no multicast IP range configured".into(),
        }))?;
    let socket = tokio::net::UdpSocket::bind(("0.0.0.0", config.multicast_rtp_port))
        .await
        .map_err(Error::from)?;
    socket.set_multicast_ttl_v4(16).map_err(Error::from)?;
    socket.join_multicast_v4(low, Ipv4Addr::UNSPECIFIED).map_err(Error::from)?;
    Ok(socket)
}
