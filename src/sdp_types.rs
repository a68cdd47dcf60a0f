// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured session/media descriptors (§3's `MediaDescription`/
//! `SessionDescription`).
//!
//! The SDP *text* grammar itself is an external collaborator's job — we
//! lean on the `sdp` crate (already part of the teacher's dependency
//! graph) to turn `m=`/`a=` lines into a parse tree, and only own the
//! RTSP-shaped structured form the rest of this crate actually consumes:
//! per-media `Format`s with their RTSP-relevant capability set
//! (`payload_type`, `clock_rate`, `rtpmap`/`fmtp` strings), direction, and
//! control-path resolution against a session base URL (RFC 2326 Appendix
//! C.1.1).

use std::io::{BufReader, Cursor};

use crate::url::RtspUrl;
use crate::{bail, wrap, ConnectionContext, Error, ErrorInt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
}

/// Per-codec RTSP-relevant parameters, as carried in an SDP `a=fmtp` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Format {
    H264 {
        payload_type: u8,
        clock_rate: u32,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
        packetization_mode: u8,
    },
    H265 {
        payload_type: u8,
        clock_rate: u32,
        vps: Option<Vec<u8>>,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
    },
    Mpeg4Audio {
        payload_type: u8,
        clock_rate: u32,
        config: Option<Vec<u8>>,
    },
    Opus {
        payload_type: u8,
        clock_rate: u32,
        channels: u16,
    },
    G711 {
        payload_type: u8,
        clock_rate: u32,
        alaw: bool,
    },
    G722 {
        payload_type: u8,
        clock_rate: u32,
    },
    Vp8 {
        payload_type: u8,
        clock_rate: u32,
    },
    Vp9 {
        payload_type: u8,
        clock_rate: u32,
    },
    Generic {
        payload_type: u8,
        clock_rate: u32,
        encoding_name: String,
        format_specific_params: Option<String>,
    },
}

impl Format {
    pub fn payload_type(&self) -> u8 {
        match self {
            Format::H264 { payload_type, .. }
            | Format::H265 { payload_type, .. }
            | Format::Mpeg4Audio { payload_type, .. }
            | Format::Opus { payload_type, .. }
            | Format::G711 { payload_type, .. }
            | Format::G722 { payload_type, .. }
            | Format::Vp8 { payload_type, .. }
            | Format::Vp9 { payload_type, .. }
            | Format::Generic { payload_type, .. } => *payload_type,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::H264 { clock_rate, .. }
            | Format::H265 { clock_rate, .. }
            | Format::Mpeg4Audio { clock_rate, .. }
            | Format::Opus { clock_rate, .. }
            | Format::G711 { clock_rate, .. }
            | Format::G722 { clock_rate, .. }
            | Format::Vp8 { clock_rate, .. }
            | Format::Vp9 { clock_rate, .. }
            | Format::Generic { clock_rate, .. } => *clock_rate,
        }
    }

    pub fn encoding_name(&self) -> &str {
        match self {
            Format::H264 { .. } => "h264",
            Format::H265 { .. } => "h265",
            Format::Mpeg4Audio { .. } => "mpeg4-generic",
            Format::Opus { .. } => "opus",
            Format::G711 { alaw, .. } => {
                if *alaw {
                    "pcma"
                } else {
                    "pcmu"
                }
            }
            Format::G722 { .. } => "g722",
            Format::Vp8 { .. } => "vp8",
            Format::Vp9 { .. } => "vp9",
            Format::Generic { encoding_name, .. } => encoding_name,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub direction: Direction,
    /// The raw `a=control` value, if present: an absolute URL, a relative
    /// path, or empty (meaning "use the session/aggregate URL").
    pub control: Option<String>,
    pub formats: Vec<Format>,
    /// Raw `a=fmtp` text by payload type, kept alongside the already-parsed
    /// [`Format`]s so a depacketizer that wants more than the fields a
    /// `Format` variant extracts (eg AAC's `sizelength`/`indexlength`) can
    /// still get at it.
    pub fmtp: std::collections::HashMap<u8, String>,
}

impl MediaDescription {
    /// Resolves this media's control attribute against `base`, per RFC
    /// 2326 Appendix C.1.1.
    pub fn control_url(&self, base: &RtspUrl) -> Result<RtspUrl, Error> {
        base.resolve(self.control.as_deref().unwrap_or(""))
    }

    /// The raw `a=fmtp` text for `format`, if the session description
    /// carried one.
    pub fn fmtp_for(&self, format: &Format) -> Option<&str> {
        self.fmtp.get(&format.payload_type()).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct SessionDescription {
    pub medias: Vec<MediaDescription>,
    /// Carried in a `Content-Base` header (client DESCRIBE) or the
    /// request URL (server ANNOUNCE); control paths resolve relative to
    /// this.
    pub base_url: Option<RtspUrl>,
}

fn bad_sdp(description: String) -> Error {
    wrap!(ErrorInt::Protocol {
        conn_ctx: ConnectionContext::new(
            "0.0.0.0:0".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
        ),
        description,
    })
}

fn fmtp_param<'a>(fmtp: &'a str, key: &str) -> Option<&'a str> {
    fmtp.split(';').find_map(|kv| {
        let kv = kv.trim();
        let (k, v) = kv.split_once('=')?;
        if k.trim().eq_ignore_ascii_case(key) {
            Some(v.trim())
        } else {
            None
        }
    })
}

fn decode_base64_param(v: &str) -> Option<Vec<u8>> {
    base64::decode(v).ok()
}

fn format_from_rtpmap(
    media: &str,
    payload_type: u8,
    encoding_name: &str,
    clock_rate: u32,
    fmtp: Option<&str>,
) -> Format {
    let lower = encoding_name.to_ascii_lowercase();
    match (media, lower.as_str()) {
        ("video", "h264") => {
            let mut sps = None;
            let mut pps = None;
            let mut packetization_mode = 0;
            if let Some(fmtp) = fmtp {
                if let Some(mode) = fmtp_param(fmtp, "packetization-mode") {
                    packetization_mode = mode.parse().unwrap_or(0);
                }
                if let Some(spropparams) = fmtp_param(fmtp, "sprop-parameter-sets") {
                    let mut it = spropparams.split(',');
                    sps = it.next().and_then(decode_base64_param);
                    pps = it.next().and_then(decode_base64_param);
                }
            }
            Format::H264 {
                payload_type,
                clock_rate,
                sps,
                pps,
                packetization_mode,
            }
        }
        ("video", "h265") | ("video", "hevc") => {
            let mut vps = None;
            let mut sps = None;
            let mut pps = None;
            if let Some(fmtp) = fmtp {
                vps = fmtp_param(fmtp, "sprop-vps").and_then(decode_base64_param);
                sps = fmtp_param(fmtp, "sprop-sps").and_then(decode_base64_param);
                pps = fmtp_param(fmtp, "sprop-pps").and_then(decode_base64_param);
            }
            Format::H265 {
                payload_type,
                clock_rate,
                vps,
                sps,
                pps,
            }
        }
        ("video", "vp8") => Format::Vp8 {
            payload_type,
            clock_rate,
        },
        ("video", "vp9") => Format::Vp9 {
            payload_type,
            clock_rate,
        },
        ("audio", "mpeg4-generic") => {
            let config = fmtp
                .and_then(|fmtp| fmtp_param(fmtp, "config"))
                .and_then(|hex_str| hex::decode(hex_str).ok());
            Format::Mpeg4Audio {
                payload_type,
                clock_rate,
                config,
            }
        }
        ("audio", "opus") => Format::Opus {
            payload_type,
            clock_rate,
            channels: 2,
        },
        ("audio", "pcma") => Format::G711 {
            payload_type,
            clock_rate,
            alaw: true,
        },
        ("audio", "pcmu") => Format::G711 {
            payload_type,
            clock_rate,
            alaw: false,
        },
        ("audio", "g722") => Format::G722 {
            payload_type,
            clock_rate,
        },
        _ => Format::Generic {
            payload_type,
            clock_rate,
            encoding_name: encoding_name.to_string(),
            format_specific_params: fmtp.map(|s| s.to_string()),
        },
    }
}

/// Parses raw SDP bytes (as delivered in a DESCRIBE response's or an
/// ANNOUNCE request's body) into a [`SessionDescription`].
pub fn parse(content_base: Option<RtspUrl>, body: &[u8]) -> Result<SessionDescription, Error> {
    let mut reader = BufReader::new(Cursor::new(body));
    let raw = sdp::SessionDescription::unmarshal(&mut reader)
        .map_err(|e| bad_sdp(format!("invalid SDP: {}", e)))?;

    let mut medias = Vec::new();
    for md in &raw.media_descriptions {
        let media_type = match md.media_name.media.as_str() {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "application" => MediaType::Application,
            other => bail!(ErrorInt::Protocol {
                conn_ctx: ConnectionContext::new(
                    "0.0.0.0:0".parse().unwrap(),
                    "0.0.0.0:0".parse().unwrap(),
                ),
                description: format!("unsupported SDP media type {:?}", other),
            }),
        };

        let mut direction = Direction::SendRecv;
        let mut control = None;
        let mut rtpmaps: std::collections::HashMap<u8, (String, u32)> =
            std::collections::HashMap::new();
        let mut fmtps: std::collections::HashMap<u8, String> = std::collections::HashMap::new();

        for attr in &md.attributes {
            match attr.key.as_str() {
                "sendonly" => direction = Direction::SendOnly,
                "recvonly" => direction = Direction::RecvOnly,
                "sendrecv" => direction = Direction::SendRecv,
                "control" => control = attr.value.clone(),
                "rtpmap" => {
                    if let Some(v) = &attr.value {
                        if let Some((pt_str, rest)) = v.split_once(' ') {
                            if let Ok(pt) = pt_str.parse::<u8>() {
                                let mut parts = rest.splitn(2, '/');
                                let name = parts.next().unwrap_or("").to_string();
                                let rate = parts.next().and_then(|s| {
                                    s.splitn(2, '/').next().and_then(|r| r.parse().ok())
                                });
                                rtpmaps.insert(pt, (name, rate.unwrap_or(0)));
                            }
                        }
                    }
                }
                "fmtp" => {
                    if let Some(v) = &attr.value {
                        if let Some((pt_str, rest)) = v.split_once(' ') {
                            if let Ok(pt) = pt_str.parse::<u8>() {
                                fmtps.insert(pt, rest.to_string());
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let mut formats = Vec::new();
        for fmt_str in &md.media_name.formats {
            let pt: u8 = match fmt_str.parse() {
                Ok(pt) => pt,
                Err(_) => continue,
            };
            let (encoding_name, clock_rate) = rtpmaps
                .get(&pt)
                .cloned()
                .unwrap_or_else(|| (format!("pt{}", pt), 0));
            let fmtp = fmtps.get(&pt).map(|s| s.as_str());
            formats.push(format_from_rtpmap(
                md.media_name.media.as_str(),
                pt,
                &encoding_name,
                clock_rate,
                fmtp,
            ));
        }

        medias.push(MediaDescription {
            media_type,
            direction,
            control,
            formats,
            fmtp: fmtps,
        });
    }

    Ok(SessionDescription {
        medias,
        base_url: content_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=No Name\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z0IAHpZUBQfsQA==,aM4wpIA=\r\n\
a=control:trackID=0\r\n";

    #[test]
    fn parses_h264_media_with_control_and_sprop() {
        let base = RtspUrl::parse("rtsp://host/stream").unwrap();
        let sd = parse(Some(base.clone()), FIXTURE).unwrap();
        assert_eq!(sd.medias.len(), 1);
        let m = &sd.medias[0];
        assert_eq!(m.media_type, MediaType::Video);
        assert_eq!(m.control.as_deref(), Some("trackID=0"));
        let url = m.control_url(&base).unwrap();
        assert_eq!(url.path_and_query(), "/trackID=0");
        match &m.formats[0] {
            Format::H264 {
                payload_type,
                clock_rate,
                sps,
                packetization_mode,
                ..
            } => {
                assert_eq!(*payload_type, 96);
                assert_eq!(*clock_rate, 90000);
                assert_eq!(*packetization_mode, 1);
                assert!(sps.is_some());
            }
            other => panic!("expected H264, got {:?}", other),
        }
    }
}
