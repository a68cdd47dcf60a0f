// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal RTSP client CLI: connects, `DESCRIBE`s, `SETUP`s every media,
//! `PLAY`s, and logs each depacketized frame (or raw packet/sender report)
//! until the connection ends. Not part of the library crate proper — a
//! thin driver to exercise [`rtsp_core::client`] end to end.

use std::str::FromStr;

use anyhow::Error;
use log::{error, info, warn};
use structopt::StructOpt;

use rtsp_core::auth::Credentials;
use rtsp_core::client::{ClientState, PacketItem, Session, SessionOptions};
use rtsp_core::codec::CodecItem;
use rtsp_core::RtspUrl;

#[derive(StructOpt)]
struct Opts {
    #[structopt(long, parse(try_from_str = RtspUrl::parse))]
    url: RtspUrl,

    #[structopt(long, requires = "password")]
    username: Option<String>,

    #[structopt(long, requires = "username")]
    password: Option<String>,

    /// Use interleaved TCP transport instead of negotiating UDP first.
    #[structopt(long)]
    prefer_tcp: bool,
}

fn init_logging() -> mylog::Handle {
    let h = mylog::Builder::new()
        .set_format(
            ::std::env::var("RTSP_CORE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(::std::env::var("RTSP_CORE_LOG").as_deref().unwrap_or("info"))
        .build();
    h.clone().install().unwrap();
    h
}

/// Interprets the `username`/`password` pair `structopt`'s mutual
/// `requires` guarantees are either both present or both absent.
fn creds(username: Option<String>, password: Option<String>) -> Option<Credentials> {
    match (username, password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        (None, None) => None,
        _ => unreachable!(),
    }
}

#[tokio::main]
async fn main() {
    let mut h = init_logging();
    if let Err(e) = {
        let _a = h.async_scope();
        main_inner().await
    } {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
    info!("Done");
}

async fn main_inner() -> Result<(), Error> {
    let opts = Opts::from_args();
    let options = SessionOptions {
        creds: creds(opts.username, opts.password),
        prefer_tcp: opts.prefer_tcp,
        ..SessionOptions::default()
    };
    let mut session = Session::connect(&opts.url, options)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let sdp = session
        .describe(&opts.url)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("described {} media", sdp.medias.len());
    session
        .setup_all(sdp.medias)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    session.play(None).await.map_err(|e| anyhow::anyhow!("{}", e))?;

    let mut keepalive = tokio::time::interval(session.keepalive_interval());
    keepalive.tick().await; // first tick fires immediately; skip it.

    loop {
        tokio::select! {
            item = session.next() => {
                match item {
                    Ok(PacketItem::CodecItem(CodecItem::VideoFrame(f))) => {
                        info!("video frame: {} bytes, loss {}", f.data().len(), f.loss);
                    }
                    Ok(PacketItem::CodecItem(CodecItem::AudioFrame(f))) => {
                        info!("audio frame: {} bytes", f.data.len());
                    }
                    Ok(PacketItem::CodecItem(CodecItem::MessageFrame(_))) => {
                        info!("ONVIF metadata message");
                    }
                    Ok(PacketItem::CodecItem(CodecItem::SenderReport(sr))) => {
                        info!("sender report on stream {}", sr.stream_id);
                    }
                    Ok(PacketItem::RtpPacket(p)) => {
                        warn!("undepacketized RTP packet, {} bytes", p.payload.len());
                    }
                    Ok(PacketItem::SenderReport(sr)) => {
                        info!("sender report on stream {}", sr.stream_id);
                    }
                    Err(e) => return Err(anyhow::anyhow!("{}", e)),
                }
            }
            _ = keepalive.tick() => {
                if session.state() == ClientState::Play {
                    session.send_keepalive().await.map_err(|e| anyhow::anyhow!("{}", e))?;
                }
            }
        }
    }
}
