// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Benchmarks H.264 RTP depacketization (§4.5): packetizes a synthetic
//! 50 KiB NALU into FU-A fragments, then measures the cost of reassembling
//! it back into an access unit through the public
//! [`rtsp_core::codec::Depacketizer`] facade (the same path a `PLAY`ing
//! client's read loop runs once per RTP packet).

use std::num::NonZeroU32;
use std::time::SystemTime;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use rtsp_core::client::rtp::Packet;
use rtsp_core::codec::h264::Packetizer;
use rtsp_core::codec::{CodecItem, Depacketizer};
use rtsp_core::{ConnectionContext, RtspMessageContext};

/// A single NAL unit (type 1, non-IDR slice) large enough to require
/// several FU-A fragments at a 1460-byte `PayloadMaxSize`.
fn synthetic_nalu() -> Bytes {
    let mut data = vec![0x41u8]; // forbidden_zero=0, nal_ref_idc=2, type=1
    data.extend(std::iter::repeat(0xab).take(50 * 1024));
    Bytes::from(data)
}

fn conn_ctx() -> ConnectionContext {
    ConnectionContext::new(
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:554".parse().unwrap(),
    )
}

fn rtp_packet(seq: u16, mark: bool, payload: Bytes) -> Packet {
    Packet {
        ctx: RtspMessageContext::new(0),
        channel_id: 0,
        stream_id: 0,
        timestamp: rtsp_core::Timestamp::new(90_000, NonZeroU32::new(90_000).unwrap(), SystemTime::UNIX_EPOCH),
        ssrc: 0x1234_5678,
        sequence_number: seq,
        loss: 0,
        mark,
        payload,
    }
}

fn bench_depacketize(c: &mut Criterion) {
    let nalu = synthetic_nalu();
    let packets = Packetizer::new(1460).packetize(&[nalu]).unwrap();
    let ctx = conn_ctx();

    c.bench_function("h264_depacketize_50kb_nalu", |b| {
        b.iter(|| {
            let mut dep = Depacketizer::new("video", "h264", 90_000, None, None).unwrap();
            for (i, p) in packets.iter().enumerate() {
                let pkt = rtp_packet(i as u16, p.marker, p.payload.clone());
                dep.push(pkt).unwrap();
            }
            let mut frames = 0;
            while let Some(item) = dep.pull(&ctx).unwrap() {
                if matches!(item, CodecItem::VideoFrame(_)) {
                    frames += 1;
                }
            }
            assert_eq!(frames, 1);
        });
    });
}

criterion_group!(benches, bench_depacketize);
criterion_main!(benches);
