#![no_main]

use std::num::NonZeroU32;
use std::time::SystemTime;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use rtsp_core::client::Packet;
use rtsp_core::codec::Depacketizer;
use rtsp_core::{ConnectionContext, RtspMessageContext, Timestamp};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let mut depacketizer = match Depacketizer::new("video", "h264", 90_000, None, None) {
        Ok(d) => d,
        Err(_) => return,
    };
    let conn_ctx = ConnectionContext::new("0.0.0.0:0".parse().unwrap(), "0.0.0.0:0".parse().unwrap());
    let clock_rate = NonZeroU32::new(90_000).unwrap();

    // Split the fuzz input into chunks and feed each as one RTP packet's
    // payload, so FU-A/STAP-A reassembly across several pushes gets exercised
    // alongside the single-NAL path.
    for (i, chunk) in data.chunks(512).enumerate() {
        let pkt = Packet {
            ctx: RtspMessageContext::new(i as u64),
            channel_id: 0,
            stream_id: 0,
            timestamp: Timestamp::new(i as i64 * 3000, clock_rate, SystemTime::UNIX_EPOCH),
            ssrc: 0x1234_5678,
            sequence_number: i as u16,
            loss: 0,
            mark: i + 1 == data.chunks(512).count(),
            payload: Bytes::copy_from_slice(chunk),
        };
        let _ = depacketizer.push(pkt);
        while let Ok(Some(_)) = depacketizer.pull(&conn_ctx) {}
    }
});
