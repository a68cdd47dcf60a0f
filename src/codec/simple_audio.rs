// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Simple fixed-bitrate audio codecs (G.711 mu-law/A-law, G.722, DVI4,
//! G.726 variants, L16) as specified in
//! [RFC 3551](https://datatracker.ietf.org/doc/html/rfc3551). Each RTP
//! packet is exactly one audio frame; there's no aggregation or
//! fragmentation to reassemble.

#[derive(Debug)]
pub(crate) struct Depacketizer {
    bits_per_sample: u32,
    pending: Option<super::AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, bits_per_sample: u32) -> Self {
        let _ = clock_rate;
        Self {
            bits_per_sample,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Audio(super::AudioParameters {
            rfc6381_codec: None,
            frame_length: None,
            clock_rate: 0,
            extra_data: bytes::Bytes::new(),
            sample_entry: None,
        }))
    }

    pub(super) fn push(&mut self, pkt: crate::client::rtp::Packet) -> Result<(), String> {
        if pkt.payload.is_empty() {
            return Err("empty simple-audio RTP payload".to_string());
        }
        let _ = self.bits_per_sample;
        self.pending = Some(super::AudioFrame {
            ctx: pkt.ctx,
            loss: pkt.loss,
            stream_id: pkt.stream_id,
            timestamp: pkt.timestamp,
            frame_length: crate::nonzero_or_one(pkt.payload.len() as u32),
            data: pkt.payload,
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(super::CodecItem::AudioFrame)
    }
}
