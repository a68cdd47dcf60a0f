// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ONVIF metadata streams, carried as RTP "application" media with a
//! `vnd.onvif.metadata*` encoding name. Each packet is one message frame;
//! no fragmentation is defined for this payload type.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionType {
    Uncompressed,
    GzipCompressed,
    ExiDefault,
    ExiInBand,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    compression_type: CompressionType,
    pending: Option<super::CodecItem>,
}

impl Depacketizer {
    pub(super) fn new(compression_type: CompressionType) -> Self {
        Self {
            compression_type,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Message(super::MessageParameters(
            self.compression_type,
        )))
    }

    pub(super) fn push(&mut self, pkt: crate::client::rtp::Packet) -> Result<(), String> {
        self.pending = Some(super::CodecItem::MessageFrame(super::MessageFrame {
            ctx: pkt.ctx,
            timestamp: pkt.timestamp,
            stream_id: pkt.stream_id,
            loss: pkt.loss,
            data: pkt.payload,
        }));
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take()
    }
}
