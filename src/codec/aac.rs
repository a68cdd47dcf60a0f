// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC audio packetized per
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640) ("AAC-hbr"
//! mode only; interleaving and AAC-lbr are out of scope). Each RTP packet
//! carries an AU-header section (one header per access unit, giving each
//! AU's size in bytes) followed by the AU payloads themselves back to back.

use std::collections::VecDeque;
use std::num::{NonZeroU16, NonZeroU32};

use bytes::Bytes;

use crate::{ConnectionContext, Error};

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

/// A minimal big-endian bit cursor, used only to read the AU-header
/// section's packed bitfields (widths given by the `sizelength`/
/// `indexlength`/`indexdeltalength` fmtp parameters).
struct BitCursor<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    fn read(&mut self, n: usize) -> Result<u32, String> {
        if n == 0 {
            return Ok(0);
        }
        if n > 32 {
            return Err("AU-header field wider than 32 bits".to_string());
        }
        let mut v: u32 = 0;
        for _ in 0..n {
            let byte = self.bit_pos / 8;
            if byte >= self.data.len() {
                return Err("AU-header section truncated".to_string());
            }
            let bit = 7 - (self.bit_pos % 8);
            let b = (self.data[byte] >> bit) & 1;
            v = (v << 1) | u32::from(b);
            self.bit_pos += 1;
        }
        Ok(v)
    }

    fn byte_pos_rounded_up(&self) -> usize {
        (self.bit_pos + 7) / 8
    }
}

#[derive(Debug, Clone)]
struct Config {
    size_length: usize,
    index_length: usize,
    index_delta_length: usize,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    extra_data: Bytes,
}

fn parse_format_specific_params(
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    fmtp: &str,
) -> Result<Config, String> {
    let mut mode: Option<String> = None;
    let mut size_length = 0usize;
    let mut index_length = 0usize;
    let mut index_delta_length = 0usize;
    let mut config: Option<Vec<u8>> = None;
    for kv in fmtp.split(';') {
        let kv = kv.trim();
        let mut parts = kv.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let value = parts.next().unwrap_or("").trim();
        match key.as_str() {
            "mode" => mode = Some(value.to_ascii_lowercase()),
            "sizelength" => {
                size_length = value
                    .parse()
                    .map_err(|_| format!("bad sizelength {}", value))?
            }
            "indexlength" => {
                index_length = value
                    .parse()
                    .map_err(|_| format!("bad indexlength {}", value))?
            }
            "indexdeltalength" => {
                index_delta_length = value
                    .parse()
                    .map_err(|_| format!("bad indexdeltalength {}", value))?
            }
            "config" => {
                config = Some(
                    hex::decode(value).map_err(|e| format!("bad config hex {}: {}", value, e))?,
                );
            }
            _ => {}
        }
    }
    if mode.as_deref() != Some("aac-hbr") {
        return Err(format!(
            "unsupported AAC mode {:?}; only AAC-hbr is implemented",
            mode
        ));
    }
    if size_length == 0 {
        return Err("AAC fmtp is missing sizelength".to_string());
    }
    let config = config.ok_or_else(|| "AAC fmtp is missing config".to_string())?;
    Ok(Config {
        size_length,
        index_length,
        index_delta_length,
        clock_rate,
        channels,
        extra_data: Bytes::from(config),
    })
}

/// Best-effort `AudioSpecificConfig` sample-rate/channel extraction, used
/// only to sanity-check the fmtp-declared clock rate against the config's
/// own `samplingFrequencyIndex` when that index isn't the escape value (15,
/// explicit 24-bit frequency, which this doesn't decode).
fn sanity_check_sampling_frequency(config: &[u8], clock_rate: u32) -> Result<(), String> {
    if config.len() < 2 {
        return Err("AAC config too short".to_string());
    }
    let sampling_frequency_index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
    if sampling_frequency_index == 0x0f {
        // Explicit frequency follows; not decoded here.
        return Ok(());
    }
    if let Some(&rate) = SAMPLE_RATES.get(sampling_frequency_index as usize) {
        if rate != clock_rate {
            return Err(format!(
                "AAC config's sampling frequency {} doesn't match RTP clock rate {}",
                rate, clock_rate
            ));
        }
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    config: Config,
    pending: VecDeque<super::AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let fmtp = format_specific_params
            .ok_or_else(|| "AAC requires a fmtp attribute".to_string())?;
        let config = parse_format_specific_params(clock_rate, channels, fmtp)?;
        sanity_check_sampling_frequency(&config.extra_data, clock_rate)?;
        Ok(Self {
            config,
            pending: VecDeque::new(),
        })
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Audio(super::AudioParameters {
            rfc6381_codec: Some("mp4a.40.2".to_string()),
            frame_length: NonZeroU32::new(1024),
            clock_rate: self.config.clock_rate,
            extra_data: self.config.extra_data.clone(),
            sample_entry: None,
        }))
    }

    pub(super) fn push(&mut self, pkt: crate::client::rtp::Packet) -> Result<(), String> {
        if pkt.payload.len() < 2 {
            return Err("AAC RTP payload too short for AU-headers-length".to_string());
        }
        let au_headers_length_bits =
            usize::from(u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]));
        let header_section = &pkt.payload[2..];
        let mut cursor = BitCursor::new(header_section);
        let first_header_bits = self.config.size_length + self.config.index_length;
        let later_header_bits = self.config.size_length + self.config.index_delta_length;
        if first_header_bits == 0 {
            return Err("AAC fmtp produced a zero-width AU header".to_string());
        }
        let mut sizes = Vec::new();
        let mut consumed_bits = 0usize;
        let mut first = true;
        while consumed_bits < au_headers_length_bits {
            let width = if first { first_header_bits } else { later_header_bits };
            let size = cursor.read(self.config.size_length)?;
            if self.config.index_length > 0 || self.config.index_delta_length > 0 {
                let idx_width = if first {
                    self.config.index_length
                } else {
                    self.config.index_delta_length
                };
                cursor.read(idx_width)?;
            }
            sizes.push(size as usize);
            consumed_bits += width;
            first = false;
        }
        let data_start = 2 + cursor.byte_pos_rounded_up();
        let mut pos = data_start;
        for size in sizes {
            if pos + size > pkt.payload.len() {
                return Err("AAC AU data runs past the end of the RTP payload".to_string());
            }
            self.pending.push_back(super::AudioFrame {
                ctx: pkt.ctx,
                stream_id: pkt.stream_id,
                timestamp: pkt.timestamp,
                frame_length: NonZeroU32::new(1024).unwrap(),
                loss: pkt.loss,
                data: pkt.payload.slice(pos..pos + size),
            });
            pos += size;
        }
        Ok(())
    }

    pub(super) fn pull(&mut self, conn_ctx: &ConnectionContext) -> Result<Option<super::CodecItem>, Error> {
        let _ = conn_ctx;
        Ok(self.pending.pop_front().map(super::CodecItem::AudioFrame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aac_hbr_fmtp() {
        let fmtp = "streamtype=5; profile-level-id=15; mode=AAC-hbr; sizelength=13; indexlength=3; indexdeltalength=3; config=1190";
        let config = parse_format_specific_params(44_100, None, fmtp).unwrap();
        assert_eq!(config.size_length, 13);
        assert_eq!(&config.extra_data[..], &[0x11, 0x90]);
    }

    #[test]
    fn depacketizes_single_au_packet() {
        let mut dep = Depacketizer::new(
            44_100,
            None,
            Some("mode=AAC-hbr; sizelength=13; indexlength=3; indexdeltalength=3; config=1190"),
        )
        .unwrap();
        // AU-headers-length = 16 bits (one header: 13 size bits + 3 index bits).
        let mut payload = vec![0u8, 16];
        // size=4 (0b0000000000100), index=0 -> packed big-endian into 2 bytes.
        payload.push(0b0000_0000);
        payload.push(0b0100_000);
        // pad to byte boundary handled by BitCursor rounding.
        payload.push(0xAA);
        payload.push(0xBB);
        payload.push(0xCC);
        payload.push(0xDD);
        let pkt = crate::client::rtp::Packet {
            ctx: crate::RtspMessageContext::new(0),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(
                0,
                std::num::NonZeroU32::new(44_100).unwrap(),
                std::time::SystemTime::UNIX_EPOCH,
            ),
            ssrc: 1,
            sequence_number: 0,
            loss: 0,
            mark: true,
            payload: Bytes::from(payload),
        };
        dep.push(pkt).unwrap();
        let conn_ctx = ConnectionContext::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        );
        let item = dep.pull(&conn_ctx).unwrap().unwrap();
        match item {
            super::super::CodecItem::AudioFrame(f) => {
                assert_eq!(&f.data[..], &[0xAA, 0xBB, 0xCC, 0xDD]);
            }
            _ => panic!("expected audio frame"),
        }
    }
}
