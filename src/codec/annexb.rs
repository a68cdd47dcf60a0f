// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Annex-B (start-code-delimited) and AVCC (length-prefixed) NALU framings,
//! shared by H.264 and H.265 (§4.3).
//!
//! Both codecs' SPS/PPS parsers, and every depacketizer's Annex-B-sniff
//! path, round-trip through the `Vec<Bytes>` NALU-list form these functions
//! produce and consume.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{MAX_ACCESS_UNIT_SIZE, MAX_NALUS_PER_GROUP, MAX_NALU_SIZE};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("no start code found")]
    NoStartCode,
    #[error("empty NALU")]
    EmptyNalu,
    #[error("NALU of {0} bytes exceeds the {1}-byte limit")]
    NaluTooLarge(usize, usize),
    #[error("{0} NALUs exceeds the {1}-NALU-per-group limit")]
    TooManyNalus(usize, usize),
    #[error("truncated AVCC length prefix")]
    TruncatedLengthPrefix,
    #[error("AVCC length prefix {0} exceeds remaining {1} bytes")]
    TruncatedNalu(usize, usize),
    #[error("access unit of {0} bytes exceeds the {1}-byte limit")]
    AccessUnitTooLarge(usize, usize),
}

/// Splits an Annex-B byte stream (one or more NALUs, each preceded by a
/// 3- or 4-byte `00 00 01` / `00 00 00 01` start code) into a list of NALU
/// payloads (start codes stripped).
pub fn annexb_unmarshal(data: &[u8]) -> Result<Vec<Bytes>, FramingError> {
    let mut out = Vec::new();
    let mut total = 0usize;
    let starts = find_start_codes(data);
    if starts.is_empty() {
        return Err(FramingError::NoStartCode);
    }
    for w in 0..starts.len() {
        let (body_start, _code_len) = starts[w];
        let end = if w + 1 < starts.len() {
            // Back up over the next start code (and any trailing zero
            // padding immediately before it — some encoders zero-pad
            // between NALUs).
            starts[w + 1].2
        } else {
            data.len()
        };
        if body_start > end {
            continue;
        }
        let nalu = &data[body_start..end];
        let nalu = trim_trailing_zeros(nalu);
        if nalu.is_empty() {
            return Err(FramingError::EmptyNalu);
        }
        if nalu.len() > MAX_NALU_SIZE {
            return Err(FramingError::NaluTooLarge(nalu.len(), MAX_NALU_SIZE));
        }
        out.push(Bytes::copy_from_slice(nalu));
        total += nalu.len();
        if total > MAX_ACCESS_UNIT_SIZE {
            return Err(FramingError::AccessUnitTooLarge(total, MAX_ACCESS_UNIT_SIZE));
        }
    }
    if out.len() > MAX_NALUS_PER_GROUP {
        return Err(FramingError::TooManyNalus(out.len(), MAX_NALUS_PER_GROUP));
    }
    Ok(out)
}

/// Returns `(body_start, code_len, code_start)` for every start code found,
/// in order.
fn find_start_codes(data: &[u8]) -> Vec<(usize, usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                out.push((i + 3, 3, i));
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                out.push((i + 4, 4, i));
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    out
}

fn trim_trailing_zeros(nalu: &[u8]) -> &[u8] {
    let mut end = nalu.len();
    while end > 0 && nalu[end - 1] == 0 {
        end -= 1;
    }
    &nalu[..end]
}

/// Serializes a NALU list to Annex-B form, prepending `00 00 00 01` before
/// each.
pub fn annexb_marshal(nalus: &[Bytes]) -> Result<Bytes, FramingError> {
    if nalus.is_empty() {
        return Err(FramingError::EmptyNalu);
    }
    if nalus.len() > MAX_NALUS_PER_GROUP {
        return Err(FramingError::TooManyNalus(nalus.len(), MAX_NALUS_PER_GROUP));
    }
    let mut out = BytesMut::with_capacity(nalus.iter().map(|n| n.len() + 4).sum());
    for n in nalus {
        if n.is_empty() {
            return Err(FramingError::EmptyNalu);
        }
        if n.len() > MAX_NALU_SIZE {
            return Err(FramingError::NaluTooLarge(n.len(), MAX_NALU_SIZE));
        }
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(n);
    }
    Ok(out.freeze())
}

/// Parses a stream of `u32`-length-prefixed NALUs (AVCC / ISO 14496-15
/// framing).
pub fn avcc_unmarshal(mut data: &[u8]) -> Result<Vec<Bytes>, FramingError> {
    let mut out = Vec::new();
    let mut total = 0usize;
    while data.has_remaining() {
        if data.remaining() < 4 {
            return Err(FramingError::TruncatedLengthPrefix);
        }
        let len = data.get_u32() as usize;
        if len == 0 {
            return Err(FramingError::EmptyNalu);
        }
        if len > MAX_NALU_SIZE {
            return Err(FramingError::NaluTooLarge(len, MAX_NALU_SIZE));
        }
        if data.remaining() < len {
            return Err(FramingError::TruncatedNalu(len, data.remaining()));
        }
        out.push(data.copy_to_bytes(len));
        total += len;
        if total > MAX_ACCESS_UNIT_SIZE {
            return Err(FramingError::AccessUnitTooLarge(total, MAX_ACCESS_UNIT_SIZE));
        }
    }
    if out.len() > MAX_NALUS_PER_GROUP {
        return Err(FramingError::TooManyNalus(out.len(), MAX_NALUS_PER_GROUP));
    }
    Ok(out)
}

/// Serializes a NALU list to AVCC form (big-endian `u32` length prefixes).
pub fn avcc_marshal(nalus: &[Bytes]) -> Result<Bytes, FramingError> {
    if nalus.len() > MAX_NALUS_PER_GROUP {
        return Err(FramingError::TooManyNalus(nalus.len(), MAX_NALUS_PER_GROUP));
    }
    let mut out = BytesMut::with_capacity(nalus.iter().map(|n| n.len() + 4).sum());
    for n in nalus {
        if n.is_empty() {
            return Err(FramingError::EmptyNalu);
        }
        if n.len() > MAX_NALU_SIZE {
            return Err(FramingError::NaluTooLarge(n.len(), MAX_NALU_SIZE));
        }
        out.put_u32(n.len() as u32);
        out.put_slice(n);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annexb_round_trip() {
        let nalus = vec![
            Bytes::from_static(&[0x67, 0x01, 0x02]),
            Bytes::from_static(&[0x68, 0x03]),
        ];
        let marshaled = annexb_marshal(&nalus).unwrap();
        assert_eq!(&marshaled[..], &[0, 0, 0, 1, 0x67, 1, 2, 0, 0, 0, 1, 0x68, 3]);
        let unmarshaled = annexb_unmarshal(&marshaled).unwrap();
        assert_eq!(unmarshaled, nalus);
    }

    #[test]
    fn annexb_rejects_empty_nalu() {
        // Two adjacent start codes with nothing between them.
        let data = [0, 0, 0, 1, 0, 0, 0, 1, 0x67];
        assert_eq!(annexb_unmarshal(&data), Err(FramingError::EmptyNalu));
    }

    #[test]
    fn annexb_rejects_too_many_nalus() {
        let mut data = Vec::new();
        for i in 0..25u8 {
            data.extend_from_slice(&[0, 0, 0, 1, i]);
        }
        assert!(matches!(
            annexb_unmarshal(&data),
            Err(FramingError::TooManyNalus(25, 20))
        ));
    }

    #[test]
    fn avcc_round_trip() {
        let nalus = vec![
            Bytes::from_static(&[0x67, 0x01, 0x02]),
            Bytes::from_static(&[0x68, 0x03]),
        ];
        let marshaled = avcc_marshal(&nalus).unwrap();
        let unmarshaled = avcc_unmarshal(&marshaled).unwrap();
        assert_eq!(unmarshaled, nalus);
    }

    #[test]
    fn avcc_rejects_truncated_length_prefix() {
        let data = [0, 0, 0];
        assert_eq!(
            avcc_unmarshal(&data),
            Err(FramingError::TruncatedLengthPrefix)
        );
    }

    #[test]
    fn avcc_rejects_count_over_limit() {
        let mut data = Vec::new();
        for i in 0..21u8 {
            data.extend_from_slice(&1u32.to_be_bytes());
            data.push(i);
        }
        assert!(matches!(
            avcc_unmarshal(&data),
            Err(FramingError::TooManyNalus(21, 20))
        ));
    }
}
