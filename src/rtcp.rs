// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP parsing (for sender reports arriving from a PLAY peer) and the
//! sender report builder used by a RECORD/PLAY sender (§4.4, §4.8, §8.8).
//!
//! Only what this crate's invariants need is implemented: Sender Report
//! parsing/generation and enough of the common header to skip over
//! anything else (Receiver Reports, SDES, BYE, APP) as
//! [`Packet::Unknown`]. Congestion control beyond RTCP reporting is a
//! declared non-goal.

use bytes::Bytes;

use crate::timestamp::NtpTimestamp;

const RTP_VERSION: u8 = 2;
const PT_SENDER_REPORT: u8 = 200;

/// A parsed RTCP Sender Report (RFC 3550 §6.4.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderReport {
    ssrc: u32,
    ntp_timestamp: NtpTimestamp,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
}

impl SenderReport {
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        self.ntp_timestamp
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }
}

/// An RTCP packet this crate cares about, or a tag for one it's skipping
/// (Receiver Report, SDES, BYE, APP, ...).
#[derive(Debug)]
pub enum Packet {
    SenderReport(SenderReport),
    Unknown(Unknown),
}

#[derive(Debug)]
pub struct Unknown {
    payload_type: u8,
}

impl Unknown {
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }
}

impl Packet {
    /// Parses one RTCP packet from the front of `data` (which may be a
    /// compound packet), returning it and the remaining bytes.
    pub fn parse(data: &[u8]) -> Result<(Packet, &[u8]), String> {
        if data.len() < 4 {
            return Err("RTCP packet too short for common header".to_string());
        }
        let first = data[0];
        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(format!("unsupported RTCP version {}", version));
        }
        let report_count = first & 0b1_1111;
        let payload_type = data[1];
        let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
        let total_len = (length_words + 1) * 4;
        if data.len() < total_len {
            return Err(format!(
                "RTCP packet claims {} bytes but only {} available",
                total_len,
                data.len()
            ));
        }
        let (this, rest) = data.split_at(total_len);
        if payload_type == PT_SENDER_REPORT {
            if this.len() < 28 {
                return Err("truncated RTCP SR".to_string());
            }
            let ssrc = u32::from_be_bytes([this[4], this[5], this[6], this[7]]);
            let ntp_hi = u32::from_be_bytes([this[8], this[9], this[10], this[11]]);
            let ntp_lo = u32::from_be_bytes([this[12], this[13], this[14], this[15]]);
            let rtp_timestamp = u32::from_be_bytes([this[16], this[17], this[18], this[19]]);
            let packet_count = u32::from_be_bytes([this[20], this[21], this[22], this[23]]);
            let octet_count = u32::from_be_bytes([this[24], this[25], this[26], this[27]]);
            let _ = report_count; // report blocks aren't consumed individually
            return Ok((
                Packet::SenderReport(SenderReport {
                    ssrc,
                    ntp_timestamp: NtpTimestamp(((ntp_hi as u64) << 32) | ntp_lo as u64),
                    rtp_timestamp,
                    packet_count,
                    octet_count,
                }),
                rest,
            ));
        }
        Ok((Packet::Unknown(Unknown { payload_type }), rest))
    }
}

/// Per-SSRC bookkeeping for an RTCP sender: packet/octet counters updated
/// as RTP packets go out, read by the tick handler to build a Sender
/// Report and by any `Stats` query (§5: guarded by a reader/writer lock in
/// the concurrency model -- callers typically wrap this in a
/// `tokio::sync::RwLock` or `std::sync::RwLock`; this type itself holds no
/// lock).
#[derive(Debug, Clone)]
pub struct SenderStats {
    ssrc: u32,
    packet_count: u32,
    octet_count: u32,
    last_rtp_timestamp: u32,
}

impl SenderStats {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            packet_count: 0,
            octet_count: 0,
            last_rtp_timestamp: 0,
        }
    }

    /// Called by the packet-observer writer path for every RTP packet
    /// sent.
    pub fn record_packet(&mut self, rtp_timestamp: u32, payload_len: u32) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len);
        self.last_rtp_timestamp = rtp_timestamp;
    }

    /// Builds a Sender Report for the current counters, called by the
    /// periodic RTCP sender tick (§5).
    pub fn build_sender_report(&self, now: std::time::SystemTime) -> SenderReport {
        SenderReport {
            ssrc: self.ssrc,
            ntp_timestamp: NtpTimestamp::from_system_time(now),
            rtp_timestamp: self.last_rtp_timestamp,
            packet_count: self.packet_count,
            octet_count: self.octet_count,
        }
    }
}

/// Serializes a Sender Report (with zero report blocks) to wire bytes.
pub fn serialize_sender_report(sr: &SenderReport) -> Bytes {
    let mut buf = Vec::with_capacity(28);
    buf.push((RTP_VERSION << 6) | 0); // no report blocks
    buf.push(PT_SENDER_REPORT);
    buf.extend_from_slice(&6u16.to_be_bytes()); // length: 7 words - 1
    buf.extend_from_slice(&sr.ssrc.to_be_bytes());
    buf.extend_from_slice(&sr.ntp_timestamp.seconds().to_be_bytes());
    buf.extend_from_slice(&sr.ntp_timestamp.fraction().to_be_bytes());
    buf.extend_from_slice(&sr.rtp_timestamp.to_be_bytes());
    buf.extend_from_slice(&sr.packet_count.to_be_bytes());
    buf.extend_from_slice(&sr.octet_count.to_be_bytes());
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn sender_report_round_trips() {
        let mut stats = SenderStats::new(0x1234_5678);
        stats.record_packet(1000, 200);
        stats.record_packet(1400, 180);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let sr = stats.build_sender_report(now);
        assert_eq!(sr.ssrc(), 0x1234_5678);
        assert_eq!(sr.packet_count(), 2);
        assert_eq!(sr.octet_count(), 380);

        let bytes = serialize_sender_report(&sr);
        let (parsed, rest) = Packet::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        match parsed {
            Packet::SenderReport(p) => {
                assert_eq!(p.ssrc(), 0x1234_5678);
                assert_eq!(p.rtp_timestamp(), 1400);
                assert_eq!(p.packet_count(), 2);
                assert_eq!(p.octet_count(), 380);
                // NTP seconds-since-1900 lives in the upper 32 bits.
                assert!(p.ntp_timestamp().seconds() > 0);
            }
            _ => panic!("expected sender report"),
        }
    }

    #[test]
    fn unknown_packet_types_are_skipped_not_errors() {
        // A minimal Receiver Report: PT=201, no report blocks.
        let mut buf = vec![0x80, 201, 0, 1];
        buf.extend_from_slice(&0u32.to_be_bytes());
        let (pkt, rest) = Packet::parse(&buf).unwrap();
        assert!(rest.is_empty());
        match pkt {
            Packet::Unknown(u) => assert_eq!(u.payload_type(), 201),
            _ => panic!("expected unknown packet"),
        }
    }
}
