// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-stream RTP timestamp unwrapping and the global timestamp decoder
//! that unifies clocks across formats (§4.4 of the original spec's
//! "Loss detector, RTCP sender-report builder, global timestamp decoder"
//! row; §5's "leading track" ordering rule).

use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::time::{Duration, SystemTime};

/// NTP timestamp: seconds since 1900-01-01 in the upper 32 bits, fractional
/// seconds in the lower 32, per RFC 3550 §4 (used by RTCP sender reports,
/// §8.8 of the testable properties).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NtpTimestamp(pub u64);

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01).
const NTP_UNIX_EPOCH_DIFF: u64 = 2_208_988_800;

impl NtpTimestamp {
    pub fn from_system_time(t: SystemTime) -> Self {
        let dur = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let seconds = dur.as_secs() + NTP_UNIX_EPOCH_DIFF;
        let frac = ((dur.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTimestamp((seconds << 32) | (frac & 0xffff_ffff))
    }

    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A timestamp on one stream's clock: an extended (unwrapped) integer in
/// `clock_rate` units, anchored to the wall-clock moment the stream's
/// first packet was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    /// Unwrapped timestamp value; may be negative if packets arrive out of
    /// order relative to the anchor (rare but not a bug).
    timestamp: i64,
    clock_rate: NonZeroU32,

    /// Wall-clock time corresponding to timestamp `0` on this stream's
    /// extended timeline.
    epoch: SystemTime,
}

impl Timestamp {
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, epoch: SystemTime) -> Self {
        Self {
            timestamp,
            clock_rate,
            epoch,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Wall-clock time this timestamp corresponds to, given the stream's
    /// epoch anchor.
    pub fn wall(&self) -> SystemTime {
        let secs = self.timestamp as f64 / self.clock_rate.get() as f64;
        if secs >= 0.0 {
            self.epoch + Duration::from_secs_f64(secs)
        } else {
            self.epoch - Duration::from_secs_f64(-secs)
        }
    }

    /// Elapsed time since `other`, in this stream's units.
    pub fn elapsed_since(&self, other: &Timestamp) -> i64 {
        self.timestamp - other.timestamp
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}Hz", self.timestamp, self.clock_rate.get())
    }
}

/// Per-stream RTP-timestamp unwrapper: extends the wire's 32-bit wrapping
/// timestamp into an ever-increasing `i64`, and enforces the "monotonic
/// non-decreasing within one session" invariant (§3) for [`advance_to`].
#[derive(Debug)]
pub struct Timeline {
    clock_rate: NonZeroU32,
    epoch: SystemTime,
    extended: Option<i64>,
}

impl Timeline {
    pub fn new(clock_rate: NonZeroU32, initial_rtp_timestamp: Option<u32>) -> Self {
        Self {
            clock_rate,
            epoch: SystemTime::now(),
            extended: initial_rtp_timestamp.map(i64::from),
        }
    }

    fn unwrap(&self, rtp_timestamp: u32) -> i64 {
        match self.extended {
            None => i64::from(rtp_timestamp),
            Some(prev) => {
                // Extend by taking the wrapping difference as a signed
                // 32-bit delta; this is correct as long as successive
                // readings are within +/- 2^31 of each other, which holds
                // for any sane RTP clock rate and packet cadence.
                let prev_low = (prev as u32).wrapping_sub(0);
                let delta = rtp_timestamp.wrapping_sub(prev_low) as i32;
                prev + i64::from(delta)
            }
        }
    }

    /// Advances the timeline to `rtp_timestamp`, enforcing monotonic
    /// non-decrease (§3's invariant). Used for RTP packet timestamps.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let extended = self.unwrap(rtp_timestamp);
        if let Some(prev) = self.extended {
            if extended < prev {
                return Err(format!(
                    "non-monotonic timestamp: {} then {}",
                    prev, extended
                ));
            }
        }
        self.extended = Some(extended);
        Ok(Timestamp::new(extended, self.clock_rate, self.epoch))
    }

    /// Places `rtp_timestamp` on this timeline without requiring it to be
    /// `>=` the last RTP packet's timestamp (RTCP SR timestamps describe
    /// the next packet to be sent and may run slightly ahead or behind).
    pub fn place(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let extended = self.unwrap(rtp_timestamp);
        Ok(Timestamp::new(extended, self.clock_rate, self.epoch))
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }
}

/// Unifies clocks across every format in a session: one track (the first
/// to deliver a timestamped packet) becomes the "leading track" whose wall
/// clock anchors the others; non-leading tracks are offset by
/// `now - startNTP` at first observation (§5).
#[derive(Debug, Default)]
pub struct GlobalTimestampDecoder {
    leading: Option<usize>,
    leading_epoch: Option<SystemTime>,
}

impl GlobalTimestampDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called the first time `stream_id` delivers a packet. Returns the
    /// wall-clock epoch that stream's [`Timeline`] should use: the leading
    /// track's own observation time if it's first, or an offset anchored
    /// to the leading track's epoch otherwise.
    pub fn observe_first_packet(&mut self, stream_id: usize, observed_at: SystemTime) -> SystemTime {
        match self.leading {
            None => {
                self.leading = Some(stream_id);
                self.leading_epoch = Some(observed_at);
                observed_at
            }
            Some(leading) if leading == stream_id => observed_at,
            Some(_) => self.leading_epoch.unwrap_or(observed_at),
        }
    }

    pub fn leading_stream(&self) -> Option<usize> {
        self.leading
    }
}

/// Per-stream, wraparound-safe packet loss detector (§5, §8.7): feeds
/// sequence numbers and returns how many were skipped since the last call,
/// cast through `u16` so that legitimate wraparound (65535 -> 0) is never
/// mistaken for loss.
#[derive(Debug, Default)]
pub struct LossDetector {
    next_seq: Option<u16>,
}

impl LossDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of packets lost immediately before `seq`.
    pub fn update(&mut self, seq: u16) -> u16 {
        let loss = match self.next_seq {
            None => 0,
            Some(expected) => seq.wrapping_sub(expected),
        };
        self.next_seq = Some(seq.wrapping_add(1));
        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_detector_handles_wraparound() {
        let mut d = LossDetector::new();
        assert_eq!(d.update(65530), 0);
        assert_eq!(d.update(65531), 0);
        assert_eq!(d.update(65535), 3);
    }

    #[test]
    fn timeline_advance_to_is_monotonic() {
        let rate = NonZeroU32::new(90_000).unwrap();
        let mut t = Timeline::new(rate, None);
        let t0 = t.advance_to(1000).unwrap();
        let t1 = t.advance_to(4000).unwrap();
        assert!(t1.timestamp() > t0.timestamp());
        assert!(t.advance_to(2000).is_err());
    }

    #[test]
    fn timeline_unwraps_across_u32_rollover() {
        let rate = NonZeroU32::new(90_000).unwrap();
        let mut t = Timeline::new(rate, None);
        t.advance_to(u32::MAX - 10).unwrap();
        let wrapped = t.advance_to(5).unwrap();
        assert_eq!(wrapped.timestamp(), (u32::MAX as i64 - 10) + 16);
    }

    #[test]
    fn ntp_timestamp_round_trips_seconds() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let ntp = NtpTimestamp::from_system_time(t);
        assert_eq!(ntp.seconds(), 100 + NTP_UNIX_EPOCH_DIFF as u32);
    }

    #[test]
    fn global_decoder_offsets_non_leading_tracks_to_leader_epoch() {
        let mut g = GlobalTimestampDecoder::new();
        let t0 = SystemTime::now();
        let leader_epoch = g.observe_first_packet(0, t0);
        assert_eq!(leader_epoch, t0);
        let t1 = t0 + Duration::from_secs(5);
        let follower_epoch = g.observe_first_packet(1, t1);
        assert_eq!(follower_epoch, t0);
        assert_eq!(g.leading_stream(), Some(0));
    }
}
