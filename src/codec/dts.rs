// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recovers decode timestamps (DTS) from presentation timestamps (PTS)
//! using picture order count (POC) and, where available, HRD/SEI timing
//! (§4.4). A caller with a B-frame-reordering decoder downstream needs
//! DTS, not just PTS, to know when a frame may be released for decode.

use bytes::Bytes;

use crate::bitstream::{remove_emulation_prevention, BitstreamError, RbspReader};
use crate::codec::annexb;
use crate::codec::h264;
use crate::codec::h265;

#[derive(Debug, thiserror::Error)]
pub enum DtsError {
    #[error("DTS {dts} exceeds PTS {pts}")]
    DtsExceedsPts { dts: i64, pts: i64 },
    #[error("DTS went backwards: {prev} then {next}")]
    NonMonotonic { prev: i64, next: i64 },
    #[error("bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),
}

fn nal_type_h264(b: u8) -> u8 {
    b & 0x1f
}

/// Extracts DTS from PTS for an H.264 stream, given each access unit's
/// AVCC-framed NALU data (as produced by [`h264::Depacketizer`]) and its
/// presentation timestamp.
#[derive(Debug, Default)]
pub struct H264DtsExtractor {
    sps: Option<h264::Sps>,
    prev_dts: Option<i64>,
    prev_poc_lsb: u32,
    prev_poc_msb: i64,
    prev_expected_poc: i64,
}

impl H264DtsExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.prev_poc_lsb = 0;
        self.prev_poc_msb = 0;
        self.prev_expected_poc = 0;
    }

    /// `data` is one access unit's NALUs in AVCC framing; `pts` is its
    /// presentation timestamp (clock-rate ticks).
    pub fn extract(&mut self, data: &[u8], pts: i64, clock_rate: u32) -> Result<i64, DtsError> {
        let nalus = annexb::avcc_unmarshal(data).unwrap_or_default();
        for n in &nalus {
            if !n.is_empty() && nal_type_h264(n[0]) == 7 {
                if let Ok(sps) = h264::Sps::parse(n) {
                    self.sps = Some(sps);
                }
            }
        }
        let sps = match &self.sps {
            Some(s) => s.clone(),
            None => return self.finish(pts, pts),
        };
        if sps.pic_order_cnt_type == 2 {
            return self.finish(pts, pts);
        }
        let is_idr = nalus
            .iter()
            .any(|n| !n.is_empty() && nal_type_h264(n[0]) == 5);
        if is_idr {
            self.reset();
            // NVENC workaround: an IDR whose SEI pic_timing reports a
            // nonzero cpb_removal_delay still carries reordered pictures
            // behind it; treat it as dpb_output_delay=2 rather than
            // returning PTS outright.
            if let Some(dpb_delay) = sei_dpb_output_delay_if_nonzero_cpb(&nalus, &sps) {
                let dts = pts - i64::from(dpb_delay) * tick_in_clock_units(&sps, clock_rate).unwrap_or(0);
                return self.finish(dts, pts);
            }
            return self.finish(pts, pts);
        }
        if sps.pic_order_cnt_type != 0 {
            // Type 1 POC derivation (cycle-based) isn't reconstructed here;
            // fall back to PTS rather than guess.
            return self.finish(pts, pts);
        }
        let slice = nalus
            .iter()
            .find(|n| !n.is_empty() && matches!(nal_type_h264(n[0]), 1 | 5));
        let slice = match slice {
            Some(s) => s,
            None => return self.finish(pts, pts),
        };
        let poc_lsb = match parse_h264_poc_lsb(slice, &sps) {
            Some(v) => v,
            None => return self.finish(pts, pts),
        };
        let max_poc_lsb = 1i64 << (sps.log2_max_pic_order_cnt_lsb_minus4 + 4);
        let prev_lsb = self.prev_poc_lsb as i64;
        let poc_msb = if (poc_lsb as i64) < prev_lsb && (prev_lsb - poc_lsb as i64) >= max_poc_lsb / 2 {
            self.prev_poc_msb + max_poc_lsb
        } else if (poc_lsb as i64) > prev_lsb && (poc_lsb as i64 - prev_lsb) > max_poc_lsb / 2 {
            self.prev_poc_msb - max_poc_lsb
        } else {
            self.prev_poc_msb
        };
        let poc = poc_msb + poc_lsb as i64;
        self.prev_poc_lsb = poc_lsb;
        self.prev_poc_msb = poc_msb;

        let expected_poc = self.prev_expected_poc + 2;
        self.prev_expected_poc = expected_poc;
        let poc_diff = expected_poc - poc;

        // Strategy A: VUI timing + bitstream restriction.
        if let (Some(tick), Some(_)) = (tick_in_clock_units(&sps, clock_rate), sps.max_num_reorder_frames()) {
            let dts = pts - poc_diff * tick;
            return self.finish(dts, pts);
        }
        // Strategy B: SEI pic_timing dpb_output_delay.
        if let Some(dpb_delay) = sei_dpb_output_delay(&nalus, &sps) {
            let tick = tick_in_clock_units(&sps, clock_rate).unwrap_or(0);
            let dts = pts - i64::from(dpb_delay) * tick;
            return self.finish(dts, pts);
        }
        // Fallback.
        self.finish(pts, pts)
    }

    fn finish(&mut self, mut dts: i64, pts: i64) -> Result<i64, DtsError> {
        if dts > pts {
            dts = pts;
        }
        if let Some(prev) = self.prev_dts {
            if dts <= prev {
                return Err(DtsError::NonMonotonic { prev, next: dts });
            }
        }
        self.prev_dts = Some(dts);
        Ok(dts)
    }
}

fn tick_in_clock_units(sps: &h264::Sps, clock_rate: u32) -> Option<i64> {
    let t = sps.vui.as_ref()?.timing_info?;
    if t.time_scale == 0 {
        return None;
    }
    Some((i64::from(t.num_units_in_tick) * i64::from(clock_rate)) / i64::from(t.time_scale))
}

fn parse_h264_poc_lsb(slice: &Bytes, sps: &h264::Sps) -> Option<u32> {
    let rbsp = remove_emulation_prevention(&slice[1..]);
    let mut r = RbspReader::new(&rbsp);
    r.skip_ue().ok()?; // first_mb_in_slice
    r.skip_ue().ok()?; // slice_type
    r.skip_ue().ok()?; // pic_parameter_set_id
    r.skip_bits(sps.log2_max_frame_num_minus4 + 4).ok()?; // frame_num
    if !sps.frame_mbs_only_flag {
        let field_pic_flag = r.read_bit().ok()?;
        if field_pic_flag {
            r.skip_bits(1).ok()?; // bottom_field_flag
        }
    }
    if nal_type_h264(slice[0]) == 5 {
        r.skip_ue().ok()?; // idr_pic_id
    }
    let poc_lsb = r
        .read_bits((sps.log2_max_pic_order_cnt_lsb_minus4 + 4) as u8)
        .ok()?;
    Some(poc_lsb)
}

/// Scans an access unit's NALUs for an SEI pic_timing message and returns
/// `dpb_output_delay`, if HRD parameters are present to interpret it.
fn sei_dpb_output_delay(nalus: &[Bytes], sps: &h264::Sps) -> Option<u32> {
    let hrd = sps.vui.as_ref()?.nal_hrd.as_ref()?;
    for n in nalus {
        if n.is_empty() || nal_type_h264(n[0]) != 6 {
            continue;
        }
        if let Some(delay) = parse_sei_pic_timing_dpb_delay(n, hrd) {
            return Some(delay);
        }
    }
    None
}

fn sei_dpb_output_delay_if_nonzero_cpb(nalus: &[Bytes], sps: &h264::Sps) -> Option<u32> {
    let hrd = sps.vui.as_ref()?.nal_hrd.as_ref()?;
    for n in nalus {
        if n.is_empty() || nal_type_h264(n[0]) != 6 {
            continue;
        }
        if let Some((cpb_delay, _dpb_delay)) = parse_sei_pic_timing_delays(n, hrd) {
            if cpb_delay > 0 {
                return Some(2);
            }
        }
    }
    None
}

fn parse_sei_pic_timing_dpb_delay(sei_nalu: &Bytes, hrd: &h264::HrdParameters) -> Option<u32> {
    parse_sei_pic_timing_delays(sei_nalu, hrd).map(|(_, dpb)| dpb)
}

/// Parses the first `pic_timing` (payload type 1) SEI message in `sei_nalu`,
/// returning `(cpb_removal_delay, dpb_output_delay)`.
fn parse_sei_pic_timing_delays(sei_nalu: &Bytes, hrd: &h264::HrdParameters) -> Option<(u32, u32)> {
    let rbsp = remove_emulation_prevention(&sei_nalu[1..]);
    let mut i = 0usize;
    while i < rbsp.len() {
        let mut payload_type = 0u32;
        while i < rbsp.len() && rbsp[i] == 0xff {
            payload_type += 255;
            i += 1;
        }
        if i >= rbsp.len() {
            break;
        }
        payload_type += u32::from(rbsp[i]);
        i += 1;
        let mut payload_size = 0u32;
        while i < rbsp.len() && rbsp[i] == 0xff {
            payload_size += 255;
            i += 1;
        }
        if i >= rbsp.len() {
            break;
        }
        payload_size += u32::from(rbsp[i]);
        i += 1;
        if i + payload_size as usize > rbsp.len() {
            return None;
        }
        let payload = &rbsp[i..i + payload_size as usize];
        if payload_type == 1 {
            let mut r = RbspReader::new(payload);
            let cpb_delay = r
                .read_bits((hrd.cpb_removal_delay_length_minus1 + 1) as u8)
                .ok()?;
            let dpb_delay = r
                .read_bits((hrd.dpb_output_delay_length_minus1 + 1) as u8)
                .ok()?;
            return Some((cpb_delay, dpb_delay));
        }
        i += payload_size as usize;
    }
    None
}

/// Extracts DTS from PTS for an H.265 stream. Lacking a recovered short-term
/// ref-pic-set-derived POC (this crate doesn't reconstruct the full slice
/// segment header's `num_pic_order_cnt_lsb`-dependent ref pic set), this
/// uses `MaxNumReorderPics[0]` as a fixed reorder depth: the first
/// `MaxNumReorderPics[0]` pictures after an IRAP have no prior picture to
/// reorder behind, so DTS tracks PTS; afterward each picture's DTS lags its
/// PTS by one reorder-depth's worth of picture durations, the simplest
/// offset consistent with the monotonicity/`<=` guarantees this crate
/// promises.
#[derive(Debug, Default)]
pub struct H265DtsExtractor {
    sps: Option<h265::Sps>,
    prev_dts: Option<i64>,
    since_irap: u32,
}

fn nal_type_h265(b0: u8) -> u8 {
    (b0 >> 1) & 0x3f
}

impl H265DtsExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(&mut self, data: &[u8], pts: i64, clock_rate: u32) -> Result<i64, DtsError> {
        let nalus = annexb::avcc_unmarshal(data).unwrap_or_default();
        for n in &nalus {
            if n.len() >= 2 && nal_type_h265(n[0]) == 33 {
                if let Ok(sps) = h265::Sps::parse(n) {
                    self.sps = Some(sps);
                }
            }
        }
        let is_irap = nalus
            .iter()
            .any(|n| n.len() >= 2 && (16..=23).contains(&nal_type_h265(n[0])));
        if is_irap {
            self.since_irap = 0;
        }
        let reorder_depth = self
            .sps
            .as_ref()
            .and_then(h265::Sps::max_num_reorder_pics_0)
            .unwrap_or(0);
        let dts = if self.since_irap < reorder_depth {
            pts
        } else {
            let tick = self
                .sps
                .as_ref()
                .and_then(|s| s.vui.as_ref())
                .and_then(|v| v.timing_info)
                .filter(|t| t.time_scale != 0)
                .map(|t| (i64::from(t.num_units_in_tick) * i64::from(clock_rate)) / i64::from(t.time_scale))
                .unwrap_or(0);
            pts - i64::from(reorder_depth) * tick
        };
        self.since_irap = self.since_irap.saturating_add(1);
        self.finish(dts, pts)
    }

    fn finish(&mut self, mut dts: i64, pts: i64) -> Result<i64, DtsError> {
        if dts > pts {
            dts = pts;
        }
        if let Some(prev) = self.prev_dts {
            if dts <= prev {
                dts = prev + 1;
                if dts > pts {
                    return Err(DtsError::NonMonotonic { prev, next: dts });
                }
            }
        }
        self.prev_dts = Some(dts);
        Ok(dts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_poc_type2_returns_pts_unchanged() {
        // SPS with pic_order_cnt_type = 2 and no VUI; constructed via the
        // same bit writer pattern used in codec::h264's tests.
        let sps = crate::codec::h264::Sps {
            profile_idc: 66,
            constraint_flags: 0,
            level_idc: 30,
            seq_parameter_set_id: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 2,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            max_num_ref_frames: 1,
            pic_width_in_mbs_minus1: 10,
            pic_height_in_map_units_minus1: 10,
            frame_mbs_only_flag: true,
            crop: None,
            vui: None,
        };
        let mut extractor = H264DtsExtractor {
            sps: Some(sps),
            ..Default::default()
        };
        let idr = Bytes::from_static(&[0x65, 0x88, 0x80]);
        let data = annexb::avcc_marshal(&[idr]).unwrap();
        let dts = extractor.extract(&data, 1000, 90_000).unwrap();
        assert_eq!(dts, 1000);
        let dts2 = extractor.extract(&data, 4000, 90_000).unwrap();
        assert_eq!(dts2, 4000);
    }

    #[test]
    fn h264_dts_never_exceeds_pts() {
        let sps = crate::codec::h264::Sps {
            profile_idc: 66,
            constraint_flags: 0,
            level_idc: 30,
            seq_parameter_set_id: 0,
            log2_max_frame_num_minus4: 4,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            max_num_ref_frames: 2,
            pic_width_in_mbs_minus1: 10,
            pic_height_in_map_units_minus1: 10,
            frame_mbs_only_flag: true,
            crop: None,
            vui: None,
        };
        let mut extractor = H264DtsExtractor {
            sps: Some(sps),
            ..Default::default()
        };
        for (pts, nalu) in [
            (1000i64, Bytes::from_static(&[0x65, 0, 0])),
            (4000, Bytes::from_static(&[0x41, 0, 0])),
        ] {
            let data = annexb::avcc_marshal(&[nalu]).unwrap();
            let dts = extractor.extract(&data, pts, 90_000).unwrap();
            assert!(dts <= pts);
        }
    }
}
