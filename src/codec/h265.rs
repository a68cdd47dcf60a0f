// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.265/HEVC (RFC 7798) RTP payload framing: VPS/SPS/PPS parsing, the
//! depacketizer state machine (single NAL unit, Aggregation Packet,
//! Fragmentation Unit), and the packetizer.
//!
//! Mirrors [`super::h264`]'s structure; the two differ mainly in NAL
//! header width (two bytes here, carrying `layer_id`/`temporal_id` as well
//! as type) and in the payload-format names RFC 7798 uses for the same
//! aggregation/fragmentation ideas RFC 6184 calls STAP-A/FU-A.

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::bitstream::{remove_emulation_prevention, BitstreamError, RbspReader};
use crate::codec::annexb;

const NAL_TYPE_IDR_W_RADL: u8 = 19;
const NAL_TYPE_IDR_N_LP: u8 = 20;
const NAL_TYPE_CRA: u8 = 21;
const NAL_TYPE_VPS: u8 = 32;
const NAL_TYPE_SPS: u8 = 33;
const NAL_TYPE_PPS: u8 = 34;
const NAL_TYPE_AUD: u8 = 35;
const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;

fn nal_type(b0: u8) -> u8 {
    (b0 >> 1) & 0x3f
}

fn is_irap(t: u8) -> bool {
    (16..=23).contains(&t)
}

fn is_idr(t: u8) -> bool {
    t == NAL_TYPE_IDR_W_RADL || t == NAL_TYPE_IDR_N_LP
}

/// Chroma-format-indexed subsampling factors (table 6-1 in the HEVC spec),
/// used to turn the conformance window's crop units (which are in chroma
/// samples) into luma pixels.
fn sub_width_height_c(chroma_format_idc: u32, separate_colour_plane: bool) -> (u32, u32) {
    if separate_colour_plane {
        return (1, 1);
    }
    match chroma_format_idc {
        1 => (2, 2), // 4:2:0
        2 => (2, 1), // 4:2:2
        _ => (1, 1), // 4:4:4 or monochrome
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConformanceWindow {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vui {
    pub timing_info: Option<TimingInfo>,
}

/// A fully unmarshaled H.265 Sequence Parameter Set (§4.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub profile_tier_level: ProfileTierLevel,
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window: Option<ConformanceWindow>,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub max_num_reorder_pics: Vec<u32>,
    pub vui: Option<Vui>,
}

impl Sps {
    pub fn parse(nalu: &[u8]) -> Result<Self, BitstreamError> {
        if nalu.len() < 2 {
            return Err(BitstreamError::Eof);
        }
        let rbsp = remove_emulation_prevention(&nalu[2..]);
        let mut r = RbspReader::new(&rbsp);
        r.skip_bits(4)?; // sps_video_parameter_set_id
        let sps_max_sub_layers_minus1 = r.read_bits(3)?;
        r.skip_bits(1)?; // sps_temporal_id_nesting_flag
        let profile_tier_level = parse_profile_tier_level(&mut r, sps_max_sub_layers_minus1)?;
        r.skip_ue()?; // sps_seq_parameter_set_id
        let chroma_format_idc = r.read_ue()?;
        let separate_colour_plane_flag = if chroma_format_idc == 3 {
            r.read_bit()?
        } else {
            false
        };
        let pic_width_in_luma_samples = r.read_ue()?;
        let pic_height_in_luma_samples = r.read_ue()?;
        let conformance_window_flag = r.read_bit()?;
        let conformance_window = if conformance_window_flag {
            Some(ConformanceWindow {
                left: r.read_ue()?,
                right: r.read_ue()?,
                top: r.read_ue()?,
                bottom: r.read_ue()?,
            })
        } else {
            None
        };
        r.skip_ue()?; // bit_depth_luma_minus8
        r.skip_ue()?; // bit_depth_chroma_minus8
        let log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
        let sps_sub_layer_ordering_info_present_flag = r.read_bit()?;
        let start = if sps_sub_layer_ordering_info_present_flag {
            0
        } else {
            sps_max_sub_layers_minus1
        };
        let mut max_num_reorder_pics = Vec::new();
        for _ in start..=sps_max_sub_layers_minus1 {
            r.skip_ue()?; // sps_max_dec_pic_buffering_minus1
            max_num_reorder_pics.push(r.read_ue()?);
            r.skip_ue()?; // sps_max_latency_increase_plus1
        }
        r.skip_ue()?; // log2_min_luma_coding_block_size_minus3
        r.skip_ue()?; // log2_diff_max_min_luma_coding_block_size
        r.skip_ue()?; // log2_min_luma_transform_block_size_minus2
        r.skip_ue()?; // log2_diff_max_min_luma_transform_block_size
        r.skip_ue()?; // max_transform_hierarchy_depth_inter
        r.skip_ue()?; // max_transform_hierarchy_depth_intra
        let scaling_list_enabled_flag = r.read_bit()?;
        if scaling_list_enabled_flag {
            let sps_scaling_list_data_present_flag = r.read_bit()?;
            if sps_scaling_list_data_present_flag {
                skip_scaling_list_data(&mut r)?;
            }
        }
        r.skip_bits(1)?; // amp_enabled_flag
        r.skip_bits(1)?; // sample_adaptive_offset_enabled_flag
        let pcm_enabled_flag = r.read_bit()?;
        if pcm_enabled_flag {
            r.skip_bits(4)?; // pcm_sample_bit_depth_luma_minus1
            r.skip_bits(4)?; // pcm_sample_bit_depth_chroma_minus1
            r.skip_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
            r.skip_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
            r.skip_bits(1)?; // pcm_loop_filter_disabled_flag
        }
        let num_short_term_ref_pic_sets = r.read_ue()?;
        let mut num_delta_pocs = Vec::new();
        for idx in 0..num_short_term_ref_pic_sets {
            let n = parse_short_term_ref_pic_set(&mut r, idx, num_short_term_ref_pic_sets, &num_delta_pocs)?;
            num_delta_pocs.push(n);
        }
        let long_term_ref_pics_present_flag = r.read_bit()?;
        if long_term_ref_pics_present_flag {
            let num_long_term_ref_pics_sps = r.read_ue()?;
            let poc_lsb_bits = log2_max_pic_order_cnt_lsb_minus4 + 4;
            for _ in 0..num_long_term_ref_pics_sps {
                r.skip_bits(poc_lsb_bits)?;
                r.skip_bits(1)?; // used_by_curr_pic_lt_sps_flag
            }
        }
        r.skip_bits(1)?; // sps_temporal_mvp_enabled_flag
        r.skip_bits(1)?; // strong_intra_smoothing_enabled_flag
        let vui_parameters_present_flag = r.read_bit()?;
        let vui = if vui_parameters_present_flag {
            Some(parse_vui(&mut r)?)
        } else {
            None
        };
        Ok(Sps {
            profile_tier_level,
            chroma_format_idc,
            separate_colour_plane_flag,
            pic_width_in_luma_samples,
            pic_height_in_luma_samples,
            conformance_window,
            log2_max_pic_order_cnt_lsb_minus4,
            max_num_reorder_pics,
            vui,
        })
    }

    pub fn width(&self) -> u32 {
        let (sub_w, _) = sub_width_height_c(self.chroma_format_idc, self.separate_colour_plane_flag);
        match &self.conformance_window {
            Some(c) => self
                .pic_width_in_luma_samples
                .saturating_sub(sub_w * (c.left + c.right)),
            None => self.pic_width_in_luma_samples,
        }
    }

    pub fn height(&self) -> u32 {
        let (_, sub_h) = sub_width_height_c(self.chroma_format_idc, self.separate_colour_plane_flag);
        match &self.conformance_window {
            Some(c) => self
                .pic_height_in_luma_samples
                .saturating_sub(sub_h * (c.top + c.bottom)),
            None => self.pic_height_in_luma_samples,
        }
    }

    pub fn rfc6381_codec(&self) -> String {
        format!(
            "hvc1.{}.{:X}.L{}",
            self.profile_tier_level.general_profile_idc,
            0,
            self.profile_tier_level.general_level_idc
        )
    }

    /// `MaxNumReorderPics[0]`, the base sub-layer's reorder depth, used by
    /// the DTS extractor.
    pub fn max_num_reorder_pics_0(&self) -> Option<u32> {
        self.max_num_reorder_pics.first().copied()
    }
}

fn parse_profile_tier_level(
    r: &mut RbspReader<'_>,
    max_sub_layers_minus1: u32,
) -> Result<ProfileTierLevel, BitstreamError> {
    r.skip_bits(2)?; // general_profile_space
    r.skip_bits(1)?; // general_tier_flag
    let general_profile_idc = r.read_u8(5)?;
    r.skip_bits(32)?; // general_profile_compatibility_flags
    r.skip_bits(1)?; // general_progressive_source_flag
    r.skip_bits(1)?; // general_interlaced_source_flag
    r.skip_bits(1)?; // general_non_packed_constraint_flag
    r.skip_bits(1)?; // general_frame_only_constraint_flag
    r.skip_bits(32)?; // constraint flags (upper 32 of the 44-bit field)
    r.skip_bits(12)?; // constraint flags (lower 12)
    let general_level_idc = r.read_u8(8)?;
    let mut sub_layer_profile_present = SmallVec::<[bool; 8]>::new();
    let mut sub_layer_level_present = SmallVec::<[bool; 8]>::new();
    for _ in 0..max_sub_layers_minus1 {
        sub_layer_profile_present.push(r.read_bit()?);
        sub_layer_level_present.push(r.read_bit()?);
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip_bits(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if sub_layer_profile_present[i] {
            r.skip_bits(32)?;
            r.skip_bits(32)?;
            r.skip_bits(24)?;
        }
        if sub_layer_level_present[i] {
            r.skip_bits(8)?;
        }
    }
    Ok(ProfileTierLevel {
        general_profile_idc,
        general_level_idc,
    })
}

fn skip_scaling_list_data(r: &mut RbspReader<'_>) -> Result<(), BitstreamError> {
    for size_id in 0..4u32 {
        let step = if size_id == 3 { 3 } else { 1 };
        let mut mat_id = 0;
        while mat_id < 6 {
            let scaling_list_pred_mode_flag = r.read_bit()?;
            if !scaling_list_pred_mode_flag {
                r.skip_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = (1u32 << (4 + (size_id << 1))).min(64);
                if size_id > 1 {
                    r.skip_se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    r.skip_se()?; // scaling_list_delta_coef
                }
            }
            mat_id += step;
        }
    }
    Ok(())
}

/// Parses one `short_term_ref_pic_set()` (§7.3.7), returning the decoded
/// set's `NumDeltaPocs` so later indices can reference it via
/// `inter_ref_pic_set_prediction_flag`.
fn parse_short_term_ref_pic_set(
    r: &mut RbspReader<'_>,
    idx: u32,
    num_short_term_ref_pic_sets: u32,
    num_delta_pocs: &[u32],
) -> Result<u32, BitstreamError> {
    let inter_ref_pic_set_prediction_flag = if idx != 0 { r.read_bit()? } else { false };
    if inter_ref_pic_set_prediction_flag {
        let delta_idx_minus1 = if idx == num_short_term_ref_pic_sets {
            r.read_ue()?
        } else {
            0
        };
        r.skip_bits(1)?; // delta_rps_sign
        r.skip_ue()?; // abs_delta_rps_minus1
        let ref_idx = idx
            .saturating_sub(delta_idx_minus1 + 1)
            .min(num_delta_pocs.len().saturating_sub(1) as u32);
        let num_delta_pocs_ref = num_delta_pocs.get(ref_idx as usize).copied().unwrap_or(0);
        let mut used = 0u32;
        for _ in 0..=num_delta_pocs_ref {
            let used_by_curr_pic_flag = r.read_bit()?;
            if used_by_curr_pic_flag {
                used += 1;
            } else {
                r.skip_bits(1)?; // use_delta_flag
            }
        }
        Ok(used)
    } else {
        let num_negative_pics = r.read_ue()?;
        let num_positive_pics = r.read_ue()?;
        for _ in 0..num_negative_pics {
            r.skip_ue()?; // delta_poc_s0_minus1
            r.skip_bits(1)?; // used_by_curr_pic_s0_flag
        }
        for _ in 0..num_positive_pics {
            r.skip_ue()?; // delta_poc_s1_minus1
            r.skip_bits(1)?; // used_by_curr_pic_s1_flag
        }
        Ok(num_negative_pics + num_positive_pics)
    }
}

fn parse_vui(r: &mut RbspReader<'_>) -> Result<Vui, BitstreamError> {
    let aspect_ratio_info_present_flag = r.read_bit()?;
    if aspect_ratio_info_present_flag {
        let aspect_ratio_idc = r.read_u8(8)?;
        if aspect_ratio_idc == 255 {
            r.skip_bits(16)?; // sar_width
            r.skip_bits(16)?; // sar_height
        }
    }
    let overscan_info_present_flag = r.read_bit()?;
    if overscan_info_present_flag {
        r.skip_bits(1)?;
    }
    let video_signal_type_present_flag = r.read_bit()?;
    if video_signal_type_present_flag {
        r.skip_bits(3)?; // video_format
        r.skip_bits(1)?; // video_full_range_flag
        let colour_description_present_flag = r.read_bit()?;
        if colour_description_present_flag {
            r.skip_bits(24)?;
        }
    }
    let chroma_loc_info_present_flag = r.read_bit()?;
    if chroma_loc_info_present_flag {
        r.skip_ue()?;
        r.skip_ue()?;
    }
    r.skip_bits(1)?; // neutral_chroma_indication_flag
    r.skip_bits(1)?; // field_seq_flag
    r.skip_bits(1)?; // frame_field_info_present_flag
    let default_display_window_flag = r.read_bit()?;
    if default_display_window_flag {
        r.skip_ue()?;
        r.skip_ue()?;
        r.skip_ue()?;
        r.skip_ue()?;
    }
    let vui_timing_info_present_flag = r.read_bit()?;
    let timing_info = if vui_timing_info_present_flag {
        let num_units_in_tick = r.read_bits(32)?;
        let time_scale = r.read_bits(32)?;
        Some(TimingInfo {
            num_units_in_tick,
            time_scale,
        })
    } else {
        None
    };
    Ok(Vui { timing_info })
}

#[derive(Debug)]
struct AccessUnit {
    nalus: SmallVec<[Bytes; 8]>,
    timestamp: crate::Timestamp,
    start_ctx: crate::RtspMessageContext,
    end_ctx: crate::RtspMessageContext,
    loss: u16,
    stream_id: usize,
    new_params: bool,
}

impl AccessUnit {
    fn is_random_access_point(&self) -> bool {
        self.nalus
            .iter()
            .any(|n| n.len() >= 2 && is_irap(nal_type(n[0])))
    }

    fn is_disposable(&self) -> bool {
        // HEVC signals "not used for reference" via odd NAL unit type
        // values in the trailing-picture ranges, rather than a single
        // ref_idc field as in H.264; approximate via the TSA_N/STSA_N/
        // RADL_N/RASL_N/RSV_VCL_N "non-reference" type set.
        self.nalus.iter().all(|n| {
            n.len() >= 2
                && matches!(nal_type(n[0]), 0 | 2 | 4 | 6 | 8 | 10 | 12 | 14)
        })
    }
}

#[derive(Debug, Default)]
struct FuState {
    nal_header: [u8; 2],
    data: BytesMut,
    next_seq: u16,
}

#[derive(Default)]
struct InternalParameters {
    vps: Option<Bytes>,
    sps: Option<(Bytes, Sps)>,
    pps: Option<Bytes>,
}

impl std::fmt::Debug for InternalParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalParameters")
            .field("has_vps", &self.vps.is_some())
            .field("has_sps", &self.sps.is_some())
            .field("has_pps", &self.pps.is_some())
            .finish()
    }
}

impl InternalParameters {
    fn build(&self) -> Option<super::VideoParameters> {
        let (sps_bytes, sps) = self.sps.as_ref()?;
        let pps_bytes = self.pps.as_ref()?;
        let mut parts = vec![];
        if let Some(v) = &self.vps {
            parts.push(v.clone());
        }
        parts.push(sps_bytes.clone());
        parts.push(pps_bytes.clone());
        let extra_data = annexb::annexb_marshal(&parts).ok()?;
        Some(super::VideoParameters {
            pixel_dimensions: (sps.width(), sps.height()),
            rfc6381_codec: sps.rfc6381_codec(),
            pixel_aspect_ratio: None,
            frame_rate: sps.vui.as_ref().and_then(|v| {
                v.timing_info.and_then(|t| {
                    if t.num_units_in_tick == 0 {
                        None
                    } else {
                        Some((t.time_scale, 2 * t.num_units_in_tick))
                    }
                })
            }),
            extra_data,
        })
    }
}

/// Turns H.265 RTP packets (RFC 7798: single NAL unit, Aggregation Packet,
/// Fragmentation Unit) into access units. FU-B/AP-with-DONL ordering
/// (interleaved mode) and PACI are out of scope per the declared
/// non-goals.
#[derive(Debug)]
pub struct Depacketizer {
    parameters: InternalParameters,
    fu: Option<FuState>,
    au: Option<AccessUnit>,
    pending: Option<super::CodecItem>,
}

impl Depacketizer {
    pub(super) fn new(
        _clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let mut parameters = InternalParameters::default();
        if let Some(fmtp) = format_specific_params {
            for kv in fmtp.split(';') {
                let kv = kv.trim();
                if let Some(v) = kv.strip_prefix("sprop-vps=") {
                    parameters.vps = Some(Bytes::from(
                        base64::decode(v.trim()).map_err(|e| format!("bad sprop-vps: {}", e))?,
                    ));
                } else if let Some(v) = kv.strip_prefix("sprop-sps=") {
                    let decoded =
                        base64::decode(v.trim()).map_err(|e| format!("bad sprop-sps: {}", e))?;
                    let sps = Sps::parse(&decoded).map_err(|e| format!("bad sprop-sps: {}", e))?;
                    parameters.sps = Some((Bytes::from(decoded), sps));
                } else if let Some(v) = kv.strip_prefix("sprop-pps=") {
                    parameters.pps = Some(Bytes::from(
                        base64::decode(v.trim()).map_err(|e| format!("bad sprop-pps: {}", e))?,
                    ));
                }
            }
        }
        Ok(Self {
            parameters,
            fu: None,
            au: None,
            pending: None,
        })
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        self.parameters.build().map(super::Parameters::Video)
    }

    fn start_au(&mut self, pkt: &crate::client::rtp::Packet) {
        self.au = Some(AccessUnit {
            nalus: SmallVec::new(),
            timestamp: pkt.timestamp,
            start_ctx: pkt.ctx,
            end_ctx: pkt.ctx,
            loss: pkt.loss,
            stream_id: pkt.stream_id,
            new_params: false,
        });
    }

    fn observe_nalu(&mut self, nalu: &Bytes) {
        if nalu.len() < 2 {
            return;
        }
        match nal_type(nalu[0]) {
            NAL_TYPE_VPS => {
                if self.parameters.vps.as_ref() != Some(nalu) {
                    self.parameters.vps = Some(nalu.clone());
                    if let Some(au) = &mut self.au {
                        au.new_params = true;
                    }
                }
            }
            NAL_TYPE_SPS => {
                if !matches!(&self.parameters.sps, Some((b, _)) if b == nalu) {
                    if let Ok(sps) = Sps::parse(nalu) {
                        self.parameters.sps = Some((nalu.clone(), sps));
                        if let Some(au) = &mut self.au {
                            au.new_params = true;
                        }
                    }
                }
            }
            NAL_TYPE_PPS => {
                if self.parameters.pps.as_ref() != Some(nalu) {
                    self.parameters.pps = Some(nalu.clone());
                    if let Some(au) = &mut self.au {
                        au.new_params = true;
                    }
                }
            }
            _ => {}
        }
    }

    fn push_nalu(&mut self, pkt: &crate::client::rtp::Packet, nalu: Bytes) {
        if nalu.len() < 2 {
            return;
        }
        self.observe_nalu(&nalu);
        if nal_type(nalu[0]) == NAL_TYPE_AUD {
            return;
        }
        if self.au.is_none() {
            self.start_au(pkt);
        }
        let au = self.au.as_mut().unwrap();
        au.end_ctx = pkt.ctx;
        au.nalus.push(nalu);
    }

    pub(super) fn push(&mut self, pkt: crate::client::rtp::Packet) -> Result<(), String> {
        if let Some(existing) = &self.au {
            if existing.timestamp.timestamp() != pkt.timestamp.timestamp() {
                self.emit_au();
            }
        }
        if pkt.payload.len() < 2 {
            return Err("H.265 RTP payload too short for NAL header".to_string());
        }
        let nt = nal_type(pkt.payload[0]);
        match nt {
            0..=40 => {
                self.push_nalu(&pkt, pkt.payload.clone());
            }
            NAL_TYPE_AP => {
                let mut data = &pkt.payload[2..];
                loop {
                    if data.len() < 2 {
                        break;
                    }
                    let size = usize::from(u16::from_be_bytes([data[0], data[1]]));
                    if size == 0 {
                        break;
                    }
                    if data.len() < 2 + size {
                        return Err("truncated aggregation packet".to_string());
                    }
                    let nalu = Bytes::copy_from_slice(&data[2..2 + size]);
                    data = &data[2 + size..];
                    self.push_nalu(&pkt, nalu);
                }
            }
            NAL_TYPE_FU => {
                if pkt.payload.len() < 3 {
                    return Err("FU payload too short".to_string());
                }
                let indicator = [pkt.payload[0], pkt.payload[1]];
                let fu_header = pkt.payload[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let original_type = fu_header & 0x3f;
                let nal_header = [
                    (indicator[0] & 0x81) | (original_type << 1),
                    indicator[1],
                ];
                if start {
                    let mut data = BytesMut::with_capacity(pkt.payload.len());
                    data.put_slice(&nal_header);
                    data.extend_from_slice(&pkt.payload[3..]);
                    self.fu = Some(FuState {
                        nal_header,
                        data,
                        next_seq: pkt.sequence_number.wrapping_add(1),
                    });
                    if end {
                        let fu = self.fu.take().unwrap();
                        self.push_nalu(&pkt, fu.data.freeze());
                    }
                } else {
                    let mut fu = match self.fu.take() {
                        Some(fu) => fu,
                        None => return Err("FU continuation without a start fragment".to_string()),
                    };
                    if fu.next_seq != pkt.sequence_number {
                        log::debug!(
                            "discarding frame since a RTP packet is missing: expected seq={:04x} got={:04x}",
                            fu.next_seq,
                            pkt.sequence_number
                        );
                        self.au = None;
                        return Ok(());
                    }
                    fu.data.extend_from_slice(&pkt.payload[3..]);
                    fu.next_seq = pkt.sequence_number.wrapping_add(1);
                    if end {
                        self.push_nalu(&pkt, fu.data.freeze());
                    } else {
                        self.fu = Some(fu);
                    }
                }
            }
            _ => {
                return Err(format!("unsupported H.265 NAL unit type {}", nt));
            }
        }
        if pkt.mark {
            self.emit_au();
        }
        Ok(())
    }

    fn emit_au(&mut self) {
        let au = match self.au.take() {
            Some(au) => au,
            None => return,
        };
        if au.nalus.is_empty() {
            return;
        }
        let is_random_access_point = au.is_random_access_point();
        let is_disposable = au.is_disposable();
        let new_parameters = if au.new_params {
            self.parameters.build().map(Box::new)
        } else {
            None
        };
        let nalus: Vec<Bytes> = au.nalus.into_vec();
        let data = match annexb::avcc_marshal(&nalus) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("dropping access unit: {}", e);
                return;
            }
        };
        self.pending = Some(super::CodecItem::VideoFrame(super::VideoFrame {
            new_parameters,
            loss: au.loss,
            start_ctx: au.start_ctx,
            end_ctx: au.end_ctx,
            timestamp: au.timestamp,
            stream_id: au.stream_id,
            is_random_access_point,
            is_disposable,
            data,
        }));
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take()
    }
}

/// Mirrors [`super::h264::Packetizer`] for RFC 7798 framing.
pub struct Packetizer {
    max_payload_size: usize,
}

pub struct Packet {
    pub payload: Bytes,
    pub marker: bool,
}

impl Packetizer {
    pub fn new(max_payload_size: usize) -> Self {
        assert!(max_payload_size > 3, "max_payload_size too small for FU");
        Self { max_payload_size }
    }

    pub fn packetize(&self, nalus: &[Bytes]) -> Result<Vec<Packet>, String> {
        if nalus.is_empty() {
            return Err("cannot packetize an empty access unit".to_string());
        }
        let mut out = Vec::new();
        let mut batch: Vec<&Bytes> = Vec::new();
        let mut batch_len = 0usize;

        let flush_batch =
            |batch: &mut Vec<&Bytes>, batch_len: &mut usize, out: &mut Vec<Packet>| {
                if batch.is_empty() {
                    return;
                }
                if batch.len() == 1 {
                    out.push(Packet {
                        payload: batch[0].clone(),
                        marker: false,
                    });
                } else {
                    let mut buf = BytesMut::with_capacity(*batch_len + batch.len() * 2 + 2);
                    let header = batch[0];
                    buf.put_u8((header[0] & 0x81) | (NAL_TYPE_AP << 1));
                    buf.put_u8(header[1]);
                    for n in batch.iter() {
                        buf.put_u16(u16::try_from(n.len()).unwrap_or(u16::MAX));
                        buf.extend_from_slice(n);
                    }
                    out.push(Packet {
                        payload: buf.freeze(),
                        marker: false,
                    });
                }
                batch.clear();
                *batch_len = 0;
            };

        for nalu in nalus {
            if nalu.len() < 2 {
                continue;
            }
            if nalu.len() > self.max_payload_size {
                flush_batch(&mut batch, &mut batch_len, &mut out);
                self.fragment(nalu, &mut out);
                continue;
            }
            let additional = nalu.len() + 2;
            if !batch.is_empty() && batch_len + additional + 2 > self.max_payload_size {
                flush_batch(&mut batch, &mut batch_len, &mut out);
            }
            batch.push(nalu);
            batch_len += additional;
        }
        flush_batch(&mut batch, &mut batch_len, &mut out);
        if let Some(last) = out.last_mut() {
            last.marker = true;
        }
        Ok(out)
    }

    fn fragment(&self, nalu: &Bytes, out: &mut Vec<Packet>) {
        let indicator = [(nalu[0] & 0x81) | (NAL_TYPE_FU << 1), nalu[1]];
        let original_type = nal_type(nalu[0]);
        let body = &nalu[2..];
        let max_chunk = self.max_payload_size - 3;
        let mut pos = 0;
        let mut first = true;
        while pos < body.len() {
            let end = (pos + max_chunk).min(body.len());
            let is_last = end == body.len();
            let mut header = original_type;
            if first {
                header |= 0x80;
            }
            if is_last {
                header |= 0x40;
            }
            let mut buf = BytesMut::with_capacity(3 + (end - pos));
            buf.put_slice(&indicator);
            buf.put_u8(header);
            buf.extend_from_slice(&body[pos..end]);
            out.push(Packet {
                payload: buf.freeze(),
                marker: false,
            });
            pos = end;
            first = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;
    use std::time::SystemTime;

    fn ts(v: i64) -> crate::Timestamp {
        crate::Timestamp::new(v, NonZeroU32::new(90_000).unwrap(), SystemTime::UNIX_EPOCH)
    }

    fn rtp_packet(seq: u16, timestamp: i64, mark: bool, payload: &[u8]) -> crate::client::rtp::Packet {
        crate::client::rtp::Packet {
            ctx: crate::RtspMessageContext::new(0),
            channel_id: 0,
            stream_id: 0,
            timestamp: ts(timestamp),
            ssrc: 1,
            sequence_number: seq,
            loss: 0,
            mark,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn fu_reassembly_round_trips() {
        let mut dep = Depacketizer::new(90_000, None).unwrap();
        // IDR_W_RADL, layer/temporal bytes zeroed.
        let mut nalu = vec![(NAL_TYPE_IDR_W_RADL << 1), 1u8];
        nalu.extend(std::iter::repeat(0xEF).take(4000));
        let pkts = Packetizer::new(1460).packetize(&[Bytes::from(nalu.clone())]).unwrap();
        assert!(pkts.len() >= 3);
        for (i, p) in pkts.iter().enumerate() {
            dep.push(rtp_packet(i as u16, 500, p.marker, &p.payload)).unwrap();
        }
        let item = dep.pull().unwrap();
        match item {
            super::super::CodecItem::VideoFrame(f) => {
                assert!(f.is_random_access_point);
                assert_eq!(&f.data()[4..], &nalu[..]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn aggregation_packet_splits_into_two_nalus() {
        let mut dep = Depacketizer::new(90_000, None).unwrap();
        let a = [(1u8 << 1), 1, 0xAA];
        let b = [(1u8 << 1), 1, 0xBB];
        let mut payload = vec![(NAL_TYPE_AP << 1), 1];
        payload.extend_from_slice(&(a.len() as u16).to_be_bytes());
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&(b.len() as u16).to_be_bytes());
        payload.extend_from_slice(&b);
        dep.push(rtp_packet(0, 500, true, &payload)).unwrap();
        let item = dep.pull().unwrap();
        match item {
            super::super::CodecItem::VideoFrame(f) => {
                let nalus = annexb::avcc_unmarshal(f.data()).unwrap();
                assert_eq!(nalus.len(), 2);
            }
            _ => panic!("expected video frame"),
        }
    }
}
