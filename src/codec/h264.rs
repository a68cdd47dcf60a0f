// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 (RFC 6184) RTP payload framing: SPS/PPS parsing, the
//! depacketizer state machine (single NAL / STAP-A / FU-A, with the
//! Annex-B sniff and vendor workarounds described in §4.5), and the
//! aggregation/fragmentation encoder.

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::bitstream::{remove_emulation_prevention, BitstreamError, RbspReader};
use crate::codec::annexb;

const NAL_TYPE_MASK: u8 = 0x1f;
const NAL_TYPE_NON_IDR: u8 = 1;
const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SEI: u8 = 6;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_AUD: u8 = 9;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

fn nal_ref_idc(first_byte: u8) -> u8 {
    (first_byte >> 5) & 0x3
}

fn nal_type(first_byte: u8) -> u8 {
    first_byte & NAL_TYPE_MASK
}

/// A fully unmarshaled H.264 Sequence Parameter Set (§4.3), carrying the
/// subset of fields the rest of this crate's geometry/timing/DTS logic
/// needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u32,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub max_num_ref_frames: u32,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub crop: Option<CropRect>,
    pub vui: Option<Vui>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vui {
    pub aspect_ratio: Option<(u16, u16)>,
    pub timing_info: Option<TimingInfo>,
    pub nal_hrd: Option<HrdParameters>,
    pub bitstream_restriction: Option<BitstreamRestriction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HrdParameters {
    pub cpb_removal_delay_length_minus1: u32,
    pub dpb_output_delay_length_minus1: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitstreamRestriction {
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Sps {
    /// Unmarshals a Sequence Parameter Set from its NAL unit payload
    /// (NAL header byte included).
    pub fn parse(nalu: &[u8]) -> Result<Self, BitstreamError> {
        if nalu.is_empty() {
            return Err(BitstreamError::Eof);
        }
        let rbsp = remove_emulation_prevention(&nalu[1..]);
        let mut r = RbspReader::new(&rbsp);
        let profile_idc = r.read_u8(8)?;
        let constraint_flags = r.read_u8(8)?;
        let level_idc = r.read_u8(8)?;
        let seq_parameter_set_id = r.read_ue()?;

        let mut chroma_format_idc = 1u32;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                r.skip_bits(1)?; // separate_colour_plane_flag
            }
            r.skip_ue()?; // bit_depth_luma_minus8
            r.skip_ue()?; // bit_depth_chroma_minus8
            r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
            let seq_scaling_matrix_present = r.read_bit()?;
            if seq_scaling_matrix_present {
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..count {
                    let present = r.read_bit()?;
                    if present {
                        let size = if i < 6 { 16 } else { 64 };
                        skip_scaling_list(&mut r, size)?;
                    }
                }
            }
        }
        let log2_max_frame_num_minus4 = r.read_ue()?;
        let pic_order_cnt_type = r.read_ue()?;
        let mut log2_max_pic_order_cnt_lsb_minus4 = 0;
        if pic_order_cnt_type == 0 {
            log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
        } else if pic_order_cnt_type == 1 {
            r.skip_bits(1)?; // delta_pic_order_always_zero_flag
            r.skip_se()?; // offset_for_non_ref_pic
            r.skip_se()?; // offset_for_top_to_bottom_field
            let num_ref_frames_in_cycle = r.read_ue()?;
            for _ in 0..num_ref_frames_in_cycle {
                r.skip_se()?;
            }
        }
        let max_num_ref_frames = r.read_ue()?;
        r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only_flag = r.read_bit()?;
        if !frame_mbs_only_flag {
            r.skip_bits(1)?; // mb_adaptive_frame_field_flag
        }
        r.skip_bits(1)?; // direct_8x8_inference_flag
        let frame_cropping_flag = r.read_bit()?;
        let crop = if frame_cropping_flag {
            Some(CropRect {
                left: r.read_ue()?,
                right: r.read_ue()?,
                top: r.read_ue()?,
                bottom: r.read_ue()?,
            })
        } else {
            None
        };
        let vui_parameters_present = r.read_bit()?;
        let vui = if vui_parameters_present {
            Some(parse_vui(&mut r)?)
        } else {
            None
        };
        let _ = chroma_format_idc;
        Ok(Sps {
            profile_idc,
            constraint_flags,
            level_idc,
            seq_parameter_set_id,
            log2_max_frame_num_minus4,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4,
            max_num_ref_frames,
            pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1,
            frame_mbs_only_flag,
            crop,
            vui,
        })
    }

    /// Frame width in pixels, accounting for cropping.
    pub fn width(&self) -> u32 {
        let w = (self.pic_width_in_mbs_minus1 + 1) * 16;
        match &self.crop {
            Some(c) => w.saturating_sub(2 * (c.left + c.right)),
            None => w,
        }
    }

    /// Frame height in pixels, accounting for cropping and field coding.
    pub fn height(&self) -> u32 {
        let mul = if self.frame_mbs_only_flag { 1 } else { 2 };
        let h = (self.pic_height_in_map_units_minus1 + 1) * 16 * mul;
        match &self.crop {
            Some(c) => {
                let crop_mul = if self.frame_mbs_only_flag { 2 } else { 4 };
                h.saturating_sub(crop_mul * (c.top + c.bottom))
            }
            None => h,
        }
    }

    /// `(numerator, denominator)` frame rate, if VUI timing info is
    /// present: `fps = TimeScale / (2 * NumUnitsInTick)`.
    pub fn frame_rate(&self) -> Option<(u32, u32)> {
        let t = self.vui.as_ref()?.timing_info?;
        if t.num_units_in_tick == 0 {
            return None;
        }
        Some((t.time_scale, 2 * t.num_units_in_tick))
    }

    /// An RFC 6381 `avc1.PPCCLL` codec string.
    pub fn rfc6381_codec(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }

    pub fn max_num_reorder_frames(&self) -> Option<u32> {
        self.vui
            .as_ref()?
            .bitstream_restriction
            .map(|b| b.max_num_reorder_frames)
    }
}

fn skip_scaling_list(r: &mut RbspReader<'_>, size: usize) -> Result<(), BitstreamError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        last_scale = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };
    }
    Ok(())
}

fn parse_vui(r: &mut RbspReader<'_>) -> Result<Vui, BitstreamError> {
    let aspect_ratio_info_present = r.read_bit()?;
    let mut aspect_ratio = None;
    if aspect_ratio_info_present {
        let aspect_ratio_idc = r.read_u8(8)?;
        if aspect_ratio_idc == 255 {
            let w = r.read_bits(16)? as u16;
            let h = r.read_bits(16)? as u16;
            aspect_ratio = Some((w, h));
        }
    }
    let overscan_info_present = r.read_bit()?;
    if overscan_info_present {
        r.skip_bits(1)?;
    }
    let video_signal_type_present = r.read_bit()?;
    if video_signal_type_present {
        r.skip_bits(3)?; // video_format
        r.skip_bits(1)?; // video_full_range_flag
        let colour_description_present = r.read_bit()?;
        if colour_description_present {
            r.skip_bits(24)?;
        }
    }
    let chroma_loc_info_present = r.read_bit()?;
    if chroma_loc_info_present {
        r.skip_ue()?;
        r.skip_ue()?;
    }
    let timing_info_present = r.read_bit()?;
    let mut timing_info = None;
    if timing_info_present {
        let num_units_in_tick = r.read_bits(32)?;
        let time_scale = r.read_bits(32)?;
        r.skip_bits(1)?; // fixed_frame_rate_flag
        timing_info = Some(TimingInfo {
            num_units_in_tick,
            time_scale,
        });
    }
    let nal_hrd_present = r.read_bit()?;
    let nal_hrd = if nal_hrd_present {
        Some(parse_hrd(r)?)
    } else {
        None
    };
    let vcl_hrd_present = r.read_bit()?;
    let vcl_hrd = if vcl_hrd_present {
        Some(parse_hrd(r)?)
    } else {
        None
    };
    if nal_hrd_present || vcl_hrd_present {
        r.skip_bits(1)?; // low_delay_hrd_flag
    }
    r.skip_bits(1)?; // pic_struct_present_flag
    let bitstream_restriction_present = r.read_bit()?;
    let bitstream_restriction = if bitstream_restriction_present {
        r.skip_bits(1)?; // motion_vectors_over_pic_boundaries_flag
        r.skip_ue()?; // max_bytes_per_pic_denom
        r.skip_ue()?; // max_bits_per_mb_denom
        r.skip_ue()?; // log2_max_mv_length_horizontal
        r.skip_ue()?; // log2_max_mv_length_vertical
        let max_num_reorder_frames = r.read_ue()?;
        let max_dec_frame_buffering = r.read_ue()?;
        Some(BitstreamRestriction {
            max_num_reorder_frames,
            max_dec_frame_buffering,
        })
    } else {
        None
    };
    let _ = vcl_hrd;
    Ok(Vui {
        aspect_ratio,
        timing_info,
        nal_hrd,
        bitstream_restriction,
    })
}

fn parse_hrd(r: &mut RbspReader<'_>) -> Result<HrdParameters, BitstreamError> {
    let cpb_cnt_minus1 = r.read_ue()?;
    r.skip_bits(4)?; // bit_rate_scale
    r.skip_bits(4)?; // cpb_size_scale
    for _ in 0..=cpb_cnt_minus1 {
        r.skip_ue()?; // bit_rate_value_minus1
        r.skip_ue()?; // cpb_size_value_minus1
        r.skip_bits(1)?; // cbr_flag
    }
    let cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    let dpb_output_delay_length_minus1 = r.read_bits(5)?;
    r.skip_bits(5)?; // time_offset_length
    Ok(HrdParameters {
        cpb_removal_delay_length_minus1,
        dpb_output_delay_length_minus1,
    })
}

/// An in-progress access unit: NALUs observed since the last emitted frame,
/// sharing one RTP timestamp.
#[derive(Debug)]
struct AccessUnit {
    nalus: SmallVec<[Bytes; 8]>,
    timestamp: crate::Timestamp,
    start_ctx: crate::RtspMessageContext,
    end_ctx: crate::RtspMessageContext,
    loss: u16,
    stream_id: usize,
    new_sps_or_pps: bool,
}

impl AccessUnit {
    fn is_random_access_point(&self) -> bool {
        self.nalus
            .iter()
            .any(|n| !n.is_empty() && nal_type(n[0]) == NAL_TYPE_IDR)
    }

    fn is_disposable(&self) -> bool {
        self.nalus
            .iter()
            .all(|n| !n.is_empty() && nal_ref_idc(n[0]) == 0)
    }
}

#[derive(Debug, Default)]
struct FuState {
    nal_header: u8,
    data: BytesMut,
    next_seq: u16,
}

#[derive(Default)]
struct InternalParameters {
    sps: Option<(Bytes, Sps)>,
    pps: Option<Bytes>,
}

impl InternalParameters {
    fn build(&self) -> Option<super::VideoParameters> {
        let (sps_bytes, sps) = self.sps.as_ref()?;
        let pps_bytes = self.pps.as_ref()?;
        let extra_data = annexb::annexb_marshal(&[sps_bytes.clone(), pps_bytes.clone()]).ok()?;
        Some(super::VideoParameters {
            pixel_dimensions: (sps.width(), sps.height()),
            rfc6381_codec: sps.rfc6381_codec(),
            pixel_aspect_ratio: sps.vui.as_ref().and_then(|v| {
                v.aspect_ratio
                    .map(|(w, h)| (u32::from(w), u32::from(h)))
            }),
            frame_rate: sps.frame_rate(),
            extra_data,
        })
    }
}

/// Turns H.264 RTP packets (RFC 6184: single NAL, STAP-A, FU-A) into
/// access units, per the state machine in §4.5.
#[derive(Debug)]
pub struct Depacketizer {
    parameters: InternalParameters,
    fu: Option<FuState>,
    au: Option<AccessUnit>,
    pending: Option<super::CodecItem>,
    annexb_mode: bool,
}

impl std::fmt::Debug for InternalParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalParameters")
            .field("has_sps", &self.sps.is_some())
            .field("has_pps", &self.pps.is_some())
            .finish()
    }
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
                if let Some(v) = kv.strip_prefix("sprop-parameter-sets=") {
                    for (i, part) in v.split(',').enumerate() {
                        let decoded = base64::decode(part.trim())
                            .map_err(|e| format!("bad sprop-parameter-sets: {}", e))?;
                        if i == 0 {
                            let sps = Sps::parse(&decoded)
                                .map_err(|e| format!("bad SPS in sprop-parameter-sets: {}", e))?;
                            parameters.sps = Some((Bytes::from(decoded), sps));
                        } else if i == 1 {
                            parameters.pps = Some(Bytes::from(decoded));
                        }
                    }
                }
            }
        }
        Ok(Self {
            parameters,
            fu: None,
            au: None,
            pending: None,
            annexb_mode: false,
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
            new_sps_or_pps: false,
        });
    }

    fn observe_nalu(&mut self, nalu: &Bytes) {
        if nalu.is_empty() {
            return;
        }
        match nal_type(nalu[0]) {
            NAL_TYPE_SPS => {
                if !matches!(&self.parameters.sps, Some((b, _)) if b == nalu) {
                    if let Ok(sps) = Sps::parse(nalu) {
                        self.parameters.sps = Some((nalu.clone(), sps));
                        if let Some(au) = &mut self.au {
                            au.new_sps_or_pps = true;
                        }
                    }
                }
            }
            NAL_TYPE_PPS => {
                if self.parameters.pps.as_ref() != Some(nalu) {
                    self.parameters.pps = Some(nalu.clone());
                    if let Some(au) = &mut self.au {
                        au.new_sps_or_pps = true;
                    }
                }
            }
            _ => {}
        }
    }

    fn push_nalu(&mut self, pkt: &crate::client::rtp::Packet, nalu: Bytes) {
        self.observe_nalu(&nalu);
        if nal_type(nalu[0]) == NAL_TYPE_AUD {
            // The access unit delimiter carries no picture data; drop it
            // rather than counting it toward a frame's NALU list.
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
                // Timestamp changed without a marker bit (FLIR M400
                // doesn't set one); emit what we have so far.
                self.emit_au();
            }
        }
        if pkt.payload.is_empty() {
            return Err("empty H.264 RTP payload".to_string());
        }
        let first = pkt.payload[0];
        let nt = nal_type(first);
        match nt {
            1..=23 => {
                if self.annexb_mode {
                    for n in annexb::annexb_unmarshal(&pkt.payload)
                        .map_err(|e| format!("bad Annex-B-wrapped NALU: {}", e))?
                    {
                        self.push_nalu(&pkt, n);
                    }
                } else if contains_start_code(&pkt.payload) {
                    // A vendor wraps NALUs in Annex-B start codes even
                    // though the RTP payload format doesn't call for it.
                    // Switch modes permanently for this stream.
                    self.annexb_mode = true;
                    for n in annexb::annexb_unmarshal(&pkt.payload)
                        .map_err(|e| format!("bad Annex-B-wrapped NALU: {}", e))?
                    {
                        self.push_nalu(&pkt, n);
                    }
                } else {
                    self.push_nalu(&pkt, pkt.payload.clone());
                }
            }
            NAL_TYPE_STAP_A => {
                let mut data = &pkt.payload[1..];
                loop {
                    if data.len() < 2 {
                        break;
                    }
                    let size = usize::from(u16::from_be_bytes([data[0], data[1]]));
                    if size == 0 {
                        // Trailing all-zero padding is tolerated.
                        break;
                    }
                    if data.len() < 2 + size {
                        return Err("truncated STAP-A aggregation unit".to_string());
                    }
                    let nalu = Bytes::copy_from_slice(&data[2..2 + size]);
                    data = &data[2 + size..];
                    self.push_nalu(&pkt, nalu);
                }
            }
            NAL_TYPE_FU_A => {
                if pkt.payload.len() < 2 {
                    return Err("FU-A payload too short".to_string());
                }
                let indicator = first;
                let fu_header = pkt.payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let original_type = fu_header & NAL_TYPE_MASK;
                let nal_header = (indicator & 0xe0) | original_type;
                if start {
                    let mut data = BytesMut::with_capacity(pkt.payload.len());
                    data.put_u8(nal_header);
                    data.extend_from_slice(&pkt.payload[2..]);
                    self.fu = Some(FuState {
                        nal_header,
                        data,
                        next_seq: pkt.sequence_number.wrapping_add(1),
                    });
                    if end {
                        // Tolerated CostarHD behaviour: a single FU-A
                        // packet with both S and E set.
                        let fu = self.fu.take().unwrap();
                        self.finish_fu(&pkt, fu);
                    }
                } else {
                    let mut fu = match self.fu.take() {
                        Some(fu) => fu,
                        None => {
                            return Err(
                                "FU-A continuation without a start fragment".to_string()
                            )
                        }
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
                    fu.data.extend_from_slice(&pkt.payload[2..]);
                    fu.next_seq = pkt.sequence_number.wrapping_add(1);
                    if end {
                        self.finish_fu(&pkt, fu);
                    } else {
                        self.fu = Some(fu);
                    }
                }
            }
            _ => {
                return Err(format!("unsupported H.264 NAL unit type {}", nt));
            }
        }
        if pkt.mark {
            self.emit_au();
        }
        Ok(())
    }

    /// Finishes a fragmented NALU. Per the open design question (§9), the
    /// Amatek AR-N3222F workaround for start codes embedded inside an FU is
    /// resolved leniently: if the reassembled payload itself contains an
    /// embedded Annex-B start code, both the pre-start-code data and the
    /// NALU(s) after it are emitted, rather than discarding the trailer.
    fn finish_fu(&mut self, pkt: &crate::client::rtp::Packet, fu: FuState) {
        let reassembled = fu.data.freeze();
        if let Some(pos) = find_embedded_start_code(&reassembled[1..]) {
            let split_at = 1 + pos;
            let head = reassembled.slice(0..split_at);
            self.push_nalu(pkt, head);
            let tail = reassembled.slice(split_at..);
            if let Ok(extra) = annexb::annexb_unmarshal(&tail) {
                for n in extra {
                    self.push_nalu(pkt, n);
                }
            }
        } else {
            self.push_nalu(pkt, reassembled);
        }
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
        let new_parameters = if au.new_sps_or_pps {
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

fn contains_start_code(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == [0, 0, 0, 1])
}

fn find_embedded_start_code(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == [0, 0, 0, 1])
}

/// Greedily packetizes an access unit (ordered NALUs, Annex-B or AVCC
/// framed) into RTP payloads: single NAL when a NALU fits whole, FU-A
/// fragments when it doesn't, STAP-A aggregation when multiple small
/// NALUs can share one packet (§4.5's encoder).
pub struct Packetizer {
    max_payload_size: usize,
}

/// One packetized RTP payload, ready to have sequence number/timestamp/
/// SSRC/marker applied by the caller's RTP layer.
pub struct Packet {
    pub payload: Bytes,
    pub marker: bool,
}

impl Packetizer {
    pub fn new(max_payload_size: usize) -> Self {
        assert!(max_payload_size > 3, "max_payload_size too small for FU-A");
        Self { max_payload_size }
    }

    /// Packetizes one access unit's NALUs into a sequence of RTP payloads.
    /// The marker bit is set on the last packet.
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
                    let mut buf = BytesMut::with_capacity(*batch_len + batch.len() * 2 + 1);
                    let max_ref_idc = batch
                        .iter()
                        .map(|n| nal_ref_idc(n[0]))
                        .max()
                        .unwrap_or(0);
                    buf.put_u8((max_ref_idc << 5) | NAL_TYPE_STAP_A);
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
            if nalu.len() > self.max_payload_size {
                flush_batch(&mut batch, &mut batch_len, &mut out);
                self.fragment(nalu, &mut out);
                continue;
            }
            // +2 bytes per NALU for the STAP-A size prefix; +1 for the
            // aggregation unit's own NAL header, amortized once.
            let additional = nalu.len() + 2;
            if !batch.is_empty() && batch_len + additional + 1 > self.max_payload_size {
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
        let indicator = (nal_ref_idc(nalu[0]) << 5) | NAL_TYPE_FU_A;
        let original_type = nal_type(nalu[0]);
        let body = &nalu[1..];
        let max_chunk = self.max_payload_size - 2;
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
            let mut buf = BytesMut::with_capacity(2 + (end - pos));
            buf.put_u8(indicator);
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

    // SPS fixture from a known bitstream-restriction cropping case
    // (profile_idc=0x64=100, level 0x2a=42): 1920x1088 coded, cropped
    // vertically to 1080, VUI timing 1/60 -> 30fps.
    #[test]
    fn sps_parse_dimensions_and_fps() {
        // Minimal but syntactically valid high-profile SPS exercising
        // chroma_format_idc / scaling-list skip, frame cropping and VUI
        // timing. Constructed bit-by-bit rather than taken from a live
        // camera capture.
        let mut bits = BitWriter::new();
        bits.push_u(8, 100); // profile_idc
        bits.push_u(8, 0); // constraint flags
        bits.push_u(8, 42); // level_idc
        bits.push_ue(0); // sps id
        bits.push_ue(1); // chroma_format_idc = 4:2:0
        bits.push_ue(0); // bit_depth_luma_minus8
        bits.push_ue(0); // bit_depth_chroma_minus8
        bits.push_bit(false); // qpprime_y_zero_transform_bypass_flag
        bits.push_bit(false); // seq_scaling_matrix_present
        bits.push_ue(0); // log2_max_frame_num_minus4
        bits.push_ue(0); // pic_order_cnt_type
        bits.push_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        bits.push_ue(2); // max_num_ref_frames
        bits.push_bit(false); // gaps_in_frame_num_value_allowed_flag
        bits.push_ue(119); // pic_width_in_mbs_minus1 -> 120*16=1920
        bits.push_ue(67); // pic_height_in_map_units_minus1 -> 68*16=1088
        bits.push_bit(true); // frame_mbs_only_flag
        bits.push_bit(true); // direct_8x8_inference_flag
        bits.push_bit(true); // frame_cropping_flag
        bits.push_ue(0); // crop_left
        bits.push_ue(0); // crop_right
        bits.push_ue(0); // crop_top
        bits.push_ue(4); // crop_bottom -> CropUnitY(2)*4=8px from bottom: 1088-8=1080
        bits.push_bit(true); // vui_parameters_present_flag
        bits.push_bit(false); // aspect_ratio_info_present_flag
        bits.push_bit(false); // overscan_info_present_flag
        bits.push_bit(false); // video_signal_type_present_flag
        bits.push_bit(false); // chroma_loc_info_present_flag
        bits.push_bit(true); // timing_info_present_flag
        bits.push_u(32, 1); // num_units_in_tick
        bits.push_u(32, 60); // time_scale -> fps = 60/(2*1) = 30
        bits.push_bit(true); // fixed_frame_rate_flag
        bits.push_bit(false); // nal_hrd_parameters_present_flag
        bits.push_bit(false); // vcl_hrd_parameters_present_flag
        bits.push_bit(false); // pic_struct_present_flag
        bits.push_bit(false); // bitstream_restriction_flag
        bits.push_bit(true); // rbsp_stop_one_bit

        let mut nalu = vec![0x67u8];
        nalu.extend_from_slice(&bits.into_bytes());
        let sps = Sps::parse(&nalu).unwrap();
        assert_eq!(sps.width(), 1920);
        assert_eq!(sps.height(), 1080);
        assert_eq!(sps.frame_rate(), Some((60, 2)));
    }

    #[test]
    fn fu_a_reassembly_with_drop_detection() {
        let mut dep = Depacketizer::new(90_000, None).unwrap();
        let mut nalu = vec![0x65u8]; // IDR slice
        nalu.extend(std::iter::repeat(0xAB).take(5000));
        let pkts = Packetizer::new(1460).packetize(&[Bytes::from(nalu.clone())]).unwrap();
        assert!(pkts.len() >= 4);

        // Drop the middle packet; verify the depacketizer discards the AU
        // rather than emitting corrupted data.
        for (i, p) in pkts.iter().enumerate() {
            if i == pkts.len() / 2 {
                continue;
            }
            dep.push(rtp_packet(i as u16, 1000, p.marker, &p.payload)).unwrap();
        }
        assert!(dep.pull().is_none());
    }

    #[test]
    fn fu_a_reassembly_round_trips_without_loss() {
        let mut dep = Depacketizer::new(90_000, None).unwrap();
        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(0xCD).take(5000));
        let pkts = Packetizer::new(1460).packetize(&[Bytes::from(nalu.clone())]).unwrap();
        assert!(pkts.len() >= 4);
        for (i, p) in pkts.iter().enumerate() {
            dep.push(rtp_packet(i as u16, 1000, p.marker, &p.payload)).unwrap();
        }
        let item = dep.pull().unwrap();
        match item {
            super::super::CodecItem::VideoFrame(f) => {
                assert!(f.is_random_access_point);
                let avcc = f.data();
                assert_eq!(&avcc[4..], &nalu[..]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn stap_a_aggregates_two_nalus() {
        let mut dep = Depacketizer::new(90_000, None).unwrap();
        let a = [0x67u8, 1, 2];
        let b = [0x68u8, 3, 4];
        let mut payload = vec![24u8]; // STAP-A
        payload.extend_from_slice(&(a.len() as u16).to_be_bytes());
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&(b.len() as u16).to_be_bytes());
        payload.extend_from_slice(&b);
        dep.push(rtp_packet(0, 1000, true, &payload)).unwrap();
        let item = dep.pull().unwrap();
        match item {
            super::super::CodecItem::VideoFrame(f) => {
                let avcc = f.data();
                let nalus = annexb::avcc_unmarshal(avcc).unwrap();
                assert_eq!(nalus.len(), 2);
                assert_eq!(&nalus[0][..], &a[..]);
                assert_eq!(&nalus[1][..], &b[..]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn stap_a_stops_at_trailing_zero_padding() {
        let mut dep = Depacketizer::new(90_000, None).unwrap();
        let payload: [u8; 11] = [
            0x18, 0x00, 0x02, 0xAA, 0xBB, 0x00, 0x02, 0xCC, 0xDD, 0x00, 0x00,
        ];
        dep.push(rtp_packet(0, 1000, true, &payload)).unwrap();
        let item = dep.pull().unwrap();
        match item {
            super::super::CodecItem::VideoFrame(f) => {
                let avcc = f.data();
                let nalus = annexb::avcc_unmarshal(avcc).unwrap();
                assert_eq!(nalus.len(), 2);
                assert_eq!(&nalus[0][..], &[0xAA, 0xBB]);
                assert_eq!(&nalus[1][..], &[0xCC, 0xDD]);
            }
            _ => panic!("expected video frame"),
        }
    }

    /// Small big-endian bit writer used only to build synthetic SPS
    /// fixtures for tests above.
    struct BitWriter {
        bytes: Vec<u8>,
        bit_pos: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: vec![0],
                bit_pos: 0,
            }
        }

        fn push_bit(&mut self, bit: bool) {
            if self.bit_pos == 8 {
                self.bytes.push(0);
                self.bit_pos = 0;
            }
            if bit {
                let idx = self.bytes.len() - 1;
                self.bytes[idx] |= 1 << (7 - self.bit_pos);
            }
            self.bit_pos += 1;
        }

        fn push_u(&mut self, n: u8, v: u32) {
            for i in (0..n).rev() {
                self.push_bit((v >> i) & 1 != 0);
            }
        }

        fn push_ue(&mut self, v: u32) {
            let code = v + 1;
            let bits = 32 - code.leading_zeros();
            for _ in 0..bits - 1 {
                self.push_bit(false);
            }
            self.push_u(bits as u8, code);
        }

        fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }
    }
}
