// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.265 NAL unit parsing: headers and the VPS/SPS/PPS fields needed to walk
//! slice segment headers.
//!
//! This is an internal module, `pub` only for the benefit of fuzz testing.
//!
//! Relevant specifications:
//!
//! * [ITU-T H.265 "High efficiency video coding"](https://www.itu.int/rec/T-REC-H.265) is the
//!   main H.265 specification, including all the RBSP layouts described here.
//!
//! Every flag that gates an optional slice header field is kept, even when
//! its value is otherwise unused; skipping one would misalign every later
//! field of the slice header.

use std::borrow::Cow;

use crate::bits::{BitReader, unescape_rbsp};

/// Maximum entries in each half of a short-term reference picture set.
const MAX_DELTA_POCS: u32 = 16;

/// Whether a unit type is VCL or non-VCL, as defined in T.REC H.265 Table 7-1.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UnitTypeClass {
    Vcl { intra_coded: bool },
    NonVcl,
}

/// NAL unit type, as in T.REC H.265 Table 7-1.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum UnitType {
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,

    /// Access unit delimiter.
    AudNut = 35,

    /// End of sequence.
    EosNut = 36,

    /// End of bitstream.
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,

    /// Aggregation packet (RFC 7798 section 4.4.2).
    Ap = 48,

    /// Fragmentation unit (RFC 7798 section 4.4.3).
    Fu = 49,

    /// PACI packet (RFC 7798 section 4.4.4).
    Paci = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl UnitType {
    pub fn unit_type_class(self) -> UnitTypeClass {
        match u8::from(self) {
            0..=15 => UnitTypeClass::Vcl { intra_coded: false },
            16..=31 => UnitTypeClass::Vcl { intra_coded: true },
            _ => UnitTypeClass::NonVcl,
        }
    }

    /// Intra random access point: BLA, IDR, CRA, or reserved IRAP.
    #[inline]
    pub fn is_irap(self) -> bool {
        (16..=23).contains(&u8::from(self))
    }

    #[inline]
    pub fn is_idr(self) -> bool {
        matches!(self, UnitType::IdrWRadl | UnitType::IdrNLp)
    }

    #[inline]
    pub fn is_bla(self) -> bool {
        matches!(self, UnitType::BlaWLp | UnitType::BlaWRadl | UnitType::BlaNLp)
    }

    /// RADL or RASL leading picture.
    #[inline]
    pub fn is_leading(self) -> bool {
        (6..=9).contains(&u8::from(self))
    }

    /// Sub-layer non-reference picture (the `_N` VCL types).
    #[inline]
    pub fn is_sub_layer_non_reference(self) -> bool {
        let t = u8::from(self);
        t <= 14 && t % 2 == 0
    }
}

impl TryFrom<u8> for UnitType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value > 63 {
            return Err(format!("NAL 0x{value:02X} is out of range"));
        }

        // SAFETY: `UnitType` is `repr(u8)` and C-like; `value` is in range.
        Ok(unsafe { std::mem::transmute::<u8, UnitType>(value) })
    }
}

impl From<UnitType> for u8 {
    fn from(t: UnitType) -> u8 {
        t as u8
    }
}

/// `nal_unit_header` as in T.REC H.265 section 7.3.1.2.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Header([u8; 2]);

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("unit_type", &self.unit_type())
            .field("nuh_layer_id", &self.nuh_layer_id())
            .field("nuh_temporal_id_plus1", &self.nuh_temporal_id_plus1())
            .finish()
    }
}

impl TryFrom<[u8; 2]> for Header {
    type Error = String;

    fn try_from(value: [u8; 2]) -> Result<Self, Self::Error> {
        if (value[0] & 0b1000_0000) != 0 {
            return Err(format!(
                "forbidden zero bit is set in NAL header 0x{:02X}{:02X}",
                value[0], value[1]
            ));
        }
        if (value[1] & 0b111) == 0 {
            return Err(format!(
                "zero temporal_id_plus1 in NAL header 0x{:02X}{:02X}",
                value[0], value[1]
            ));
        }
        Ok(Self(value))
    }
}

impl std::ops::Deref for Header {
    type Target = [u8; 2];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Header {
    /// Returns a new header of the given unit type.
    pub fn with_unit_type(self, t: UnitType) -> Self {
        let mut out = self.0;
        out[0] = (out[0] & 0b1000_0001) | (u8::from(t) << 1);
        Self(out)
    }

    /// The NAL unit type.
    pub fn unit_type(self) -> UnitType {
        match UnitType::try_from(self.0[0] >> 1) {
            Ok(t) => t,
            Err(_) => unreachable!("6-bit value must be valid NAL type"),
        }
    }

    /// The `nuh_layer_id`, as a 6-bit value.
    pub fn nuh_layer_id(self) -> u8 {
        (self.0[0] & 0b1) << 5 | (self.0[1] >> 3)
    }

    /// The `nuh_temporal_id_plus1`, as a non-zero 3-bit value.
    pub fn nuh_temporal_id_plus1(self) -> u8 {
        self.0[1] & 0b111
    }

    /// `TemporalId`.
    pub fn temporal_id(self) -> u8 {
        self.nuh_temporal_id_plus1() - 1
    }
}

/// Splits a NAL unit (without start code) into the header and its RBSP, with
/// emulation prevention bytes removed.
pub fn split(nal: &[u8]) -> Result<(Header, Cow<'_, [u8]>), String> {
    let Some((hdr_bytes, rest)) = nal.split_first_chunk::<2>() else {
        return Err("NAL unit too short".to_owned());
    };
    let header = Header::try_from(*hdr_bytes)?;
    Ok((header, unescape_rbsp(rest)))
}

/// Returns `Ceil(Log2(n))`, the bit width of fields indexing `n` items.
pub(crate) fn ceil_log2(n: u32) -> u32 {
    if n <= 1 { 0 } else { 32 - (n - 1).leading_zeros() }
}

fn ue_at_most(r: &mut BitReader, name: &str, max: u32) -> Result<u32, String> {
    let v = r.read_ue();
    r.check(name)?;
    if v > max {
        return Err(format!("{name} {v} must be in [0, {max}]"));
    }
    Ok(v)
}

/// H.265 section 7.3.3, `profile_tier_level`, `if( profilePresentFlag )` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile(pub [u8; 11]);

impl Profile {
    fn from_bits(r: &mut BitReader) -> Self {
        let mut raw = [0u8; 11];
        for b in &mut raw {
            *b = r.read_bits(8) as u8;
        }
        Profile(raw)
    }

    #[inline]
    pub fn general_profile_space(&self) -> u8 {
        self.0[0] >> 6
    }

    #[inline]
    pub fn general_tier_flag(&self) -> bool {
        (self.0[0] & 0b0010_0000) != 0
    }

    #[inline]
    pub fn general_profile_idc(&self) -> u8 {
        self.0[0] & 0b0001_1111
    }
}

/// H.265 section 7.3.3.
#[derive(Debug, Clone)]
pub struct ProfileTierLevel {
    pub profile: Option<Profile>,
    pub general_level_idc: u8,
}

impl ProfileTierLevel {
    pub fn from_bits(
        r: &mut BitReader,
        profile_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> Result<Self, String> {
        let profile = profile_present_flag.then(|| Profile::from_bits(r));
        let general_level_idc = r.read_bits(8) as u8;
        let mut sub_layer_profile_present = [false; 8];
        let mut sub_layer_level_present = [false; 8];
        for i in 0..usize::from(max_sub_layers_minus1) {
            sub_layer_profile_present[i] = r.read_flag();
            sub_layer_level_present[i] = r.read_flag();
        }
        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                r.skip_bits(2); // reserved_zero_2bits
            }
        }
        for i in 0..usize::from(max_sub_layers_minus1) {
            if sub_layer_profile_present[i] {
                // sub_layer_profile_space through sub_layer_inbld_flag.
                r.skip_bits(88);
            }
            if sub_layer_level_present[i] {
                r.skip_bits(8); // sub_layer_level_idc
            }
        }
        r.check("profile_tier_level")?;
        Ok(Self {
            profile,
            general_level_idc,
        })
    }
}

/// Sub-layer ordering info for the highest sub-layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderingInfo {
    pub max_dec_pic_buffering_minus1: u32,
    pub max_num_reorder_pics: u32,
    pub max_latency_increase_plus1: u32,
}

impl OrderingInfo {
    /// Reads the `*_sub_layer_ordering_info_present_flag` loop shared by VPS
    /// and SPS, keeping the highest sub-layer's values.
    fn from_bits(r: &mut BitReader, max_sub_layers_minus1: u8) -> Result<Self, String> {
        let present = r.read_flag();
        let start = if present { 0 } else { max_sub_layers_minus1 };
        let mut info = OrderingInfo::default();
        for _ in start..=max_sub_layers_minus1 {
            info.max_dec_pic_buffering_minus1 =
                ue_at_most(r, "max_dec_pic_buffering_minus1", 15)?;
            info.max_num_reorder_pics =
                ue_at_most(r, "max_num_reorder_pics", info.max_dec_pic_buffering_minus1)?;
            info.max_latency_increase_plus1 = r.read_ue();
        }
        r.check("sub_layer_ordering_info")?;
        Ok(info)
    }
}

/// T.REC H.265 section E.2.2, `hrd_parameters`. Parsed only to advance the
/// cursor.
fn skip_hrd_parameters(
    r: &mut BitReader,
    common_inf_present_flag: bool,
    max_sub_layers_minus1: u8,
) -> Result<(), String> {
    let mut nal_hrd = false;
    let mut vcl_hrd = false;
    let mut sub_pic_hrd_params_present = false;
    if common_inf_present_flag {
        nal_hrd = r.read_flag();
        vcl_hrd = r.read_flag();
        if nal_hrd || vcl_hrd {
            sub_pic_hrd_params_present = r.read_flag();
            if sub_pic_hrd_params_present {
                r.skip_bits(8); // tick_divisor_minus2
                r.skip_bits(5); // du_cpb_removal_delay_increment_length_minus1
                r.skip_bits(1); // sub_pic_cpb_params_in_pic_timing_sei_flag
                r.skip_bits(5); // dpb_output_delay_du_length_minus1
            }
            r.skip_bits(4); // bit_rate_scale
            r.skip_bits(4); // cpb_size_scale
            if sub_pic_hrd_params_present {
                r.skip_bits(4); // cpb_size_du_scale
            }
            r.skip_bits(5); // initial_cpb_removal_delay_length_minus1
            r.skip_bits(5); // au_cpb_removal_delay_length_minus1
            r.skip_bits(5); // dpb_output_delay_length_minus1
        }
    }
    for _ in 0..=max_sub_layers_minus1 {
        let fixed_pic_rate_general_flag = r.read_flag();
        let fixed_pic_rate_within_cvs_flag = fixed_pic_rate_general_flag || r.read_flag();
        let mut low_delay_hrd_flag = false;
        if fixed_pic_rate_within_cvs_flag {
            r.read_ue(); // elemental_duration_in_tc_minus1
        } else {
            low_delay_hrd_flag = r.read_flag();
        }
        let cpb_cnt_minus1 = if low_delay_hrd_flag {
            0
        } else {
            ue_at_most(r, "cpb_cnt_minus1", 31)?
        };
        for present in [nal_hrd, vcl_hrd] {
            if !present {
                continue;
            }
            // sub_layer_hrd_parameters
            for _ in 0..=cpb_cnt_minus1 {
                r.read_ue(); // bit_rate_value_minus1
                r.read_ue(); // cpb_size_value_minus1
                if sub_pic_hrd_params_present {
                    r.read_ue(); // cpb_size_du_value_minus1
                    r.read_ue(); // bit_rate_du_value_minus1
                }
                r.skip_bits(1); // cbr_flag
            }
        }
        r.check("hrd_parameters")?;
    }
    Ok(())
}

/// Video parameter set, T.REC H.265 section 7.3.2.1.
#[derive(Debug, Clone)]
pub struct Vps {
    pub vps_video_parameter_set_id: u8,
    pub vps_max_layers_minus1: u8,
    pub vps_max_sub_layers_minus1: u8,
    pub vps_temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub ordering_info: OrderingInfo,
    pub timing_info: Option<TimingInfo>,
}

impl Vps {
    pub fn from_rbsp(rbsp: &[u8]) -> Result<Self, String> {
        let mut r = BitReader::new(rbsp);
        let vps_video_parameter_set_id = r.read_bits(4) as u8;
        r.skip_bits(1); // vps_base_layer_internal_flag
        r.skip_bits(1); // vps_base_layer_available_flag
        let vps_max_layers_minus1 = r.read_bits(6) as u8;
        let vps_max_sub_layers_minus1 = r.read_bits(3) as u8;
        if vps_max_sub_layers_minus1 > 6 {
            return Err("vps_max_sub_layers_minus1 must be in [0, 6]".to_owned());
        }
        let vps_temporal_id_nesting_flag = r.read_flag();
        if r.read_bits(16) != 0xffff {
            return Err("vps_reserved_0xffff_16bits is not 0xffff".to_owned());
        }
        let profile_tier_level = ProfileTierLevel::from_bits(&mut r, true, vps_max_sub_layers_minus1)?;
        let ordering_info = OrderingInfo::from_bits(&mut r, vps_max_sub_layers_minus1)?;
        let vps_max_layer_id = r.read_bits(6) as u32;
        let vps_num_layer_sets_minus1 = ue_at_most(&mut r, "vps_num_layer_sets_minus1", 1023)?;
        for _ in 1..=vps_num_layer_sets_minus1 {
            r.skip_bits(vps_max_layer_id as usize + 1); // layer_id_included_flag
        }
        let timing_info = if r.read_flag() {
            let num_units_in_tick = r.read_u32(32);
            let time_scale = r.read_u32(32);
            let num_ticks_poc_diff_one_minus1 = r.read_flag().then(|| r.read_ue());
            let vps_num_hrd_parameters =
                ue_at_most(&mut r, "vps_num_hrd_parameters", vps_num_layer_sets_minus1 + 1)?;
            for i in 0..vps_num_hrd_parameters {
                r.read_ue(); // hrd_layer_set_idx
                let cprms_present_flag = i == 0 || r.read_flag();
                skip_hrd_parameters(&mut r, cprms_present_flag, vps_max_sub_layers_minus1)?;
            }
            Some(TimingInfo {
                num_units_in_tick,
                time_scale,
                num_ticks_poc_diff_one_minus1,
            })
        } else {
            None
        };
        // vps_extension_flag and any extension data are not needed.
        r.skip_bits(1);
        r.check("VPS")?;
        Ok(Vps {
            vps_video_parameter_set_id,
            vps_max_layers_minus1,
            vps_max_sub_layers_minus1,
            vps_temporal_id_nesting_flag,
            profile_tier_level,
            ordering_info,
            timing_info,
        })
    }
}

/// Conformance cropping window, in chroma samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConformanceWindow {
    pub left_offset: u32,
    pub right_offset: u32,
    pub top_offset: u32,
    pub bottom_offset: u32,
}

impl ConformanceWindow {
    fn from_bits(r: &mut BitReader) -> Self {
        Self {
            left_offset: r.read_ue(),
            right_offset: r.read_ue(),
            top_offset: r.read_ue(),
            bottom_offset: r.read_ue(),
        }
    }
}

/// T.REC H.265 section 7.3.4, `scaling_list_data`. Parsed only to advance
/// the cursor.
fn skip_scaling_list_data(r: &mut BitReader) -> Result<(), String> {
    for size_id in 0..4 {
        let num_matrices = if size_id == 3 { 2 } else { 6 };
        for _ in 0..num_matrices {
            if !r.read_flag() {
                r.read_ue(); // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    r.read_se(); // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    r.read_se(); // scaling_list_delta_coef
                }
            }
        }
    }
    r.check("scaling_list_data")
}

/// T.REC H.265 section 7.3.7, `st_ref_pic_set`, with the derived
/// `DeltaPocS0`/`DeltaPocS1` lists of section 7.4.8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub delta_poc_s0: Vec<i32>,
    pub used_by_curr_pic_s0: Vec<bool>,
    pub delta_poc_s1: Vec<i32>,
    pub used_by_curr_pic_s1: Vec<bool>,
}

impl ShortTermRefPicSet {
    /// Parses set `st_rps_idx`. `sets` holds the SPS's sets parsed so far;
    /// `st_rps_idx == sets.len()` when called from a slice header, where the
    /// set may also be predicted from any SPS set.
    pub fn from_bits(
        r: &mut BitReader,
        st_rps_idx: usize,
        num_short_term_ref_pic_sets: usize,
        sets: &[ShortTermRefPicSet],
    ) -> Result<Self, String> {
        let inter_ref_pic_set_prediction_flag = st_rps_idx != 0 && r.read_flag();
        if !inter_ref_pic_set_prediction_flag {
            let num_negative_pics = ue_at_most(r, "num_negative_pics", MAX_DELTA_POCS)?;
            let num_positive_pics = ue_at_most(r, "num_positive_pics", MAX_DELTA_POCS)?;
            let mut set = ShortTermRefPicSet::default();
            let mut poc = 0i32;
            for _ in 0..num_negative_pics {
                poc -= ue_at_most(r, "delta_poc_s0_minus1", 0x7fff)? as i32 + 1;
                set.delta_poc_s0.push(poc);
                set.used_by_curr_pic_s0.push(r.read_flag());
            }
            poc = 0;
            for _ in 0..num_positive_pics {
                poc += ue_at_most(r, "delta_poc_s1_minus1", 0x7fff)? as i32 + 1;
                set.delta_poc_s1.push(poc);
                set.used_by_curr_pic_s1.push(r.read_flag());
            }
            r.check("st_ref_pic_set")?;
            return Ok(set);
        }

        let delta_idx_minus1 = if st_rps_idx == num_short_term_ref_pic_sets {
            ue_at_most(r, "delta_idx_minus1", st_rps_idx as u32 - 1)? as usize
        } else {
            0
        };
        let delta_rps_sign = r.read_flag();
        let abs_delta_rps_minus1 = ue_at_most(r, "abs_delta_rps_minus1", 0x7fff)? as i32;
        let delta_rps = if delta_rps_sign { -1 } else { 1 } * (abs_delta_rps_minus1 + 1);
        let ref_idx = st_rps_idx
            .checked_sub(delta_idx_minus1 + 1)
            .ok_or("delta_idx_minus1 out of range")?;
        let reference = sets
            .get(ref_idx)
            .ok_or_else(|| format!("st_ref_pic_set {st_rps_idx} predicted from missing set {ref_idx}"))?;
        let num_neg = reference.delta_poc_s0.len();
        let num_delta_pocs = reference.num_delta_pocs();
        let mut used_by_curr_pic_flag = Vec::with_capacity(num_delta_pocs + 1);
        let mut use_delta_flag = Vec::with_capacity(num_delta_pocs + 1);
        for _ in 0..=num_delta_pocs {
            let used = r.read_flag();
            used_by_curr_pic_flag.push(used);
            use_delta_flag.push(used || r.read_flag());
        }
        r.check("st_ref_pic_set")?;

        // Equations 7-61 and 7-62.
        let mut set = ShortTermRefPicSet::default();
        for j in (0..reference.delta_poc_s1.len()).rev() {
            let d_poc = reference.delta_poc_s1[j] + delta_rps;
            if d_poc < 0 && use_delta_flag[num_neg + j] {
                set.delta_poc_s0.push(d_poc);
                set.used_by_curr_pic_s0.push(used_by_curr_pic_flag[num_neg + j]);
            }
        }
        if delta_rps < 0 && use_delta_flag[num_delta_pocs] {
            set.delta_poc_s0.push(delta_rps);
            set.used_by_curr_pic_s0.push(used_by_curr_pic_flag[num_delta_pocs]);
        }
        for j in 0..num_neg {
            let d_poc = reference.delta_poc_s0[j] + delta_rps;
            if d_poc < 0 && use_delta_flag[j] {
                set.delta_poc_s0.push(d_poc);
                set.used_by_curr_pic_s0.push(used_by_curr_pic_flag[j]);
            }
        }
        for j in (0..num_neg).rev() {
            let d_poc = reference.delta_poc_s0[j] + delta_rps;
            if d_poc > 0 && use_delta_flag[j] {
                set.delta_poc_s1.push(d_poc);
                set.used_by_curr_pic_s1.push(used_by_curr_pic_flag[j]);
            }
        }
        if delta_rps > 0 && use_delta_flag[num_delta_pocs] {
            set.delta_poc_s1.push(delta_rps);
            set.used_by_curr_pic_s1.push(used_by_curr_pic_flag[num_delta_pocs]);
        }
        for j in 0..reference.delta_poc_s1.len() {
            let d_poc = reference.delta_poc_s1[j] + delta_rps;
            if d_poc > 0 && use_delta_flag[num_neg + j] {
                set.delta_poc_s1.push(d_poc);
                set.used_by_curr_pic_s1.push(used_by_curr_pic_flag[num_neg + j]);
            }
        }
        if set.num_delta_pocs() > 2 * MAX_DELTA_POCS as usize {
            return Err("predicted st_ref_pic_set is too large".to_owned());
        }
        Ok(set)
    }

    /// `NumDeltaPocs`.
    pub fn num_delta_pocs(&self) -> usize {
        self.delta_poc_s0.len() + self.delta_poc_s1.len()
    }

    /// Pictures of this set used by the current picture, contributing to
    /// `NumPicTotalCurr`.
    pub fn num_used_by_curr_pic(&self) -> u32 {
        self.used_by_curr_pic_s0
            .iter()
            .chain(&self.used_by_curr_pic_s1)
            .filter(|&&u| u)
            .count() as u32
    }
}

/// Timing information from the VPS or VUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub num_ticks_poc_diff_one_minus1: Option<u32>,
}

/// T.REC H.265 section E.2.1 `vui_parameters`.
#[derive(Debug, Clone)]
pub struct VuiParameters {
    pub aspect_ratio_idc: Option<u8>,
    pub timing_info: Option<TimingInfo>,
    pub min_spatial_segmentation_idc: Option<u16>,
}

impl VuiParameters {
    fn from_bits(r: &mut BitReader, sps_max_sub_layers_minus1: u8) -> Result<Self, String> {
        let aspect_ratio_idc = if r.read_flag() {
            let idc = r.read_bits(8) as u8;
            if idc == 255 {
                r.skip_bits(16); // sar_width
                r.skip_bits(16); // sar_height
            }
            Some(idc)
        } else {
            None
        };
        if r.read_flag() {
            r.skip_bits(1); // overscan_appropriate_flag
        }
        if r.read_flag() {
            // video_signal_type_present_flag
            r.skip_bits(3); // video_format
            r.skip_bits(1); // video_full_range_flag
            if r.read_flag() {
                r.skip_bits(8); // colour_primaries
                r.skip_bits(8); // transfer_characteristics
                r.skip_bits(8); // matrix_coeffs
            }
        }
        if r.read_flag() {
            r.read_ue(); // chroma_sample_loc_type_top_field
            r.read_ue(); // chroma_sample_loc_type_bottom_field
        }
        r.skip_bits(1); // neutral_chroma_indication_flag
        r.skip_bits(1); // field_seq_flag
        r.skip_bits(1); // frame_field_info_present_flag
        if r.read_flag() {
            // default_display_window_flag
            for _ in 0..4 {
                r.read_ue();
            }
        }
        let timing_info = if r.read_flag() {
            let num_units_in_tick = r.read_u32(32);
            let time_scale = r.read_u32(32);
            let num_ticks_poc_diff_one_minus1 = r.read_flag().then(|| r.read_ue());
            if r.read_flag() {
                skip_hrd_parameters(r, true, sps_max_sub_layers_minus1)?;
            }
            Some(TimingInfo {
                num_units_in_tick,
                time_scale,
                num_ticks_poc_diff_one_minus1,
            })
        } else {
            None
        };
        let min_spatial_segmentation_idc = if r.read_flag() {
            r.skip_bits(1); // tiles_fixed_structure_flag
            r.skip_bits(1); // motion_vectors_over_pic_boundaries_flag
            r.skip_bits(1); // restricted_ref_pic_lists_flag
            let idc = ue_at_most(r, "min_spatial_segmentation_idc", 4095)?;
            r.read_ue(); // max_bytes_per_pic_denom
            r.read_ue(); // max_bits_per_min_cu_denom
            r.read_ue(); // log2_max_mv_length_horizontal
            r.read_ue(); // log2_max_mv_length_vertical
            Some(idc as u16)
        } else {
            None
        };
        r.check("vui_parameters")?;
        Ok(Self {
            aspect_ratio_idc,
            timing_info,
            min_spatial_segmentation_idc,
        })
    }
}

/// Sequence parameter set, T.REC H.265 section 7.3.2.2.
#[derive(Debug, Clone)]
pub struct Sps {
    pub sps_video_parameter_set_id: u8,
    pub sps_max_sub_layers_minus1: u8,
    pub sps_temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sps_seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window: Option<ConformanceWindow>,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub ordering_info: OrderingInfo,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub short_term_ref_pic_sets: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,

    /// `used_by_curr_pic_lt_sps_flag` per candidate; the length is
    /// `num_long_term_ref_pics_sps`.
    pub used_by_curr_pic_lt_sps_flag: Vec<bool>,
    pub sps_temporal_mvp_enabled_flag: bool,
    pub vui: Option<VuiParameters>,
}

impl Sps {
    pub fn from_rbsp(rbsp: &[u8]) -> Result<Self, String> {
        // See T.REC H.265 section 7.3.2.2.1, seq_parameter_set_rbsp.
        let mut r = BitReader::new(rbsp);
        let sps_video_parameter_set_id = r.read_bits(4) as u8;
        let sps_max_sub_layers_minus1 = r.read_bits(3) as u8;
        if sps_max_sub_layers_minus1 > 6 {
            return Err("sps_max_sub_layers_minus1 must be in [0, 6]".to_owned());
        }
        let sps_temporal_id_nesting_flag = r.read_flag();
        let profile_tier_level =
            ProfileTierLevel::from_bits(&mut r, true, sps_max_sub_layers_minus1)?;
        let sps_seq_parameter_set_id = ue_at_most(&mut r, "sps_seq_parameter_set_id", 15)? as u8;
        let chroma_format_idc = ue_at_most(&mut r, "chroma_format_idc", 3)? as u8;
        let separate_colour_plane_flag = chroma_format_idc == 3 && r.read_flag();
        let pic_width_in_luma_samples = r.read_ue();
        let pic_height_in_luma_samples = r.read_ue();
        if pic_width_in_luma_samples == 0 || pic_height_in_luma_samples == 0 {
            r.check("pic dimensions")?;
            return Err("zero picture dimension".to_owned());
        }
        let conformance_window = r
            .read_flag()
            .then(|| ConformanceWindow::from_bits(&mut r));
        let bit_depth_luma_minus8 = ue_at_most(&mut r, "bit_depth_luma_minus8", 8)? as u8;
        let bit_depth_chroma_minus8 = ue_at_most(&mut r, "bit_depth_chroma_minus8", 8)? as u8;
        let log2_max_pic_order_cnt_lsb_minus4 =
            ue_at_most(&mut r, "log2_max_pic_order_cnt_lsb_minus4", 12)? as u8;
        let ordering_info = OrderingInfo::from_bits(&mut r, sps_max_sub_layers_minus1)?;
        let log2_min_luma_coding_block_size_minus3 =
            ue_at_most(&mut r, "log2_min_luma_coding_block_size_minus3", 3)? as u8;
        let log2_diff_max_min_luma_coding_block_size =
            ue_at_most(&mut r, "log2_diff_max_min_luma_coding_block_size", 3)? as u8;
        if log2_min_luma_coding_block_size_minus3 + log2_diff_max_min_luma_coding_block_size > 3 {
            return Err("CtbLog2SizeY must be at most 6".to_owned());
        }
        r.read_ue(); // log2_min_luma_transform_block_size_minus2
        r.read_ue(); // log2_diff_max_min_luma_transform_block_size
        r.read_ue(); // max_transform_hierarchy_depth_inter
        r.read_ue(); // max_transform_hierarchy_depth_intra
        if r.read_flag() && r.read_flag() {
            // scaling_list_enabled_flag && sps_scaling_list_data_present_flag
            skip_scaling_list_data(&mut r)?;
        }
        r.skip_bits(1); // amp_enabled_flag
        let sample_adaptive_offset_enabled_flag = r.read_flag();
        if r.read_flag() {
            // pcm_enabled_flag
            r.skip_bits(4); // pcm_sample_bit_depth_luma_minus1
            r.skip_bits(4); // pcm_sample_bit_depth_chroma_minus1
            r.read_ue(); // log2_min_pcm_luma_coding_block_size_minus3
            r.read_ue(); // log2_diff_max_min_pcm_luma_coding_block_size
            r.skip_bits(1); // pcm_loop_filter_disabled_flag
        }
        let num_short_term_ref_pic_sets =
            ue_at_most(&mut r, "num_short_term_ref_pic_sets", 64)? as usize;
        let mut short_term_ref_pic_sets = Vec::with_capacity(num_short_term_ref_pic_sets);
        for i in 0..num_short_term_ref_pic_sets {
            let set = ShortTermRefPicSet::from_bits(
                &mut r,
                i,
                num_short_term_ref_pic_sets,
                &short_term_ref_pic_sets,
            )?;
            short_term_ref_pic_sets.push(set);
        }
        let long_term_ref_pics_present_flag = r.read_flag();
        let mut used_by_curr_pic_lt_sps_flag = Vec::new();
        if long_term_ref_pics_present_flag {
            let num_long_term_ref_pics_sps = ue_at_most(&mut r, "num_long_term_ref_pics_sps", 32)?;
            for _ in 0..num_long_term_ref_pics_sps {
                r.skip_bits(usize::from(log2_max_pic_order_cnt_lsb_minus4) + 4); // lt_ref_pic_poc_lsb_sps
                used_by_curr_pic_lt_sps_flag.push(r.read_flag());
            }
        }
        let sps_temporal_mvp_enabled_flag = r.read_flag();
        r.skip_bits(1); // strong_intra_smoothing_enabled_flag
        let vui = if r.read_flag() {
            Some(VuiParameters::from_bits(&mut r, sps_max_sub_layers_minus1)?)
        } else {
            None
        };
        if r.read_flag() {
            // sps_extension_present_flag
            let sps_range_extension_flag = r.read_flag();
            let sps_multilayer_extension_flag = r.read_flag();
            let sps_3d_extension_flag = r.read_flag();
            let sps_scc_extension_flag = r.read_flag();
            r.skip_bits(4); // sps_extension_4bits
            if sps_range_extension_flag {
                // H.265 section 7.3.2.2.2: nine flags, none of which change
                // the slice header layout.
                r.skip_bits(9);
            }
            if sps_multilayer_extension_flag || sps_3d_extension_flag || sps_scc_extension_flag {
                return Err("multilayer, 3D, and SCC SPS extensions are unsupported".to_owned());
            }
        }
        r.check("SPS")?;
        Ok(Sps {
            sps_video_parameter_set_id,
            sps_max_sub_layers_minus1,
            sps_temporal_id_nesting_flag,
            profile_tier_level,
            sps_seq_parameter_set_id,
            chroma_format_idc,
            separate_colour_plane_flag,
            pic_width_in_luma_samples,
            pic_height_in_luma_samples,
            conformance_window,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            log2_max_pic_order_cnt_lsb_minus4,
            ordering_info,
            log2_min_luma_coding_block_size_minus3,
            log2_diff_max_min_luma_coding_block_size,
            sample_adaptive_offset_enabled_flag,
            short_term_ref_pic_sets,
            long_term_ref_pics_present_flag,
            used_by_curr_pic_lt_sps_flag,
            sps_temporal_mvp_enabled_flag,
            vui,
        })
    }

    /// `ChromaArrayType`.
    pub fn chroma_array_type(&self) -> u8 {
        if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }

    pub fn log2_max_pic_order_cnt_lsb(&self) -> u32 {
        u32::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4
    }

    /// `CtbLog2SizeY`.
    pub fn ctb_log2_size_y(&self) -> u32 {
        u32::from(self.log2_min_luma_coding_block_size_minus3)
            + 3
            + u32::from(self.log2_diff_max_min_luma_coding_block_size)
    }

    /// `PicSizeInCtbsY`.
    pub fn pic_size_in_ctbs_y(&self) -> u32 {
        let ctb_size = 1u32 << self.ctb_log2_size_y();
        let width = self.pic_width_in_luma_samples.div_ceil(ctb_size);
        let height = self.pic_height_in_luma_samples.div_ceil(ctb_size);
        width.saturating_mul(height)
    }

    /// Luma bit depth, 8 to 16.
    pub fn bit_depth(&self) -> u8 {
        self.bit_depth_luma_minus8 + 8
    }

    /// Returns the pixel dimensions `(width, height)`, unless the conformance
    /// cropping window is larger than the picture.
    pub fn pixel_dimensions(&self) -> Result<(u32, u32), String> {
        let mut width = self.pic_width_in_luma_samples;
        let mut height = self.pic_height_in_luma_samples;
        if let Some(c) = self.conformance_window {
            // The window is specified in chroma samples; see Table 6-1.
            let (sub_width_c, sub_height_c) = match self.chroma_array_type() {
                1 => (2, 2),
                2 => (2, 1),
                _ => (1, 1),
            };
            let horiz = c
                .left_offset
                .checked_add(c.right_offset)
                .and_then(|o| o.checked_mul(sub_width_c));
            let vert = c
                .top_offset
                .checked_add(c.bottom_offset)
                .and_then(|o| o.checked_mul(sub_height_c));
            width = horiz
                .and_then(|h| width.checked_sub(h))
                .ok_or_else(|| format!("conformance window {c:?} wider than picture"))?;
            height = vert
                .and_then(|v| height.checked_sub(v))
                .ok_or_else(|| format!("conformance window {c:?} taller than picture"))?;
        }
        Ok((width, height))
    }
}

/// Picture parameter set, T.REC H.265 section 7.3.2.3.
#[derive(Debug, Clone)]
pub struct Pps {
    pub pps_pic_parameter_set_id: u8,
    pub pps_seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i32,
    pub pps_cb_qp_offset: i32,
    pub pps_cr_qp_offset: i32,
    pub pps_slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub pps_loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    pub lists_modification_present_flag: bool,
    pub slice_segment_header_extension_present_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
}

impl Pps {
    pub fn from_rbsp(rbsp: &[u8]) -> Result<Self, String> {
        let mut r = BitReader::new(rbsp);
        let pps_pic_parameter_set_id = ue_at_most(&mut r, "pps_pic_parameter_set_id", 63)? as u8;
        let pps_seq_parameter_set_id = ue_at_most(&mut r, "pps_seq_parameter_set_id", 15)? as u8;
        let dependent_slice_segments_enabled_flag = r.read_flag();
        let output_flag_present_flag = r.read_flag();
        let num_extra_slice_header_bits = r.read_bits(3) as u8;
        r.skip_bits(1); // sign_data_hiding_enabled_flag
        let cabac_init_present_flag = r.read_flag();
        let num_ref_idx_l0_default_active_minus1 =
            ue_at_most(&mut r, "num_ref_idx_l0_default_active_minus1", 14)? as u8;
        let num_ref_idx_l1_default_active_minus1 =
            ue_at_most(&mut r, "num_ref_idx_l1_default_active_minus1", 14)? as u8;
        let init_qp_minus26 = r.read_se();
        r.skip_bits(1); // constrained_intra_pred_flag
        let transform_skip_enabled_flag = r.read_flag();
        if r.read_flag() {
            // cu_qp_delta_enabled_flag
            r.read_ue(); // diff_cu_qp_delta_depth
        }
        let pps_cb_qp_offset = r.read_se();
        let pps_cr_qp_offset = r.read_se();
        let pps_slice_chroma_qp_offsets_present_flag = r.read_flag();
        let weighted_pred_flag = r.read_flag();
        let weighted_bipred_flag = r.read_flag();
        r.skip_bits(1); // transquant_bypass_enabled_flag
        let tiles_enabled_flag = r.read_flag();
        let entropy_coding_sync_enabled_flag = r.read_flag();
        if tiles_enabled_flag {
            let num_tile_columns_minus1 = ue_at_most(&mut r, "num_tile_columns_minus1", 19)?;
            let num_tile_rows_minus1 = ue_at_most(&mut r, "num_tile_rows_minus1", 21)?;
            if !r.read_flag() {
                // !uniform_spacing_flag
                for _ in 0..num_tile_columns_minus1 {
                    r.read_ue(); // column_width_minus1
                }
                for _ in 0..num_tile_rows_minus1 {
                    r.read_ue(); // row_height_minus1
                }
            }
            r.skip_bits(1); // loop_filter_across_tiles_enabled_flag
        }
        let pps_loop_filter_across_slices_enabled_flag = r.read_flag();
        let mut deblocking_filter_override_enabled_flag = false;
        let mut pps_deblocking_filter_disabled_flag = false;
        if r.read_flag() {
            // deblocking_filter_control_present_flag
            deblocking_filter_override_enabled_flag = r.read_flag();
            pps_deblocking_filter_disabled_flag = r.read_flag();
            if !pps_deblocking_filter_disabled_flag {
                r.read_se(); // pps_beta_offset_div2
                r.read_se(); // pps_tc_offset_div2
            }
        }
        if r.read_flag() {
            // pps_scaling_list_data_present_flag
            skip_scaling_list_data(&mut r)?;
        }
        let lists_modification_present_flag = r.read_flag();
        r.read_ue(); // log2_parallel_merge_level_minus2
        let slice_segment_header_extension_present_flag = r.read_flag();
        let mut chroma_qp_offset_list_enabled_flag = false;
        if r.read_flag() {
            // pps_extension_present_flag
            let pps_range_extension_flag = r.read_flag();
            let pps_multilayer_extension_flag = r.read_flag();
            let pps_3d_extension_flag = r.read_flag();
            let pps_scc_extension_flag = r.read_flag();
            r.skip_bits(4); // pps_extension_4bits
            if pps_range_extension_flag {
                // H.265 section 7.3.2.3.2, pps_range_extension.
                if transform_skip_enabled_flag {
                    r.read_ue(); // log2_max_transform_skip_block_size_minus2
                }
                r.skip_bits(1); // cross_component_prediction_enabled_flag
                chroma_qp_offset_list_enabled_flag = r.read_flag();
                if chroma_qp_offset_list_enabled_flag {
                    r.read_ue(); // diff_cu_chroma_qp_offset_depth
                    let len_minus1 = ue_at_most(&mut r, "chroma_qp_offset_list_len_minus1", 5)?;
                    for _ in 0..=len_minus1 {
                        r.read_se(); // cb_qp_offset_list
                        r.read_se(); // cr_qp_offset_list
                    }
                }
                r.read_ue(); // log2_sao_offset_scale_luma
                r.read_ue(); // log2_sao_offset_scale_chroma
            }
            if pps_multilayer_extension_flag || pps_3d_extension_flag || pps_scc_extension_flag {
                return Err("multilayer, 3D, and SCC PPS extensions are unsupported".to_owned());
            }
        }
        r.check("PPS")?;
        Ok(Pps {
            pps_pic_parameter_set_id,
            pps_seq_parameter_set_id,
            dependent_slice_segments_enabled_flag,
            output_flag_present_flag,
            num_extra_slice_header_bits,
            cabac_init_present_flag,
            num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1,
            init_qp_minus26,
            pps_cb_qp_offset,
            pps_cr_qp_offset,
            pps_slice_chroma_qp_offsets_present_flag,
            weighted_pred_flag,
            weighted_bipred_flag,
            tiles_enabled_flag,
            entropy_coding_sync_enabled_flag,
            pps_loop_filter_across_slices_enabled_flag,
            deblocking_filter_override_enabled_flag,
            pps_deblocking_filter_disabled_flag,
            lists_modification_present_flag,
            slice_segment_header_extension_present_flag,
            chroma_qp_offset_list_enabled_flag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitWriter;
    use crate::testutil::init_logging;

    const SPS: &[u8] = b"\x42\x01\x01\x01\x60\x00\x00\x03\x00\xb0\x00\x00\x03\x00\x00\x03\x00\x5a\xa0\x05\x82\x01\xe1\x63\x6b\x92\x45\x2f\xcd\xc1\x41\x81\x41\x00\x00\x03\x00\x01\x00\x00\x03\x00\x0c\xa1";
    const PPS: &[u8] = b"\x44\x01\xc0\xf2\xc6\x8d\x03\xb3\x40";

    #[test]
    fn parse_sps() {
        init_logging();
        let (h, rbsp) = split(SPS).unwrap();
        assert_eq!(h.unit_type(), UnitType::SpsNut);
        let sps = Sps::from_rbsp(&rbsp).unwrap();
        assert_eq!(sps.sps_max_sub_layers_minus1, 0);
        assert_eq!(sps.sps_seq_parameter_set_id, 0);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.pixel_dimensions().unwrap(), (704, 480));
        assert_eq!(sps.bit_depth(), 8);
        assert_eq!(sps.log2_max_pic_order_cnt_lsb(), 16);
        assert_eq!(sps.ordering_info.max_num_reorder_pics, 0);
        assert_eq!(sps.ctb_log2_size_y(), 6);
        assert_eq!(sps.pic_size_in_ctbs_y(), 11 * 8);
        assert!(sps.sample_adaptive_offset_enabled_flag);
        assert!(sps.short_term_ref_pic_sets.is_empty());
        assert!(sps.long_term_ref_pics_present_flag);
        assert!(sps.used_by_curr_pic_lt_sps_flag.is_empty());
        assert!(sps.sps_temporal_mvp_enabled_flag);
        let timing = sps.vui.as_ref().unwrap().timing_info.unwrap();
        assert_eq!(timing.num_units_in_tick, 1);
        assert_eq!(timing.time_scale, 12);
        assert_eq!(sps.profile_tier_level.profile.as_ref().unwrap().general_profile_idc(), 1);
        assert_eq!(sps.profile_tier_level.general_level_idc, 90);
    }

    #[test]
    fn parse_pps() {
        init_logging();
        let (h, rbsp) = split(PPS).unwrap();
        assert_eq!(h.unit_type(), UnitType::PpsNut);
        let pps = Pps::from_rbsp(&rbsp).unwrap();
        assert_eq!(pps.pps_pic_parameter_set_id, 0);
        assert_eq!(pps.pps_seq_parameter_set_id, 0);
        assert!(!pps.dependent_slice_segments_enabled_flag);
        assert!(!pps.output_flag_present_flag);
        assert_eq!(pps.num_extra_slice_header_bits, 0);
        assert!(pps.cabac_init_present_flag);
        assert_eq!(pps.init_qp_minus26, 0);
        assert_eq!((pps.pps_cb_qp_offset, pps.pps_cr_qp_offset), (-6, -6));
        assert!(pps.pps_loop_filter_across_slices_enabled_flag);
        assert!(pps.deblocking_filter_override_enabled_flag);
        assert!(!pps.pps_deblocking_filter_disabled_flag);
        assert!(!pps.lists_modification_present_flag);
        assert!(pps.slice_segment_header_extension_present_flag);
    }

    #[test]
    fn parse_vps() {
        use base64::Engine as _;
        let nal = base64::engine::general_purpose::STANDARD
            .decode("QAEMAf//AWAAAAMAsAAAAwAAAwBarAwAAAMABAAAAwAyqA==")
            .unwrap();
        let (h, rbsp) = split(&nal).unwrap();
        assert_eq!(h.unit_type(), UnitType::VpsNut);
        let vps = Vps::from_rbsp(&rbsp).unwrap();
        assert_eq!(vps.vps_video_parameter_set_id, 0);
        assert_eq!(vps.vps_max_layers_minus1, 0);
        assert_eq!(vps.vps_max_sub_layers_minus1, 0);
        assert_eq!(
            vps.timing_info,
            Some(TimingInfo {
                num_units_in_tick: 1,
                time_scale: 12,
                num_ticks_poc_diff_one_minus1: Some(1),
            })
        );
    }

    #[test]
    fn truncated_sps() {
        let (_, rbsp) = split(SPS).unwrap();
        for len in [0, 5, 12, 20] {
            assert!(Sps::from_rbsp(&rbsp[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn bad_headers() {
        assert!(split(b"\x40").is_err());
        assert!(split(b"\xc0\x01").is_err());
        assert!(split(b"\x40\x00").is_err());
    }

    #[test]
    fn profile_tier_level_with_sub_layers() {
        // Two sub-layers: the second has profile and level info.
        let mut w = BitWriter::new();
        w.write_bits(8, 0x01); // profile space/tier/idc
        w.write_bits(32, 0x6000_0000);
        w.write_bits(48, 0);
        w.write_bits(8, 93); // general_level_idc
        w.write_bits(1, 1); // sub_layer_profile_present_flag[0]
        w.write_bits(1, 1); // sub_layer_level_present_flag[0]
        for _ in 1..8 {
            w.write_bits(2, 0); // reserved_zero_2bits
        }
        w.write_bits(64, 0); // sub-layer profile
        w.write_bits(24, 0);
        w.write_bits(8, 90); // sub_layer_level_idc[0]
        w.write_bits(8, 0xa5); // following data
        let data = w.into_bytes();
        let mut r = BitReader::new(&data);
        let ptl = ProfileTierLevel::from_bits(&mut r, true, 1).unwrap();
        assert_eq!(ptl.general_level_idc, 93);
        assert_eq!(r.read_bits(8), 0xa5);
        assert!(!r.overran());
    }

    #[test]
    fn st_ref_pic_set_prediction() {
        let mut w = BitWriter::new();
        // Set 0: two negative pictures at -1 and -2, both used.
        w.write_ue(2);
        w.write_ue(0);
        w.write_ue(0);
        w.write_bit(true);
        w.write_ue(0);
        w.write_bit(true);
        // Set 1: predicted from set 0 with deltaRps = -1, all used.
        w.write_bit(true); // inter_ref_pic_set_prediction_flag
        w.write_bit(true); // delta_rps_sign
        w.write_ue(0); // abs_delta_rps_minus1
        for _ in 0..3 {
            w.write_bit(true); // used_by_curr_pic_flag
        }
        let data = w.into_bytes();
        let mut r = BitReader::new(&data);
        let s0 = ShortTermRefPicSet::from_bits(&mut r, 0, 2, &[]).unwrap();
        assert_eq!(s0.delta_poc_s0, [-1, -2]);
        let s1 = ShortTermRefPicSet::from_bits(&mut r, 1, 2, &[s0]).unwrap();
        assert_eq!(s1.delta_poc_s0, [-1, -2, -3]);
        assert!(s1.delta_poc_s1.is_empty());
        assert_eq!(s1.num_used_by_curr_pic(), 3);
    }

    #[test]
    fn unit_type_roundtrip() {
        for raw in 0..64 {
            let unit_type = UnitType::try_from(raw).unwrap();
            assert_eq!(raw, u8::from(unit_type));
        }
        assert!(UnitType::try_from(64).is_err());
        assert!(UnitType::CraNut.is_irap());
        assert!(UnitType::IdrNLp.is_idr());
        assert!(UnitType::RaslN.is_leading());
        assert!(UnitType::TrailN.is_sub_layer_non_reference());
        assert!(!UnitType::TrailR.is_sub_layer_non_reference());
    }

    #[test]
    fn log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(88), 7);
        assert_eq!(ceil_log2(128), 7);
    }
}
