// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.265 `slice_segment_header`, T.REC H.265 section 7.3.6.1.
//!
//! The header is walked in full, through `byte_alignment()`, so a parameter
//! set mismatch shows up as an error rather than a silently wrong
//! `slice_pic_order_cnt_lsb`.

use crate::bits::BitReader;

use super::nal::{Header, Pps, ShortTermRefPicSet, Sps, UnitType, ceil_log2};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceType {
    B,
    P,
    I,
}

impl SliceType {
    fn from_ue(v: u32) -> Result<Self, String> {
        match v {
            0 => Ok(SliceType::B),
            1 => Ok(SliceType::P),
            2 => Ok(SliceType::I),
            _ => Err(format!("bad slice_type {v}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub slice_pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub slice_segment_address: u32,

    /// `None` for dependent slice segments, which inherit the rest of the
    /// header from the preceding independent segment.
    pub slice_type: Option<SliceType>,
    pub pic_output_flag: bool,

    /// 0 for IDR pictures, which don't carry the field.
    pub slice_pic_order_cnt_lsb: u32,

    /// `NumPicTotalCurr`.
    pub num_pic_total_curr: u32,
    pub slice_temporal_mvp_enabled_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub slice_qp_delta: i32,
    pub slice_deblocking_filter_disabled_flag: bool,
    pub num_entry_point_offsets: u32,

    /// Byte offset of `slice_segment_data` within the RBSP.
    pub header_len: usize,
}

/// Reads just `slice_pic_parameter_set_id`, so the caller can find the
/// parameter sets to pass to [`SliceHeader::parse`].
pub fn pic_parameter_set_id(header: Header, rbsp: &[u8]) -> Result<u8, String> {
    let mut r = BitReader::new(rbsp);
    r.skip_bits(1); // first_slice_segment_in_pic_flag
    if header.unit_type().is_irap() {
        r.skip_bits(1); // no_output_of_prior_pics_flag
    }
    let id = r.read_ue();
    r.check("slice_pic_parameter_set_id")?;
    u8::try_from(id)
        .ok()
        .filter(|&id| id <= 63)
        .ok_or_else(|| format!("slice_pic_parameter_set_id {id} out of range"))
}

impl SliceHeader {
    /// Parses the header of a VCL NAL unit's RBSP (after the 2-byte header).
    pub fn parse(header: Header, rbsp: &[u8], sps: &Sps, pps: &Pps) -> Result<Self, String> {
        let unit_type = header.unit_type();
        if !matches!(unit_type.unit_type_class(), super::nal::UnitTypeClass::Vcl { .. }) {
            return Err(format!("{unit_type:?} is not a slice segment"));
        }
        let mut r = BitReader::new(rbsp);
        let first_slice_segment_in_pic_flag = r.read_flag();
        let no_output_of_prior_pics_flag = unit_type.is_irap() && r.read_flag();
        let slice_pic_parameter_set_id = r.read_ue();
        if slice_pic_parameter_set_id != u32::from(pps.pps_pic_parameter_set_id) {
            return Err(format!(
                "slice references PPS {slice_pic_parameter_set_id}, given PPS {}",
                pps.pps_pic_parameter_set_id
            ));
        }
        if pps.pps_seq_parameter_set_id != sps.sps_seq_parameter_set_id {
            return Err(format!(
                "PPS references SPS {}, given SPS {}",
                pps.pps_seq_parameter_set_id, sps.sps_seq_parameter_set_id
            ));
        }
        let mut dependent_slice_segment_flag = false;
        let mut slice_segment_address = 0;
        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = r.read_flag();
            }
            let pic_size = sps.pic_size_in_ctbs_y();
            slice_segment_address = r.read_u32(ceil_log2(pic_size));
            if slice_segment_address >= pic_size {
                r.check("slice_segment_address")?;
                return Err(format!(
                    "slice_segment_address {slice_segment_address} >= PicSizeInCtbsY {pic_size}"
                ));
            }
        }
        let mut out = SliceHeader {
            first_slice_segment_in_pic_flag,
            no_output_of_prior_pics_flag,
            slice_pic_parameter_set_id: pps.pps_pic_parameter_set_id,
            dependent_slice_segment_flag,
            slice_segment_address,
            slice_type: None,
            pic_output_flag: true,
            slice_pic_order_cnt_lsb: 0,
            num_pic_total_curr: 0,
            slice_temporal_mvp_enabled_flag: false,
            num_ref_idx_l0_active_minus1: u32::from(pps.num_ref_idx_l0_default_active_minus1),
            num_ref_idx_l1_active_minus1: u32::from(pps.num_ref_idx_l1_default_active_minus1),
            slice_qp_delta: 0,
            slice_deblocking_filter_disabled_flag: pps.pps_deblocking_filter_disabled_flag,
            num_entry_point_offsets: 0,
            header_len: 0,
        };
        if !dependent_slice_segment_flag {
            out.parse_independent(&mut r, unit_type, sps, pps)?;
        }
        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            out.num_entry_point_offsets = r.read_ue();
            if out.num_entry_point_offsets > sps.pic_size_in_ctbs_y() {
                r.check("num_entry_point_offsets")?;
                return Err(format!(
                    "num_entry_point_offsets {} too large",
                    out.num_entry_point_offsets
                ));
            }
            if out.num_entry_point_offsets > 0 {
                let offset_len_minus1 = r.read_ue();
                if offset_len_minus1 > 31 {
                    r.check("offset_len_minus1")?;
                    return Err(format!("offset_len_minus1 {offset_len_minus1} > 31"));
                }
                r.skip_bits(out.num_entry_point_offsets as usize * (offset_len_minus1 as usize + 1));
            }
        }
        if pps.slice_segment_header_extension_present_flag {
            let len = r.read_ue();
            if len > 256 {
                r.check("slice_segment_header_extension_length")?;
                return Err(format!("slice_segment_header_extension_length {len} > 256"));
            }
            r.skip_bits(8 * len as usize);
        }

        // byte_alignment()
        if !r.read_flag() {
            r.check("slice_segment_header")?;
            return Err("slice segment header misaligned: alignment_bit_equal_to_one is 0".to_owned());
        }
        while !r.is_byte_aligned() && !r.overran() {
            if r.read_flag() {
                return Err("slice segment header misaligned: nonzero alignment bit".to_owned());
            }
        }
        r.check("slice_segment_header")?;
        out.header_len = r.position() / 8;
        Ok(out)
    }

    fn parse_independent(
        &mut self,
        r: &mut BitReader,
        unit_type: UnitType,
        sps: &Sps,
        pps: &Pps,
    ) -> Result<(), String> {
        r.skip_bits(usize::from(pps.num_extra_slice_header_bits)); // slice_reserved_flag
        let slice_type = SliceType::from_ue(r.read_ue())?;
        self.slice_type = Some(slice_type);
        if pps.output_flag_present_flag {
            self.pic_output_flag = r.read_flag();
        }
        if sps.separate_colour_plane_flag {
            r.skip_bits(2); // colour_plane_id
        }
        if !unit_type.is_idr() {
            self.slice_pic_order_cnt_lsb = r.read_u32(sps.log2_max_pic_order_cnt_lsb());
            let num_sets = sps.short_term_ref_pic_sets.len();
            let explicit;
            let st_rps: &ShortTermRefPicSet = if !r.read_flag() {
                // short_term_ref_pic_set_sps_flag == 0
                explicit = ShortTermRefPicSet::from_bits(
                    r,
                    num_sets,
                    num_sets,
                    &sps.short_term_ref_pic_sets,
                )?;
                &explicit
            } else {
                if num_sets == 0 {
                    return Err("slice selects an SPS st_ref_pic_set but SPS has none".to_owned());
                }
                let idx = r.read_u32(ceil_log2(num_sets as u32)) as usize;
                sps.short_term_ref_pic_sets
                    .get(idx)
                    .ok_or_else(|| format!("short_term_ref_pic_set_idx {idx} out of range"))?
            };
            let mut num_pic_total_curr = st_rps.num_used_by_curr_pic();
            if sps.long_term_ref_pics_present_flag {
                let num_lt_sps_candidates = sps.used_by_curr_pic_lt_sps_flag.len() as u32;
                let num_long_term_sps = if num_lt_sps_candidates > 0 {
                    r.read_ue()
                } else {
                    0
                };
                if num_long_term_sps > num_lt_sps_candidates {
                    r.check("num_long_term_sps")?;
                    return Err(format!("num_long_term_sps {num_long_term_sps} too large"));
                }
                let num_long_term_pics = r.read_ue();
                if num_long_term_sps + num_long_term_pics > 32 {
                    r.check("num_long_term_pics")?;
                    return Err("too many long-term pictures".to_owned());
                }
                for i in 0..num_long_term_sps + num_long_term_pics {
                    let used = if i < num_long_term_sps {
                        let lt_idx_sps = if num_lt_sps_candidates > 1 {
                            r.read_u32(ceil_log2(num_lt_sps_candidates)) as usize
                        } else {
                            0
                        };
                        *sps.used_by_curr_pic_lt_sps_flag
                            .get(lt_idx_sps)
                            .ok_or_else(|| format!("lt_idx_sps {lt_idx_sps} out of range"))?
                    } else {
                        r.skip_bits(sps.log2_max_pic_order_cnt_lsb() as usize); // poc_lsb_lt
                        r.read_flag() // used_by_curr_pic_lt_flag
                    };
                    if used {
                        num_pic_total_curr += 1;
                    }
                    if r.read_flag() {
                        r.read_ue(); // delta_poc_msb_cycle_lt
                    }
                }
            }
            self.num_pic_total_curr = num_pic_total_curr;
            if sps.sps_temporal_mvp_enabled_flag {
                self.slice_temporal_mvp_enabled_flag = r.read_flag();
            }
        }
        let mut slice_sao_luma_flag = false;
        let mut slice_sao_chroma_flag = false;
        if sps.sample_adaptive_offset_enabled_flag {
            slice_sao_luma_flag = r.read_flag();
            if sps.chroma_array_type() != 0 {
                slice_sao_chroma_flag = r.read_flag();
            }
        }
        if slice_type != SliceType::I {
            if r.read_flag() {
                // num_ref_idx_active_override_flag
                self.num_ref_idx_l0_active_minus1 = r.read_ue();
                if slice_type == SliceType::B {
                    self.num_ref_idx_l1_active_minus1 = r.read_ue();
                }
                if self.num_ref_idx_l0_active_minus1 > 14 || self.num_ref_idx_l1_active_minus1 > 14 {
                    r.check("num_ref_idx_active_minus1")?;
                    return Err("num_ref_idx_active_minus1 must be in [0, 14]".to_owned());
                }
            }
            if pps.lists_modification_present_flag && self.num_pic_total_curr > 1 {
                // ref_pic_lists_modification()
                let entry_bits = ceil_log2(self.num_pic_total_curr) as usize;
                if r.read_flag() {
                    r.skip_bits(entry_bits * (self.num_ref_idx_l0_active_minus1 as usize + 1));
                }
                if slice_type == SliceType::B && r.read_flag() {
                    r.skip_bits(entry_bits * (self.num_ref_idx_l1_active_minus1 as usize + 1));
                }
            }
            if slice_type == SliceType::B {
                r.skip_bits(1); // mvd_l1_zero_flag
            }
            if pps.cabac_init_present_flag {
                r.skip_bits(1); // cabac_init_flag
            }
            if self.slice_temporal_mvp_enabled_flag {
                let collocated_from_l0_flag = slice_type != SliceType::B || r.read_flag();
                if (collocated_from_l0_flag && self.num_ref_idx_l0_active_minus1 > 0)
                    || (!collocated_from_l0_flag && self.num_ref_idx_l1_active_minus1 > 0)
                {
                    r.read_ue(); // collocated_ref_idx
                }
            }
            if (pps.weighted_pred_flag && slice_type == SliceType::P)
                || (pps.weighted_bipred_flag && slice_type == SliceType::B)
            {
                self.skip_pred_weight_table(r, slice_type, sps)?;
            }
            let five_minus_max_num_merge_cand = r.read_ue();
            if five_minus_max_num_merge_cand > 4 {
                r.check("five_minus_max_num_merge_cand")?;
                return Err(format!(
                    "five_minus_max_num_merge_cand {five_minus_max_num_merge_cand} > 4"
                ));
            }
        }
        self.slice_qp_delta = r.read_se();
        if pps.pps_slice_chroma_qp_offsets_present_flag {
            r.read_se(); // slice_cb_qp_offset
            r.read_se(); // slice_cr_qp_offset
        }
        if pps.chroma_qp_offset_list_enabled_flag {
            r.skip_bits(1); // cu_chroma_qp_offset_enabled_flag
        }
        let deblocking_filter_override_flag =
            pps.deblocking_filter_override_enabled_flag && r.read_flag();
        if deblocking_filter_override_flag {
            self.slice_deblocking_filter_disabled_flag = r.read_flag();
            if !self.slice_deblocking_filter_disabled_flag {
                r.read_se(); // slice_beta_offset_div2
                r.read_se(); // slice_tc_offset_div2
            }
        }
        if pps.pps_loop_filter_across_slices_enabled_flag
            && (slice_sao_luma_flag
                || slice_sao_chroma_flag
                || !self.slice_deblocking_filter_disabled_flag)
        {
            r.skip_bits(1); // slice_loop_filter_across_slices_enabled_flag
        }
        r.check("slice_segment_header")
    }

    /// T.REC H.265 section 7.3.6.3, `pred_weight_table`, for single-layer
    /// streams where no reference picture shares the current POC.
    fn skip_pred_weight_table(
        &self,
        r: &mut BitReader,
        slice_type: SliceType,
        sps: &Sps,
    ) -> Result<(), String> {
        let chroma = sps.chroma_array_type() != 0;
        r.read_ue(); // luma_log2_weight_denom
        if chroma {
            r.read_se(); // delta_chroma_log2_weight_denom
        }
        let mut lists = vec![self.num_ref_idx_l0_active_minus1];
        if slice_type == SliceType::B {
            lists.push(self.num_ref_idx_l1_active_minus1);
        }
        for num_minus1 in lists {
            let n = num_minus1 as usize + 1;
            let luma_weight_flags: Vec<bool> = (0..n).map(|_| r.read_flag()).collect();
            let chroma_weight_flags: Vec<bool> = if chroma {
                (0..n).map(|_| r.read_flag()).collect()
            } else {
                vec![false; n]
            };
            for (luma, chroma) in luma_weight_flags.into_iter().zip(chroma_weight_flags) {
                if luma {
                    r.read_se(); // delta_luma_weight
                    r.read_se(); // luma_offset
                }
                if chroma {
                    for _ in 0..2 {
                        r.read_se(); // delta_chroma_weight
                        r.read_se(); // delta_chroma_offset
                    }
                }
            }
        }
        r.check("pred_weight_table")
    }
}
