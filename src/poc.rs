// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Picture order count: display order of video pictures.
//!
//! Both H.264 (`pic_order_cnt_type` 0) and H.265 transmit only the low bits of
//! the POC in each slice header; the high bits are inferred from the previous
//! picture as in H.265 section 8.3.1.

/// Wraparound state carried from one picture to the next within a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PocContext {
    prev_msb: i64,
    prev_lsb: u32,

    /// Pictures since the last IDR, for streams that don't send POC bits.
    frames_since_idr: i64,
}

impl PocContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Computes the POC of a picture with the given `lsb`.
    ///
    /// `reset_msb` is true for pictures which start a new coded video
    /// sequence (IDR, BLA, or a CRA where decoding starts); their POC is just
    /// `lsb`. An IDR carries no lsb field, so its POC is 0.
    pub fn compute(&mut self, lsb: u32, log2_max_lsb: u32, reset_msb: bool) -> Result<i64, String> {
        self.compute_inner(lsb, log2_max_lsb, reset_msb, true)
    }

    /// As [`PocContext::compute`], but for H.265 pictures which may not
    /// serve as the reference for later wraparound decisions.
    ///
    /// Only pictures with `TemporalId` 0 that are not RASL, RADL, or
    /// sub-layer non-reference pictures update the context (H.265 section
    /// 8.3.1, `prevTid0Pic`).
    pub fn compute_h265(
        &mut self,
        lsb: u32,
        log2_max_lsb: u32,
        reset_msb: bool,
        is_prev_tid0_candidate: bool,
    ) -> Result<i64, String> {
        self.compute_inner(lsb, log2_max_lsb, reset_msb, reset_msb || is_prev_tid0_candidate)
    }

    fn compute_inner(
        &mut self,
        lsb: u32,
        log2_max_lsb: u32,
        reset_msb: bool,
        update: bool,
    ) -> Result<i64, String> {
        if !(4..=16).contains(&log2_max_lsb) {
            return Err(format!("log2_max_pic_order_cnt_lsb {log2_max_lsb} not in [4, 16]"));
        }
        let max_lsb = 1u32 << log2_max_lsb;
        if lsb >= max_lsb {
            return Err(format!("pic_order_cnt_lsb {lsb} >= {max_lsb}"));
        }
        let msb = if reset_msb {
            0
        } else if lsb < self.prev_lsb && self.prev_lsb - lsb >= max_lsb / 2 {
            self.prev_msb + i64::from(max_lsb)
        } else if lsb > self.prev_lsb && lsb - self.prev_lsb > max_lsb / 2 {
            self.prev_msb - i64::from(max_lsb)
        } else {
            self.prev_msb
        };
        if update {
            self.prev_msb = msb;
            self.prev_lsb = lsb;
        }
        self.frames_since_idr = if reset_msb { 0 } else { self.frames_since_idr + 1 };
        Ok(msb + i64::from(lsb))
    }

    /// Assigns a POC in arrival order, for H.264 `pic_order_cnt_type` 1 and 2.
    ///
    /// Type 2 streams have output order equal to decode order; type 1 streams
    /// are rare in practice and handled the same way.
    pub fn next_in_arrival_order(&mut self, is_idr: bool) -> i64 {
        if is_idr {
            self.reset();
        } else {
            self.frames_since_idr += 1;
        }
        2 * self.frames_since_idr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_forward() {
        let mut ctx = PocContext::new();
        let mut pocs = Vec::new();
        for (i, lsb) in (0..16).chain(0..2).enumerate() {
            pocs.push(ctx.compute(lsb, 4, i == 0).unwrap());
        }
        assert_eq!(pocs, (0..18).collect::<Vec<i64>>());
    }

    #[test]
    fn wraps_backward() {
        let mut ctx = PocContext::new();
        assert_eq!(ctx.compute(0, 4, true).unwrap(), 0);
        assert_eq!(ctx.compute(14, 4, false).unwrap(), -2);
        assert_eq!(ctx.compute(2, 4, false).unwrap(), 2);
    }

    #[test]
    fn reorder_within_window() {
        // Hierarchical B pictures in a 16-value lsb window, crossing one wrap.
        let mut ctx = PocContext::new();
        let lsbs = [0, 4, 2, 1, 3, 8, 6, 5, 7, 12, 10, 9, 11, 0, 14, 13, 15];
        let got: Vec<i64> = lsbs
            .into_iter()
            .enumerate()
            .map(|(i, lsb)| ctx.compute(lsb, 4, i == 0).unwrap())
            .collect();
        assert_eq!(got, [0, 4, 2, 1, 3, 8, 6, 5, 7, 12, 10, 9, 11, 16, 14, 13, 15]);
    }

    #[test]
    fn idr_resets() {
        let mut ctx = PocContext::new();
        for lsb in [0, 8, 15, 7] {
            ctx.compute(lsb, 4, false).unwrap();
        }
        assert_eq!(ctx.compute(0, 4, true).unwrap(), 0);
        assert_eq!(ctx.compute(2, 4, false).unwrap(), 2);
    }

    #[test]
    fn non_reference_pictures_keep_context() {
        let mut ctx = PocContext::new();
        assert_eq!(ctx.compute_h265(0, 4, true, true).unwrap(), 0);
        assert_eq!(ctx.compute_h265(2, 4, false, true).unwrap(), 2);

        // Had lsb 9 become the reference, lsb 1 would be taken as a wrap to 17.
        assert_eq!(ctx.compute_h265(9, 4, false, false).unwrap(), 9);
        assert_eq!(ctx.compute_h265(1, 4, false, true).unwrap(), 1);
    }

    #[test]
    fn rejects_bad_input() {
        let mut ctx = PocContext::new();
        assert!(ctx.compute(16, 4, false).is_err());
        assert!(ctx.compute(0, 3, false).is_err());
        assert!(ctx.compute(0, 17, false).is_err());
    }

    #[test]
    fn arrival_order() {
        let mut ctx = PocContext::new();
        assert_eq!(ctx.next_in_arrival_order(true), 0);
        assert_eq!(ctx.next_in_arrival_order(false), 2);
        assert_eq!(ctx.next_in_arrival_order(false), 4);
        assert_eq!(ctx.next_in_arrival_order(true), 0);
    }
}
