// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.

use std::collections::VecDeque;

use bytes::Bytes;
use h264_reader::nal::sps::{FrameMbsFlags, PicOrderCntType, SeqParameterSet};
use h264_reader::rbsp::{BitRead, BitReader, ByteReader};
use log::{debug, warn};

use crate::Timestamp;
use crate::poc::PocContext;
use crate::rtp::ReceivedPacket;

use super::h26x::{FragmentationState, TolerantBitReader, with_start_code};
use super::{NalUnit, VideoCodec};

pub const UNIT_TYPE_IDR: u8 = 5;
pub const UNIT_TYPE_SPS: u8 = 7;
pub const UNIT_TYPE_PPS: u8 = 8;

/// Maximum DPB size in frames; used as the reorder depth.
pub const MAX_REORDER_DEPTH: usize = 16;

/// Reassembles H.264 NAL units from RTP packets per
/// [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
///
/// Handles single NAL unit packets and FU-A. STAP-A is dropped with a log
/// message; the other aggregation and fragmentation modes are rejected.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    frag: FragmentationState,
    pending: VecDeque<NalUnit>,

    /// Loss not yet attributed to an emitted NAL unit.
    loss: u16,

    seen_stap_a: bool,
}

impl Depacketizer {
    pub(crate) fn new(max_fragment_slots: usize) -> Self {
        Depacketizer {
            frag: FragmentationState::new(max_fragment_slots),
            pending: VecDeque::new(),
            loss: 0,
            seen_stap_a: false,
        }
    }

    pub(crate) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        if pkt.loss() > 0 {
            self.loss = self.loss.saturating_add(pkt.loss());
            if self.frag.discard() {
                debug!(
                    "discarding in-progress FU-A after loss of {} packet(s) before seq {:04x}",
                    pkt.loss(),
                    pkt.sequence_number()
                );
            }
        }
        let timestamp = pkt.timestamp();
        let mark = pkt.mark();
        let seq = pkt.sequence_number();
        let data = pkt.into_payload_bytes();
        let Some(&nal_header) = data.first() else {
            return Err(format!("empty NAL in packet seq {seq:04x}"));
        };
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header {nal_header:02x} has F bit set"));
        }
        match nal_header & 0b1_1111 {
            1..=23 => {
                if self.frag.discard() {
                    debug!("single NAL unit in seq {seq:04x} interrupted an in-progress FU-A");
                }
                self.emit(with_start_code(&data), timestamp, mark);
                Ok(())
            }
            24 => {
                // STAP-A. Real cameras seldom send these, and only for
                // parameter sets which are also available from SDP.
                if !self.seen_stap_a {
                    self.seen_stap_a = true;
                    warn!("dropping unsupported STAP-A packet seq {seq:04x}; further ones logged at debug");
                } else {
                    debug!("dropping STAP-A packet seq {seq:04x}");
                }
                Ok(())
            }
            t @ (25..=27 | 29) => Err(format!(
                "unimplemented/unexpected interleaved mode NAL ({nal_header:02x}, type {t}) in seq {seq:04x}"
            )),
            28 => {
                // FU-A.
                if data.len() < 3 {
                    return Err(format!("FU-A is too short in seq {seq:04x}"));
                }
                let fu_header = data[1];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let reserved = (fu_header & 0b0010_0000) != 0;
                let hdr = (nal_header & 0b1110_0000) | (fu_header & 0b0001_1111);
                if !matches!(hdr & 0b1_1111, 1..=23) || reserved || (start && end) {
                    return Err(format!("bad FU-A header {fu_header:02x} in seq {seq:04x}"));
                }
                let piece = data.slice(2..);
                if start {
                    if self.frag.start(&[hdr], piece, timestamp) {
                        debug!("FU-A start in seq {seq:04x} interrupted an unfinished FU-A");
                    }
                    if mark {
                        self.finish(mark);
                    }
                    return Ok(());
                }
                if self.frag.append(&[hdr], piece, timestamp)? && (end || mark) {
                    self.finish(mark);
                }
                Ok(())
            }
            t => Err(format!(
                "bad NAL header {nal_header:02x} (reserved type {t}) in seq {seq:04x}"
            )),
        }
    }

    pub(crate) fn pull(&mut self) -> Option<NalUnit> {
        self.pending.pop_front()
    }

    pub(crate) fn reset(&mut self) {
        self.frag.reset();
        self.pending.clear();
        self.loss = 0;
    }

    fn finish(&mut self, mark: bool) {
        if let Some((data, timestamp)) = self.frag.finish() {
            self.emit(data, timestamp, mark);
        }
    }

    fn emit(&mut self, data: Bytes, timestamp: Timestamp, mark: bool) {
        let unit_type = data[super::START_CODE.len()] & 0b1_1111;
        self.pending.push_back(NalUnit {
            codec: VideoCodec::H264,
            unit_type,
            data,
            timestamp,
            mark,
            loss: std::mem::take(&mut self.loss),
        });
    }
}

/// Decodes an SDP `sprop-parameter-sets` value into SPS and PPS NAL units,
/// each prefixed with the Annex B start code.
pub fn parse_sprop_parameter_sets(value: &str) -> Result<(Bytes, Bytes), String> {
    use base64::Engine as _;
    let mut sps = None;
    let mut pps = None;
    for encoded in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let nal = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| format!("bad parameter set {encoded:?}: invalid base64 encoding"))?;

        // GW Security GW4089IP leaves Annex B start codes at the end of both
        // SPS and PPS. Strip them so the in-band sets compare equal.
        let nal = nal.strip_suffix(b"\x00\x00\x00\x01").unwrap_or(&nal);
        let Some(&hdr) = nal.first() else {
            return Err("empty NAL in sprop-parameter-sets".to_owned());
        };
        let slot = match hdr & 0b1_1111 {
            UNIT_TYPE_SPS => &mut sps,
            UNIT_TYPE_PPS => &mut pps,
            t => return Err(format!("unexpected NAL type {t} in sprop-parameter-sets")),
        };
        if slot.is_some() {
            return Err(format!("multiple NALs of type {} in sprop-parameter-sets", hdr & 0b1_1111));
        }
        *slot = Some(with_start_code(nal));
    }
    match (sps, pps) {
        (Some(sps), Some(pps)) => Ok((sps, pps)),
        (None, _) => Err("no SPS in sprop-parameter-sets".to_owned()),
        (_, None) => Err("no PPS in sprop-parameter-sets".to_owned()),
    }
}

/// The active SPS and PPS of an H.264 stream.
///
/// Only the most recent SPS and PPS are kept; cameras practically never use
/// more than one of each.
#[derive(Default)]
pub struct ParameterSets {
    sps_nal: Option<Bytes>,
    pps_nal: Option<Bytes>,
    sps: Option<SeqParameterSet>,
}

impl std::fmt::Debug for ParameterSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSets")
            .field("sps_nal", &self.sps_nal.as_deref().map(|n| crate::hex::LimitedHex::new(n, 64)))
            .field("pps_nal", &self.pps_nal.as_deref().map(|n| crate::hex::LimitedHex::new(n, 64)))
            .field("pixel_dimensions", &self.pixel_dimensions())
            .finish()
    }
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an SPS or PPS NAL unit (with start code).
    ///
    /// Returns true if it differs from the one already held. Other NAL types
    /// are ignored.
    pub fn update(&mut self, data: &Bytes) -> Result<bool, String> {
        let Some(&hdr) = data.get(super::START_CODE.len()) else {
            return Err(format!("NAL of {} bytes has no header", data.len()));
        };
        let nal = &data[super::START_CODE.len()..];
        match hdr & 0b1_1111 {
            UNIT_TYPE_SPS => {
                if self.sps_nal.as_ref() == Some(data) {
                    return Ok(false);
                }
                let sps = parse_sps(nal)?;
                debug!("new H.264 SPS: {sps:?}");
                self.sps = Some(sps);
                self.sps_nal = Some(data.clone());
                Ok(true)
            }
            UNIT_TYPE_PPS => {
                if self.pps_nal.as_ref() == Some(data) {
                    return Ok(false);
                }
                self.pps_nal = Some(data.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps_nal.is_some()
    }

    pub fn sps_nal(&self) -> Option<&Bytes> {
        self.sps_nal.as_ref()
    }

    pub fn pps_nal(&self) -> Option<&Bytes> {
        self.pps_nal.as_ref()
    }

    pub fn pixel_dimensions(&self) -> Option<(u32, u32)> {
        self.sps.as_ref().and_then(|s| s.pixel_dimensions().ok())
    }

    /// Computes the picture order count of the picture whose first slice is
    /// `slice` (a NAL unit without start code).
    ///
    /// With `pic_order_cnt_type` 0, the POC comes from the slice header's
    /// `pic_order_cnt_lsb`. Otherwise, and for field-coded streams, pictures
    /// are numbered in arrival order.
    pub fn picture_order_count(&self, slice: &[u8], ctx: &mut PocContext) -> Result<i64, String> {
        let sps = self.sps.as_ref().ok_or("no SPS")?;
        let is_idr = slice.first().map(|h| h & 0b1_1111) == Some(UNIT_TYPE_IDR);
        let log2_max_lsb = match (&sps.pic_order_cnt, &sps.frame_mbs_flags) {
            (
                PicOrderCntType::TypeZero {
                    log2_max_pic_order_cnt_lsb_minus4,
                },
                FrameMbsFlags::Frames,
            ) => u32::from(*log2_max_pic_order_cnt_lsb_minus4) + 4,
            _ => return Ok(ctx.next_in_arrival_order(is_idr)),
        };
        let lsb = read_pic_order_cnt_lsb(sps, slice, is_idr, log2_max_lsb)?;
        ctx.compute(lsb, log2_max_lsb, is_idr)
    }
}

fn parse_sps(nal: &[u8]) -> Result<SeqParameterSet, String> {
    let mut has_extra_trailing_data = false;
    let sps = SeqParameterSet::from_bits(TolerantBitReader {
        inner: BitReader::new(ByteReader::skipping_h264_header(nal)),
        has_extra_trailing_data: &mut has_extra_trailing_data,
    })
    .map_err(|e| format!("bad SPS: {e:?}"))?;
    if has_extra_trailing_data {
        debug!("SPS has extra trailing data");
    }
    Ok(sps)
}

/// Reads a slice header (7.3.3) through `pic_order_cnt_lsb`.
fn read_pic_order_cnt_lsb(
    sps: &SeqParameterSet,
    slice: &[u8],
    is_idr: bool,
    log2_max_lsb: u32,
) -> Result<u32, String> {
    let e = |e: h264_reader::rbsp::BitReaderError| format!("bad slice header: {e:?}");
    let mut r = BitReader::new(ByteReader::skipping_h264_header(slice));
    r.read_ue("first_mb_in_slice").map_err(e)?;
    r.read_ue("slice_type").map_err(e)?;
    r.read_ue("pic_parameter_set_id").map_err(e)?;
    if sps.chroma_info.separate_colour_plane_flag {
        r.skip(2, "colour_plane_id").map_err(e)?;
    }
    r.skip(u32::from(sps.log2_max_frame_num_minus4) + 4, "frame_num").map_err(e)?;
    if is_idr {
        r.read_ue("idr_pic_id").map_err(e)?;
    }
    r.read::<u32>(log2_max_lsb, "pic_order_cnt_lsb").map_err(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{H264_SPROP, h264_slice, packet, ts90k};

    fn depacketizer() -> Depacketizer {
        Depacketizer::new(crate::codec::DEFAULT_MAX_FRAGMENT_SLOTS)
    }

    #[test]
    fn depacketize() {
        let mut d = depacketizer();
        let ts = ts90k(0);
        d.push(packet(ts, 0, false, 0, b"\x06plain")).unwrap();
        let sei = d.pull().unwrap();
        assert_eq!(sei.unit_type, 6);
        assert!(!sei.mark);
        assert_eq!(&sei.data[..], b"\x00\x00\x00\x01\x06plain");
        assert!(d.pull().is_none());

        // STAP-A is dropped.
        d.push(packet(ts, 1, false, 0, b"\x18\x00\x09\x06stap-a 1\x00\x09\x06stap-a 2"))
            .unwrap();
        assert!(d.pull().is_none());

        d.push(packet(ts, 2, false, 0, b"\x7c\x86fu-a start, ")).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts, 3, false, 0, b"\x7c\x06fu-a middle, ")).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts, 4, true, 0, b"\x7c\x46fu-a end")).unwrap();
        let nal = d.pull().unwrap();
        assert_eq!(nal.unit_type, 6);
        assert!(nal.mark);
        assert_eq!(
            &nal.data[..],
            b"\x00\x00\x00\x01\x66fu-a start, fu-a middle, fu-a end"
        );
        assert!(d.pull().is_none());
    }

    #[test]
    fn fragments_match_single_nal() {
        let whole = b"\x65\x88\x84\x00\x33\xff\xfe\xf6\xf0\xfe\x05\x36\x56\x04";
        let mut d = depacketizer();
        d.push(packet(ts90k(0), 0, true, 0, whole)).unwrap();
        let single = d.pull().unwrap();

        let mut d = depacketizer();
        let body = &whole[1..];
        let mut seq = 0;
        for (i, chunk) in body.chunks(4).enumerate() {
            let last = (i + 1) * 4 >= body.len();
            let mut payload = vec![0x7c, 0x05];
            if i == 0 {
                payload[1] |= 0x80;
            }
            if last {
                payload[1] |= 0x40;
            }
            payload[0] = (whole[0] & 0xe0) | 28;
            payload.extend_from_slice(chunk);
            d.push(packet(ts90k(0), seq, last, 0, &payload)).unwrap();
            seq += 1;
        }
        let reassembled = d.pull().unwrap();
        assert_eq!(reassembled.data, single.data);
        assert_eq!(reassembled.unit_type, UNIT_TYPE_IDR);
    }

    #[test]
    fn loss_discards_fragment() {
        let mut d = depacketizer();
        d.push(packet(ts90k(0), 0, false, 0, b"\x7c\x85start")).unwrap();
        d.push(packet(ts90k(0), 2, false, 1, b"\x7c\x05middle")).unwrap_err();
        d.push(packet(ts90k(0), 3, true, 0, b"\x7c\x45end")).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts90k(3000), 4, true, 0, b"\x41next")).unwrap();
        let nal = d.pull().unwrap();
        assert_eq!(nal.loss, 1);
        assert_eq!(&nal.data[4..], b"\x41next");
    }

    #[test]
    fn fragment_overflow() {
        let slots = 4;
        let mut d = Depacketizer::new(slots);
        d.push(packet(ts90k(0), 0, false, 0, b"\x7c\x85s")).unwrap();
        let mut errors = 0;
        for i in 0..=slots {
            if d.push(packet(ts90k(0), 1 + i as u16, false, 0, b"\x7c\x05m")).is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert!(d.pull().is_none());
        d.push(packet(ts90k(3000), 10, false, 0, b"\x7c\x85new ")).unwrap();
        d.push(packet(ts90k(3000), 11, true, 0, b"\x7c\x45unit")).unwrap();
        assert_eq!(&d.pull().unwrap().data[..], b"\x00\x00\x00\x01\x65new unit");
    }

    #[test]
    fn rejects_bad_packets() {
        let mut d = depacketizer();
        d.push(packet(ts90k(0), 0, true, 0, b"")).unwrap_err();
        d.push(packet(ts90k(0), 1, true, 0, b"\x80")).unwrap_err();
        d.push(packet(ts90k(0), 2, true, 0, b"\x19\x00")).unwrap_err();
        d.push(packet(ts90k(0), 3, true, 0, b"\x1d\x85x")).unwrap_err();
        d.push(packet(ts90k(0), 4, true, 0, b"\x1c\xc5x")).unwrap_err();
        d.push(packet(ts90k(0), 5, true, 0, b"\x1c\x85")).unwrap_err();
        d.push(packet(ts90k(0), 6, true, 0, b"\x1e")).unwrap_err();
        assert!(d.pull().is_none());
    }

    #[test]
    fn gw_security() {
        let (sps, pps) = parse_sprop_parameter_sets("Z00AHpWoLQ9puAgICBAAAAAB,aO48gAAAAAE=").unwrap();
        assert_eq!(
            &sps[..],
            b"\x00\x00\x00\x01\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10"
        );
        assert_eq!(&pps[..], b"\x00\x00\x00\x01\x68\xee\x3c\x80");
    }

    #[test]
    fn sprop_errors() {
        assert!(parse_sprop_parameter_sets("Z00AHpWoLQ9puAgICBAAAAAB").is_err());
        assert!(parse_sprop_parameter_sets("!!!,aO48gA==").is_err());
        assert!(parse_sprop_parameter_sets("aO48gA==,aO48gA==").is_err());
    }

    #[test]
    fn parameter_change() {
        let (sps, pps) = parse_sprop_parameter_sets(H264_SPROP).unwrap();
        let mut p = ParameterSets::new();
        assert!(!p.is_complete());
        assert!(p.update(&sps).unwrap());
        assert!(p.update(&pps).unwrap());
        assert!(p.is_complete());
        assert_eq!(p.pixel_dimensions(), Some((704, 480)));
        assert!(!p.update(&sps).unwrap());

        let new_sps = with_start_code(
            b"\x67\x4d\x40\x1e\x9a\x64\x05\x01\xef\xf3\x50\x10\x10\x14\x00\x00\x0f\xa0\x00\x01\x38\x80\x10",
        );
        assert!(p.update(&new_sps).unwrap());
        assert_eq!(p.pixel_dimensions(), Some((640, 480)));
        assert!(!p.update(&pps).unwrap());
    }

    #[test]
    fn truncated_parameter_set() {
        let mut p = ParameterSets::new();
        let short: [&'static [u8]; 3] = [b"", b"\x00\x00\x01", b"\x00\x00\x00\x01"];
        for data in short {
            assert!(p.update(&Bytes::from_static(data)).is_err());
        }
        assert!(!p.is_complete());
    }

    #[test]
    fn poc_type_0() {
        let (sps, pps) = parse_sprop_parameter_sets(H264_SPROP).unwrap();
        let mut p = ParameterSets::new();
        p.update(&sps).unwrap();
        p.update(&pps).unwrap();
        let mut ctx = PocContext::new();
        let pocs: Vec<i64> = [
            h264_slice(0x65, 7, 0, 0),
            h264_slice(0x41, 5, 1, 8),
            h264_slice(0x01, 6, 2, 4),
            h264_slice(0x41, 5, 2, 200),
            h264_slice(0x41, 5, 3, 400),
            h264_slice(0x41, 5, 4, 2),
        ]
        .iter()
        .map(|s| p.picture_order_count(s, &mut ctx).unwrap())
        .collect();
        assert_eq!(pocs, [0, 8, 4, 200, 400, 514]);
    }

    #[test]
    fn poc_without_sps() {
        let p = ParameterSets::new();
        let mut ctx = PocContext::new();
        assert!(p.picture_order_count(&h264_slice(0x65, 7, 0, 0), &mut ctx).is_err());
    }
}
