// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use log::debug;

use crate::Timestamp;
use crate::poc::PocContext;
use crate::rtp::ReceivedPacket;

use super::h26x::{FragmentationState, with_start_code};
use super::{NalUnit, START_CODE, VideoCodec};

pub mod nal;
pub mod slice;

use nal::{Header, Pps, Sps, UnitType, Vps};
use slice::SliceHeader;

/// Reassembles H.265 NAL units from RTP packets per
/// [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).
///
/// Handles single NAL unit packets, aggregation packets, and fragmentation
/// units. PACI packets and DONL fields (`sprop-max-don-diff` > 0) are not
/// supported.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    frag: FragmentationState,
    pending: VecDeque<NalUnit>,

    /// Loss not yet attributed to an emitted NAL unit.
    loss: u16,
}

impl Depacketizer {
    pub(crate) fn new(max_fragment_slots: usize) -> Self {
        Depacketizer {
            frag: FragmentationState::new(max_fragment_slots),
            pending: VecDeque::new(),
            loss: 0,
        }
    }

    pub(crate) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        if pkt.loss() > 0 {
            self.loss = self.loss.saturating_add(pkt.loss());
            if self.frag.discard() {
                debug!(
                    "discarding in-progress FU after loss of {} packet(s) before seq {:04x}",
                    pkt.loss(),
                    pkt.sequence_number()
                );
            }
        }
        let timestamp = pkt.timestamp();
        let mark = pkt.mark();
        let seq = pkt.sequence_number();
        let data = pkt.into_payload_bytes();
        let Some(&hdr_bytes) = data.first_chunk::<2>() else {
            return Err(format!("packet seq {seq:04x} too short for NAL header"));
        };
        let hdr = Header::try_from(hdr_bytes).map_err(|e| format!("{e} in seq {seq:04x}"))?;
        match hdr.unit_type() {
            UnitType::Ap => {
                // RFC 7798 section 4.4.2: a sequence of 16-bit sizes, each
                // followed by that many bytes of NAL unit.
                let mut nals = Vec::new();
                let mut rest = data.slice(2..);
                while !rest.is_empty() {
                    let Some(&len) = rest.first_chunk::<2>() else {
                        return Err(format!("AP has trailing byte in seq {seq:04x}"));
                    };
                    let len = usize::from(u16::from_be_bytes(len));
                    if len < 2 || rest.len() < 2 + len {
                        return Err(format!(
                            "AP has bad {len}-byte NAL with {} bytes remaining in seq {seq:04x}",
                            rest.len() - 2
                        ));
                    }
                    let nal = rest.slice(2..2 + len);
                    Header::try_from([nal[0], nal[1]])
                        .map_err(|e| format!("{e} in AP in seq {seq:04x}"))?;
                    nals.push(nal);
                    rest = rest.slice(2 + len..);
                }
                if nals.is_empty() {
                    return Err(format!("empty AP in seq {seq:04x}"));
                }
                if self.frag.discard() {
                    debug!("AP in seq {seq:04x} interrupted an in-progress FU");
                }
                let last = nals.len() - 1;
                for (i, nal) in nals.into_iter().enumerate() {
                    self.emit(with_start_code(&nal), timestamp, mark && i == last);
                }
                Ok(())
            }
            UnitType::Fu => {
                // RFC 7798 section 4.4.3.
                if data.len() < 3 {
                    return Err(format!("FU is too short in seq {seq:04x}"));
                }
                let fu_header = data[2];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let fu_type = fu_header & 0b0011_1111;
                if start && end {
                    return Err(format!("FU with start and end bits set in seq {seq:04x}"));
                }
                let unit_type = UnitType::try_from(fu_type)?;
                if unit_type >= UnitType::Ap {
                    return Err(format!("FU carrying {unit_type:?} in seq {seq:04x}"));
                }
                let reconstructed = hdr.with_unit_type(unit_type);
                let piece = data.slice(3..);
                if start {
                    if self.frag.start(&reconstructed[..], piece, timestamp) {
                        debug!("FU start in seq {seq:04x} interrupted an unfinished FU");
                    }
                    if mark {
                        self.finish(mark);
                    }
                    return Ok(());
                }
                if self.frag.append(&reconstructed[..], piece, timestamp)? && (end || mark) {
                    self.finish(mark);
                }
                Ok(())
            }
            UnitType::Paci => Err(format!("PACI packets are unsupported (seq {seq:04x})")),
            t if t > UnitType::Paci => Err(format!("reserved NAL type {t:?} in seq {seq:04x}")),
            _ => {
                if self.frag.discard() {
                    debug!("single NAL unit in seq {seq:04x} interrupted an in-progress FU");
                }
                self.emit(with_start_code(&data), timestamp, mark);
                Ok(())
            }
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
        let unit_type = (data[START_CODE.len()] >> 1) & 0b11_1111;
        self.pending.push_back(NalUnit {
            codec: VideoCodec::H265,
            unit_type,
            data,
            timestamp,
            mark,
            loss: std::mem::take(&mut self.loss),
        });
    }
}

/// Decodes one SDP `sprop-vps`/`sprop-sps`/`sprop-pps` value into NAL units
/// prefixed with the Annex B start code.
///
/// RFC 7798 allows a comma-separated list; each set is checked to be of the
/// expected type.
pub fn parse_sprop(value: &str, expected: UnitType) -> Result<Vec<Bytes>, String> {
    use base64::Engine as _;
    let mut out = Vec::new();
    for encoded in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let nal = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| format!("bad parameter set {encoded:?}: invalid base64 encoding"))?;
        let Some(&hdr) = nal.first_chunk::<2>() else {
            return Err(format!("parameter set {encoded:?} too short"));
        };
        let hdr = Header::try_from(hdr)?;
        if hdr.unit_type() != expected {
            return Err(format!(
                "expected {expected:?} in sprop, got {:?}",
                hdr.unit_type()
            ));
        }
        out.push(with_start_code(&nal));
    }
    if out.is_empty() {
        return Err(format!("empty sprop for {expected:?}"));
    }
    Ok(out)
}

/// A parameter set as received (with start code) and as parsed.
#[derive(Debug)]
struct Stored<T> {
    nal: Bytes,
    parsed: T,
}

/// The VPS, SPS, and PPS sets of an H.265 stream, by id.
///
/// The most recently received set for each id is authoritative. A slice
/// referencing a PPS (directly, or an SPS/VPS through it) that was never
/// received can't be parsed.
#[derive(Debug, Default)]
pub struct ParameterSets {
    vps: BTreeMap<u8, Stored<Vps>>,
    sps: BTreeMap<u8, Stored<Sps>>,
    pps: BTreeMap<u8, Stored<Pps>>,
}

/// The parameter sets a particular slice uses.
#[derive(Debug)]
pub struct ActiveSets<'a> {
    /// `None` if the stream never sent the VPS the SPS names.
    pub vps_nal: Option<&'a Bytes>,
    pub sps_nal: &'a Bytes,
    pub pps_nal: &'a Bytes,
    pub sps: &'a Sps,
    pub pps: &'a Pps,
}

/// A parsed slice segment and what it takes to order it.
#[derive(Debug)]
pub struct SliceInfo {
    pub unit_type: UnitType,
    pub header: SliceHeader,

    /// `TemporalId`.
    pub temporal_id: u8,
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a VPS, SPS, or PPS NAL unit (with start code).
    ///
    /// Returns true if it differs from the set already held under its id.
    /// Other NAL types are ignored.
    pub fn update(&mut self, data: &Bytes) -> Result<bool, String> {
        let nal = data
            .get(START_CODE.len()..)
            .ok_or("NAL shorter than start code")?;
        let (hdr, rbsp) = nal::split(nal)?;
        match hdr.unit_type() {
            UnitType::VpsNut => {
                let vps = Vps::from_rbsp(&rbsp).map_err(|e| format!("bad VPS: {e}"))?;
                Ok(insert(&mut self.vps, vps.vps_video_parameter_set_id, data, vps))
            }
            UnitType::SpsNut => {
                let sps = Sps::from_rbsp(&rbsp).map_err(|e| format!("bad SPS: {e}"))?;
                sps.pixel_dimensions()?;
                Ok(insert(&mut self.sps, sps.sps_seq_parameter_set_id, data, sps))
            }
            UnitType::PpsNut => {
                let pps = Pps::from_rbsp(&rbsp).map_err(|e| format!("bad PPS: {e}"))?;
                Ok(insert(&mut self.pps, pps.pps_pic_parameter_set_id, data, pps))
            }
            _ => Ok(false),
        }
    }

    /// Looks up the PPS with the given id and the SPS and VPS it references.
    pub fn active(&self, pps_id: u8) -> Result<ActiveSets<'_>, String> {
        let pps = self
            .pps
            .get(&pps_id)
            .ok_or_else(|| format!("slice references missing PPS {pps_id}"))?;
        let sps_id = pps.parsed.pps_seq_parameter_set_id;
        let sps = self
            .sps
            .get(&sps_id)
            .ok_or_else(|| format!("PPS {pps_id} references missing SPS {sps_id}"))?;
        let vps = self.vps.get(&sps.parsed.sps_video_parameter_set_id);
        Ok(ActiveSets {
            vps_nal: vps.map(|v| &v.nal),
            sps_nal: &sps.nal,
            pps_nal: &pps.nal,
            sps: &sps.parsed,
            pps: &pps.parsed,
        })
    }

    /// Parses the header of a slice segment NAL unit (without start code).
    pub fn slice(&self, nal: &[u8]) -> Result<(SliceInfo, ActiveSets<'_>), String> {
        let (hdr, rbsp) = nal::split(nal)?;
        let pps_id = slice::pic_parameter_set_id(hdr, &rbsp)?;
        let active = self.active(pps_id)?;
        let header = SliceHeader::parse(hdr, &rbsp, active.sps, active.pps)?;
        Ok((
            SliceInfo {
                unit_type: hdr.unit_type(),
                header,
                temporal_id: hdr.temporal_id(),
            },
            active,
        ))
    }

    /// Computes the picture order count of the picture a slice belongs to.
    ///
    /// `decoding_start` is true for the first picture decoded, or the first
    /// after a discontinuity; a CRA picture there starts a new coded video
    /// sequence just as an IDR or BLA picture does.
    pub fn picture_order_count(
        &self,
        info: &SliceInfo,
        sps: &Sps,
        ctx: &mut PocContext,
        decoding_start: bool,
    ) -> Result<i64, String> {
        let t = info.unit_type;
        let reset = t.is_idr() || t.is_bla() || (t.is_irap() && decoding_start);
        let candidate =
            info.temporal_id == 0 && !t.is_leading() && !t.is_sub_layer_non_reference();
        ctx.compute_h265(
            info.header.slice_pic_order_cnt_lsb,
            sps.log2_max_pic_order_cnt_lsb(),
            reset,
            candidate,
        )
    }

    /// The highest `sps_max_num_reorder_pics` among the known SPSs.
    pub fn max_num_reorder_pics(&self) -> Option<usize> {
        self.sps
            .values()
            .map(|s| s.parsed.ordering_info.max_num_reorder_pics as usize)
            .max()
    }
}

fn insert<T>(map: &mut BTreeMap<u8, Stored<T>>, id: u8, data: &Bytes, parsed: T) -> bool {
    if map.get(&id).is_some_and(|s| s.nal == *data) {
        return false;
    }
    map.insert(
        id,
        Stored {
            nal: data.clone(),
            parsed,
        },
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{H265_PPS, H265_SPS, H265_VPS, h265_slice, init_logging, packet, ts90k};

    fn depacketizer() -> Depacketizer {
        Depacketizer::new(crate::codec::DEFAULT_MAX_FRAGMENT_SLOTS)
    }

    fn drain(d: &mut Depacketizer) -> Vec<NalUnit> {
        std::iter::from_fn(|| d.pull()).collect()
    }

    #[test]
    fn depacketize() {
        init_logging();
        let mut d = depacketizer();

        // Aggregation packet holding a VPS-like and SPS-like NAL.
        d.push(packet(ts90k(0), 0, false, 0, b"\x60\x01\x00\x03\x40\x01\xaa\x00\x04\x42\x01\xbb\xcc"))
            .unwrap();
        let nals = drain(&mut d);
        assert_eq!(nals.len(), 2);
        assert_eq!(&nals[0].data[..], b"\x00\x00\x00\x01\x40\x01\xaa");
        assert_eq!(nals[0].unit_type, 32);
        assert_eq!(&nals[1].data[..], b"\x00\x00\x00\x01\x42\x01\xbb\xcc");
        assert!(!nals[1].mark);

        // IDR_W_RADL split into three FUs.
        d.push(packet(ts90k(0), 1, false, 0, b"\x62\x01\x93abc")).unwrap();
        d.push(packet(ts90k(0), 2, false, 0, b"\x62\x01\x13def")).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts90k(0), 3, true, 0, b"\x62\x01\x53g")).unwrap();
        let nals = drain(&mut d);
        assert_eq!(nals.len(), 1);
        assert_eq!(&nals[0].data[..], b"\x00\x00\x00\x01\x26\x01abcdefg");
        assert_eq!(nals[0].unit_type, 19);
        assert!(nals[0].mark);

        // Single NAL unit.
        d.push(packet(ts90k(3000), 4, true, 0, b"\x02\x01xyz")).unwrap();
        let nals = drain(&mut d);
        assert_eq!(&nals[0].data[..], b"\x00\x00\x00\x01\x02\x01xyz");
        assert_eq!(nals[0].timestamp, ts90k(3000));
    }

    #[test]
    fn ap_mark_on_last_only() {
        let mut d = depacketizer();
        d.push(packet(ts90k(0), 0, true, 0, b"\x60\x01\x00\x02\x02\x01\x00\x03\x02\x01\xff"))
            .unwrap();
        let marks: Vec<bool> = drain(&mut d).iter().map(|n| n.mark).collect();
        assert_eq!(marks, [false, true]);
    }

    #[test]
    fn fragments_match_single_nal() {
        let whole = b"\x02\x01the quick brown fox";
        let mut single = depacketizer();
        single.push(packet(ts90k(0), 0, true, 0, whole)).unwrap();
        let expected = single.pull().unwrap();

        let mut d = depacketizer();
        let body = &whole[2..];
        let pieces: Vec<&[u8]> = body.chunks(5).collect();
        let last = pieces.len() - 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            let fu_header = match i {
                0 => 0x80 | 1,
                i if i == last => 0x40 | 1,
                _ => 1,
            };
            let mut p = vec![49 << 1, 0x01, fu_header];
            p.extend_from_slice(piece);
            d.push(packet(ts90k(0), i as u16, i == last, 0, &p)).unwrap();
        }
        let got = d.pull().unwrap();
        assert_eq!(got.data, expected.data);
        assert_eq!(got.mark, expected.mark);
        assert!(d.pull().is_none());
    }

    #[test]
    fn loss_discards_fragment() {
        let mut d = depacketizer();
        d.push(packet(ts90k(0), 0, false, 0, b"\x62\x01\x81abc")).unwrap();
        d.push(packet(ts90k(0), 2, true, 1, b"\x62\x01\x41def")).unwrap_err();
        assert!(d.pull().is_none());
        d.push(packet(ts90k(3000), 3, true, 0, b"\x02\x01xyz")).unwrap();
        let nal = d.pull().unwrap();
        assert_eq!(nal.loss, 1);
    }

    #[test]
    fn rejects_bad_packets() {
        let mut d = depacketizer();
        d.push(packet(ts90k(0), 0, true, 0, b"\x02")).unwrap_err();
        d.push(packet(ts90k(0), 1, true, 0, b"\x82\x01xx")).unwrap_err(); // forbidden bit
        d.push(packet(ts90k(0), 2, true, 0, b"\x02\x00xx")).unwrap_err(); // tid 0
        d.push(packet(ts90k(0), 3, true, 0, b"\x64\x01xx")).unwrap_err(); // PACI
        d.push(packet(ts90k(0), 4, true, 0, b"\x66\x01xx")).unwrap_err(); // 51
        d.push(packet(ts90k(0), 5, true, 0, b"\x62\x01\xc1x")).unwrap_err(); // start + end
        d.push(packet(ts90k(0), 6, true, 0, b"\x62\x01\xb0x")).unwrap_err(); // FU of FU
        d.push(packet(ts90k(0), 7, true, 0, b"\x60\x01\x00\x05\x02\x01")).unwrap_err(); // short AP
        assert!(d.pull().is_none());
        d.push(packet(ts90k(0), 8, true, 0, b"\x02\x01ok")).unwrap();
        assert!(d.pull().is_some());
    }

    fn sets() -> ParameterSets {
        let mut p = ParameterSets::new();
        for (value, t) in [
            (H265_VPS, UnitType::VpsNut),
            (H265_SPS, UnitType::SpsNut),
            (H265_PPS, UnitType::PpsNut),
        ] {
            for nal in parse_sprop(value, t).unwrap() {
                assert!(p.update(&nal).unwrap());
                assert!(!p.update(&nal).unwrap());
            }
        }
        p
    }

    #[test]
    fn sprop() {
        let vps = parse_sprop(H265_VPS, UnitType::VpsNut).unwrap();
        assert_eq!(vps.len(), 1);
        assert_eq!(&vps[0][..6], b"\x00\x00\x00\x01\x40\x01");
        parse_sprop(H265_SPS, UnitType::PpsNut).unwrap_err();
        parse_sprop("", UnitType::PpsNut).unwrap_err();
        parse_sprop("!!", UnitType::PpsNut).unwrap_err();
    }

    #[test]
    fn active_sets() {
        let p = sets();
        let a = p.active(0).unwrap();
        assert!(a.vps_nal.is_some());
        assert_eq!(a.sps.pixel_dimensions().unwrap(), (704, 480));
        assert_eq!(p.max_num_reorder_pics(), Some(0));
        let e = p.active(1).unwrap_err();
        assert!(e.contains("missing PPS 1"), "{e}");
        let empty = ParameterSets::new();
        assert!(empty.active(0).is_err());
    }

    #[test]
    fn picture_order_count() {
        let p = sets();
        let mut ctx = PocContext::new();
        let mut pocs = Vec::new();
        for (i, (idr, lsb)) in [(true, 0), (false, 4), (false, 2), (false, 65534), (true, 0)]
            .into_iter()
            .enumerate()
        {
            let nal = h265_slice(idr, lsb);
            let (info, active) = p.slice(&nal).unwrap();
            pocs.push(p.picture_order_count(&info, active.sps, &mut ctx, i == 0).unwrap());
        }
        assert_eq!(pocs, [0, 4, 2, -2, 0]);
    }

    #[test]
    fn slice_without_parameter_sets() {
        let p = ParameterSets::new();
        let e = p.slice(&h265_slice(false, 1)).unwrap_err();
        assert!(e.contains("missing PPS 0"), "{e}");
    }

    #[test]
    fn replaced_sps_wins() {
        let mut p = sets();
        let old = p.active(0).unwrap().sps_nal.clone();

        // Same id, different bytes: trailing data after the RBSP.
        let mut changed = old.to_vec();
        changed.push(0x80);
        let changed = Bytes::from(changed);
        assert!(p.update(&changed).unwrap());
        assert_eq!(p.active(0).unwrap().sps_nal, &changed);
        assert!(!p.update(&changed).unwrap());
    }
}
