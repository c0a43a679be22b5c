// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common logic between H.264 and H.265.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Timestamp;

/// The Annex B start code prefixed to every NAL unit handed downstream.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Default bound on fragments per NAL unit; see [`FragmentationState`].
pub const DEFAULT_MAX_FRAGMENT_SLOTS: usize = 1024;

/// Returns `[START_CODE, nal]` as one buffer.
pub(crate) fn with_start_code(nal: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(START_CODE.len() + nal.len());
    b.put_slice(&START_CODE);
    b.put_slice(nal);
    b.freeze()
}

/// A NAL unit being reassembled from FU-A (H.264) or FU (H.265) packets.
///
/// Holds the reconstructed NAL header followed by each fragment's payload.
/// The number of fragments is bounded: a stream that never sends the end
/// fragment (lost packet, broken sender) is discarded at the bound rather than
/// growing forever.
#[derive(Debug)]
pub(crate) struct FragmentationState {
    /// Reconstructed NAL header (1 byte for H.264, 2 for H.265).
    hdr: [u8; 2],
    hdr_len: usize,

    /// Payload pieces after the header. Empty when idle; kept to reuse the
    /// allocation.
    pieces: Vec<Bytes>,

    /// Sum of `pieces` lengths.
    total_len: usize,

    timestamp: Option<Timestamp>,
    max_slots: usize,

    /// Set after a unit is discarded; continuation fragments are dropped
    /// quietly until the next start fragment.
    discarding: bool,
}

impl FragmentationState {
    pub(crate) fn new(max_slots: usize) -> Self {
        Self {
            hdr: [0; 2],
            hdr_len: 0,
            pieces: Vec::new(),
            total_len: 0,
            timestamp: None,
            max_slots: max_slots.max(1),
            discarding: false,
        }
    }

    #[inline]
    #[cfg(test)]
    pub(crate) fn in_progress(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Starts a new unit. Returns true if an unfinished unit was discarded.
    pub(crate) fn start(&mut self, hdr: &[u8], first: Bytes, timestamp: Timestamp) -> bool {
        let discarded = self.discard();
        self.hdr_len = hdr.len().min(2);
        self.hdr[..self.hdr_len].copy_from_slice(&hdr[..self.hdr_len]);
        self.total_len = first.len();
        self.pieces.push(first);
        self.timestamp = Some(timestamp);
        self.discarding = false;
        discarded
    }

    /// Appends a middle or end fragment.
    ///
    /// `hdr` is the header reconstructed from this fragment; it must match the
    /// start fragment's. Returns `Ok(false)` if the fragment was dropped
    /// quietly because the unit it belongs to was already discarded.
    pub(crate) fn append(
        &mut self,
        hdr: &[u8],
        piece: Bytes,
        timestamp: Timestamp,
    ) -> Result<bool, String> {
        let Some(start_ts) = self.timestamp else {
            if self.discarding {
                return Ok(false);
            }
            self.discarding = true;
            return Err("continuation fragment without start fragment".to_owned());
        };
        if start_ts.timestamp() != timestamp.timestamp() {
            self.discard();
            self.discarding = true;
            return Err(format!(
                "fragment timestamp changed from {start_ts} to {timestamp} mid-unit"
            ));
        }
        if hdr != &self.hdr[..self.hdr_len] {
            let started = self.hdr;
            self.discard();
            self.discarding = true;
            return Err(format!(
                "inconsistent fragment NAL header {hdr:02x?}, started as {:02x?}",
                &started[..hdr.len().min(2)]
            ));
        }
        if self.pieces.len() >= self.max_slots {
            let (n, len) = (self.pieces.len(), self.total_len);
            self.discard();
            self.discarding = true;
            return Err(format!(
                "discarding {len}-byte unit after {n} fragments without an end fragment"
            ));
        }
        self.total_len += piece.len();
        self.pieces.push(piece);
        Ok(true)
    }

    /// Completes the unit, returning it with a start code and resetting state.
    pub(crate) fn finish(&mut self) -> Option<(Bytes, Timestamp)> {
        let timestamp = self.timestamp.take()?;
        let mut out = BytesMut::with_capacity(START_CODE.len() + self.hdr_len + self.total_len);
        out.put_slice(&START_CODE);
        out.put_slice(&self.hdr[..self.hdr_len]);
        for piece in self.pieces.drain(..) {
            out.put_slice(&piece);
        }
        self.total_len = 0;
        Some((out.freeze(), timestamp))
    }

    /// Drops any in-progress unit. Returns true if there was one.
    pub(crate) fn discard(&mut self) -> bool {
        self.pieces.clear();
        self.total_len = 0;
        self.timestamp.take().is_some()
    }

    /// Returns to the initial state.
    pub(crate) fn reset(&mut self) {
        self.discard();
        self.discarding = false;
    }

    #[cfg(test)]
    pub(crate) fn fragments(&self) -> usize {
        self.pieces.len()
    }
}

/// `h264_reader::rbsp::BitRead` impl that *notes* extra trailing data rather than failing on it.
///
/// Some (Reolink) cameras appear to have a stray extra byte at the end. Follow the lead of most
/// other RTSP implementations in tolerating this.
#[derive(Debug)]
pub(super) struct TolerantBitReader<'a, R> {
    pub(super) inner: R,
    pub(super) has_extra_trailing_data: &'a mut bool,
}

impl<R: h264_reader::rbsp::BitRead> h264_reader::rbsp::BitRead for TolerantBitReader<'_, R> {
    fn read_ue(&mut self, name: &'static str) -> Result<u32, h264_reader::rbsp::BitReaderError> {
        self.inner.read_ue(name)
    }

    fn read_se(&mut self, name: &'static str) -> Result<i32, h264_reader::rbsp::BitReaderError> {
        self.inner.read_se(name)
    }

    fn read_bool(&mut self, name: &'static str) -> Result<bool, h264_reader::rbsp::BitReaderError> {
        self.inner.read_bool(name)
    }

    fn skip(
        &mut self,
        bit_count: u32,
        name: &'static str,
    ) -> Result<(), h264_reader::rbsp::BitReaderError> {
        self.inner.skip(bit_count, name)
    }

    fn read<U: h264_reader::rbsp::Numeric>(
        &mut self,
        bit_count: u32,
        name: &'static str,
    ) -> Result<U, h264_reader::rbsp::BitReaderError> {
        self.inner.read(bit_count, name)
    }

    fn read_to<V: h264_reader::rbsp::Primitive>(
        &mut self,
        name: &'static str,
    ) -> Result<V, h264_reader::rbsp::BitReaderError> {
        self.inner.read_to(name)
    }

    fn has_more_rbsp_data(
        &mut self,
        name: &'static str,
    ) -> Result<bool, h264_reader::rbsp::BitReaderError> {
        self.inner.has_more_rbsp_data(name)
    }

    fn finish_rbsp(self) -> Result<(), h264_reader::rbsp::BitReaderError> {
        match self.inner.finish_rbsp() {
            Ok(()) => Ok(()),
            Err(h264_reader::rbsp::BitReaderError::RemainingData) => {
                *self.has_extra_trailing_data = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn finish_sei_payload(self) -> Result<(), h264_reader::rbsp::BitReaderError> {
        self.inner.finish_sei_payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn ts(t: i64) -> Timestamp {
        Timestamp::new(t, NonZeroU32::new(90_000).unwrap(), 0).unwrap()
    }

    #[test]
    fn reassembles() {
        let mut s = FragmentationState::new(4);
        assert!(!s.start(&[0x65], Bytes::from_static(b"ab"), ts(0)));
        assert!(s.append(&[0x65], Bytes::from_static(b"cd"), ts(0)).unwrap());
        let (nal, t) = s.finish().unwrap();
        assert_eq!(&nal[..], b"\x00\x00\x00\x01\x65abcd");
        assert_eq!(t, ts(0));
        assert!(!s.in_progress());
        assert!(s.finish().is_none());
    }

    #[test]
    fn overflow_discards_and_recovers() {
        let mut s = FragmentationState::new(3);
        s.start(&[0x40, 0x01], Bytes::from_static(b"x"), ts(0));
        s.append(&[0x40, 0x01], Bytes::from_static(b"y"), ts(0)).unwrap();
        s.append(&[0x40, 0x01], Bytes::from_static(b"z"), ts(0)).unwrap();
        assert_eq!(s.fragments(), 3);
        let e = s.append(&[0x40, 0x01], Bytes::from_static(b"!"), ts(0)).unwrap_err();
        assert!(e.contains("3 fragments"), "{e}");
        assert!(!s.in_progress());

        // Remaining fragments of the discarded unit are dropped quietly.
        assert!(!s.append(&[0x40, 0x01], Bytes::from_static(b"."), ts(0)).unwrap());

        s.start(&[0x40, 0x01], Bytes::from_static(b"new"), ts(3000));
        assert_eq!(&s.finish().unwrap().0[..], b"\x00\x00\x00\x01\x40\x01new");
    }

    #[test]
    fn orphan_and_mismatch() {
        let mut s = FragmentationState::new(8);
        assert!(s.append(&[0x65], Bytes::from_static(b"a"), ts(0)).is_err());
        s.start(&[0x65], Bytes::from_static(b"a"), ts(0));
        assert!(s.append(&[0x61], Bytes::from_static(b"b"), ts(0)).is_err());
        assert!(!s.in_progress());
        s.start(&[0x65], Bytes::from_static(b"a"), ts(0));
        assert!(s.append(&[0x65], Bytes::from_static(b"b"), ts(1)).is_err());
        s.start(&[0x65], Bytes::from_static(b"a"), ts(0));
        assert!(s.start(&[0x65], Bytes::from_static(b"a"), ts(0)));
    }
}
