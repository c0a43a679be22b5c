// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: RTP depacketization for H.264, H.265, and AAC, plus
//! the bitstream parsing needed to order H.264/H.265 pictures.

use bytes::Bytes;
use pretty_hex::PrettyHex;

use crate::Timestamp;
use crate::rtp::ReceivedPacket;

pub mod aac;
pub mod h264;
pub mod h265;
pub(crate) mod h26x;

pub use h26x::{DEFAULT_MAX_FRAGMENT_SLOTS, START_CODE};

/// A video encoding this crate can depacketize.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// Looks up an SDP `rtpmap` encoding name, case-insensitively.
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        match &name.to_ascii_lowercase()[..] {
            "h264" => Some(VideoCodec::H264),
            "h265" | "hevc" => Some(VideoCodec::H265),
            _ => None,
        }
    }
}

/// An audio encoding recognized in SDP.
///
/// Only [`AudioCodec::Aac`] is depacketized; the others are routed and
/// counted, then dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    /// `mpeg4-generic` per RFC 3640.
    Aac,

    /// `MP4A-LATM` per RFC 6416.
    Latm,

    /// G.711 mu-law, static payload type 0.
    Pcmu,

    /// G.711 A-law, static payload type 8.
    Pcma,
}

impl AudioCodec {
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        match &name.to_ascii_lowercase()[..] {
            "mpeg4-generic" => Some(AudioCodec::Aac),
            "mp4a-latm" => Some(AudioCodec::Latm),
            "pcmu" => Some(AudioCodec::Pcmu),
            "pcma" => Some(AudioCodec::Pcma),
            _ => None,
        }
    }
}

/// A complete NAL unit, as produced by the video depacketizers.
#[derive(Clone)]
pub struct NalUnit {
    pub codec: VideoCodec,

    /// `nal_unit_type` from the header.
    pub unit_type: u8,

    /// [`START_CODE`], then the NAL header, then the payload. Emulation
    /// prevention bytes are intact.
    pub data: Bytes,

    pub timestamp: Timestamp,

    /// True if the RTP packet completing this NAL unit had the marker bit
    /// set and this is the last NAL unit in it: the end of an access unit.
    pub mark: bool,

    /// RTP packets lost immediately before this NAL unit.
    pub loss: u16,
}

impl NalUnit {
    /// Returns the NAL unit without its start code.
    #[inline]
    pub fn nal(&self) -> &[u8] {
        &self.data[START_CODE.len()..]
    }

    /// True for VPS/SPS/PPS.
    pub fn is_parameter_set(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => matches!(self.unit_type, 7 | 8),
            VideoCodec::H265 => matches!(self.unit_type, 32..=34),
        }
    }
}

impl std::fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalUnit")
            .field("codec", &self.codec)
            .field("unit_type", &self.unit_type)
            .field("timestamp", &self.timestamp)
            .field("mark", &self.mark)
            .field("loss", &self.loss)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// One AAC access unit.
#[derive(Clone)]
pub struct AudioFrame {
    pub timestamp: Timestamp,

    /// Raw AAC frame, without ADTS header.
    pub data: Bytes,

    /// RTP packets lost immediately before this frame. If loss occurs during
    /// a fragmented frame, more than this many packets' data may be skipped.
    pub loss: u16,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

#[derive(Debug)]
pub enum CodecItem {
    Nal(NalUnit),
    AudioFrame(AudioFrame),
}

/// Turns RTP packets into [`CodecItem`]s.
///
/// Push a packet, then pull until `None`. Errors from `push` concern only
/// that packet (and any unit it was part of); the depacketizer remains usable.
#[derive(Debug)]
pub struct Depacketizer(DepacketizerInner);

#[derive(Debug)]
enum DepacketizerInner {
    H264(h264::Depacketizer),
    H265(h265::Depacketizer),
    Aac(aac::Depacketizer),
}

impl Depacketizer {
    pub fn new_video(codec: VideoCodec, max_fragment_slots: usize) -> Self {
        Depacketizer(match codec {
            VideoCodec::H264 => DepacketizerInner::H264(h264::Depacketizer::new(max_fragment_slots)),
            VideoCodec::H265 => DepacketizerInner::H265(h265::Depacketizer::new(max_fragment_slots)),
        })
    }

    pub fn new_aac(params: &aac::FormatParams) -> Self {
        Depacketizer(DepacketizerInner::Aac(aac::Depacketizer::new(params)))
    }

    pub fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.push(pkt),
            DepacketizerInner::H265(d) => d.push(pkt),
            DepacketizerInner::Aac(d) => d.push(pkt),
        }
    }

    pub fn pull(&mut self) -> Option<CodecItem> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.pull().map(CodecItem::Nal),
            DepacketizerInner::H265(d) => d.pull().map(CodecItem::Nal),
            DepacketizerInner::Aac(d) => d.pull().map(CodecItem::AudioFrame),
        }
    }

    /// Drops any partially reassembled unit and pending output.
    pub fn reset(&mut self) {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.reset(),
            DepacketizerInner::H265(d) => d.reset(),
            DepacketizerInner::Aac(d) => d.reset(),
        }
    }
}
