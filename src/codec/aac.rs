// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC (Advanced Audio Codec) depacketization.
//! There are many intertwined standards; see the following references:
//! *   [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640): RTP Payload
//!     for Transport of MPEG-4 Elementary Streams.
//! *   ISO/IEC 13818-7: Advanced Audio Coding (including ADTS).
//! *   ISO/IEC 14496-3: Audio, subpart 1: Main.

use bitstream_io::{BitRead, BitWrite};
use bytes::{Bytes, BytesMut};
use log::debug;

use crate::Timestamp;
use crate::rtp::ReceivedPacket;

use super::AudioFrame;

/// An AudioSpecificConfig as in ISO/IEC 14496-3 section 1.6.2.1.
///
/// Stores the raw form and the fields needed to describe and frame the
/// stream.
#[derive(Clone, Debug)]
pub struct AudioSpecificConfig {
    pub raw: Bytes,
    pub audio_object_type: u8,

    /// `samplingFrequencyIndex`, or `0xf` if the frequency was explicit.
    pub sampling_frequency_index: u8,
    pub sampling_frequency: u32,
    pub channel_config_id: u8,
    pub channels: u16,

    /// Samples per channel per access unit.
    pub frame_length: u16,
}

/// A channel configuration as in ISO/IEC 14496-3 Table 1.19.
#[derive(Debug)]
struct ChannelConfig {
    channels: u16,

    /// A human-friendly name for the channel configuration.
    #[cfg_attr(not(test), allow(dead_code))]
    name: &'static str,
}

#[rustfmt::skip]
const CHANNEL_CONFIGS: [Option<ChannelConfig>; 8] = [
    /* 0 */ None, // "defined in AOT related SpecificConfig"
    /* 1 */ Some(ChannelConfig { channels: 1, name: "mono" }),
    /* 2 */ Some(ChannelConfig { channels: 2, name: "stereo" }),
    /* 3 */ Some(ChannelConfig { channels: 3, name: "3.0" }),
    /* 4 */ Some(ChannelConfig { channels: 4, name: "4.0" }),
    /* 5 */ Some(ChannelConfig { channels: 5, name: "5.0" }),
    /* 6 */ Some(ChannelConfig { channels: 6, name: "5.1" }),
    /* 7 */ Some(ChannelConfig { channels: 8, name: "7.1" }),
];

/// ISO/IEC 14496-3 section 1.6.3.3.
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

impl AudioSpecificConfig {
    /// Parses from raw bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };
        let sampling_frequency_index = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read sampling_frequency: {e}"))?;
        let sampling_frequency = match sampling_frequency_index {
            0xf => r
                .read::<u32>(24)
                .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
            i => *SAMPLING_FREQUENCIES.get(usize::from(i)).ok_or_else(|| {
                format!("reserved sampling_frequency_index value 0x{i:x}")
            })?,
        };
        if sampling_frequency == 0 {
            return Err("zero sampling_frequency".to_owned());
        }
        let channel_config_id = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channels: {e}"))?;
        let channels = CHANNEL_CONFIGS
            .get(usize::from(channel_config_id))
            .ok_or_else(|| format!("reserved channelConfiguration 0x{channel_config_id:x}"))?
            .as_ref()
            .ok_or_else(|| "program_config_element parsing unimplemented".to_string())?;
        if audio_object_type == 5 || audio_object_type == 29 {
            // extensionSamplingFrequencyIndex + extensionSamplingFrequency.
            if r.read::<u8>(4)
                .map_err(|e| format!("unable to read extensionSamplingFrequencyIndex: {e}"))?
                == 0xf
            {
                r.skip(24)
                    .map_err(|e| format!("unable to read extensionSamplingFrequency: {e}"))?;
            }
            // audioObjectType (a different one) + extensionChannelConfiguration.
            if r.read::<u8>(5)
                .map_err(|e| format!("unable to read second audioObjectType: {e}"))?
                == 22
            {
                r.skip(4)
                    .map_err(|e| format!("unable to read extensionChannelConfiguration: {e}"))?;
            }
        }

        // The supported types here are the ones that use GASpecificConfig.
        match audio_object_type {
            1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => {}
            o => return Err(format!("unsupported audio_object_type {o}")),
        }

        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read frame_length_flag: {e}"))?;
        let frame_length = match (audio_object_type, frame_length_flag) {
            (3 /* AAC SR */, false) => 256,
            (3 /* AAC SR */, true) => {
                return Err("frame_length_flag must be false for AAC SSR".into());
            }
            (23 /* ER AAC LD */, false) => 512,
            (23 /* ER AAC LD */, true) => 480,
            (_, false) => 1024,
            (_, true) => 960,
        };

        Ok(AudioSpecificConfig {
            raw: Bytes::copy_from_slice(raw),
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_config_id,
            channels: channels.channels,
            frame_length,
        })
    }

    /// Returns a 7-byte ADTS header (ISO/IEC 13818-7 section 6.2) for an
    /// access unit of `au_len` bytes, without CRC.
    ///
    /// ADTS can only express AAC Main/LC/SSR/LTP with an indexed sampling
    /// frequency and a channel configuration in the AudioSpecificConfig.
    pub fn adts_header(&self, au_len: usize) -> Result<[u8; 7], String> {
        if !(1..=4).contains(&self.audio_object_type) {
            return Err(format!(
                "audio_object_type {} can't be expressed in ADTS",
                self.audio_object_type
            ));
        }
        if self.sampling_frequency_index == 0xf {
            return Err(format!(
                "explicit sampling_frequency {} can't be expressed in ADTS",
                self.sampling_frequency
            ));
        }
        let frame_length = au_len + 7;
        if frame_length > 0x1fff {
            return Err(format!("{au_len}-byte access unit too long for ADTS"));
        }
        let mut out = [0u8; 7];
        let mut w = bitstream_io::BitWriter::endian(&mut out[..], bitstream_io::BigEndian);
        let write = |w: &mut bitstream_io::BitWriter<&mut [u8], bitstream_io::BigEndian>| {
            w.write::<u16>(12, 0xfff)?; // syncword
            w.write_bit(false)?; // ID: MPEG-4
            w.write::<u8>(2, 0)?; // layer
            w.write_bit(true)?; // protection_absent
            w.write::<u8>(2, self.audio_object_type - 1)?; // profile
            w.write::<u8>(4, self.sampling_frequency_index)?;
            w.write_bit(false)?; // private_bit
            w.write::<u8>(3, self.channel_config_id)?;
            w.write_bit(false)?; // original_copy
            w.write_bit(false)?; // home
            w.write_bit(false)?; // copyright_identification_bit
            w.write_bit(false)?; // copyright_identification_start
            w.write::<u16>(13, frame_length as u16)?;
            w.write::<u16>(11, 0x7ff)?; // adts_buffer_fullness: VBR
            w.write::<u8>(2, 0)?; // number_of_raw_data_blocks_in_frame
            Ok::<_, std::io::Error>(())
        };
        write(&mut w).map_err(|e| format!("unable to write ADTS header: {e}"))?;
        Ok(out)
    }
}

/// RFC 3640 section 3.3.6 (`AAC-lbr`) and 3.3.7 (`AAC-hbr`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Lbr,
    Hbr,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Lbr => "AAC-lbr",
            Mode::Hbr => "AAC-hbr",
        }
    }
}

/// Metadata from the `format-specific-params` of an SDP `fmtp` media
/// attribute, as in [RFC 3640 section
/// 4.1](https://datatracker.ietf.org/doc/html/rfc3640#section-4.1).
#[derive(Clone, Debug)]
pub struct FormatParams {
    pub mode: Mode,
    pub config: AudioSpecificConfig,

    /// Bits of AU-size in each AU-header.
    pub size_length: u8,

    /// Bits of AU-Index in the first AU-header.
    pub index_length: u8,
    pub index_delta_length: u8,
}

impl FormatParams {
    pub fn parse(clock_rate: u32, format_specific_params: &str) -> Result<Self, String> {
        let mut mode = None;
        let mut config = None;
        let mut size_length = None;
        let mut index_length = None;
        let mut index_delta_length = None;
        for p in format_specific_params.split(';') {
            let p = p.trim();
            if p.is_empty() {
                // Reolink cameras leave a trailing ';'.
                continue;
            }
            let (key, value) = p
                .split_once('=')
                .ok_or_else(|| format!("bad format-specific-param {p}"))?;
            let value = value.trim();
            match &key.trim().to_ascii_lowercase()[..] {
                "config" => {
                    config = Some(
                        hex::decode(value)
                            .map_err(|_| "config has invalid hex encoding".to_string())?,
                    );
                }
                "mode" => {
                    mode = Some(match &value.to_ascii_lowercase()[..] {
                        "aac-hbr" => Mode::Hbr,
                        "aac-lbr" => Mode::Lbr,
                        _ => return Err(format!("unsupported AAC mode {value:?}")),
                    })
                }
                "sizelength" => {
                    size_length =
                        Some(u8::from_str_radix(value, 10).map_err(|_| "bad sizeLength".to_string())?);
                }
                "indexlength" => {
                    index_length = Some(
                        u8::from_str_radix(value, 10).map_err(|_| "bad indexLength".to_string())?,
                    );
                }
                "indexdeltalength" => {
                    index_delta_length = Some(
                        u8::from_str_radix(value, 10)
                            .map_err(|_| "bad indexDeltaLength".to_string())?,
                    );
                }
                _ => {}
            }
        }
        let mode = mode.ok_or_else(|| "mode must be specified".to_string())?;
        let config = config.ok_or_else(|| "config must be specified".to_string())?;
        let (default_size, default_index) = match mode {
            Mode::Lbr => (6, 2),
            Mode::Hbr => (13, 3),
        };
        let size_length = size_length.unwrap_or(default_size);
        let index_length = index_length.unwrap_or(default_index);
        let index_delta_length = index_delta_length.unwrap_or(default_index);
        if (size_length, index_length, index_delta_length)
            != (default_size, default_index, default_index)
        {
            return Err(format!(
                "{} requires sizeLength={default_size} indexLength={default_index} \
                 indexDeltaLength={default_index}; got {size_length}/{index_length}/\
                 {index_delta_length}",
                mode.as_str()
            ));
        }

        let config = AudioSpecificConfig::parse(&config[..])?;
        if clock_rate != config.sampling_frequency {
            return Err(format!(
                "Expected RTP clock rate {} and AAC sampling frequency {} to match",
                clock_rate, config.sampling_frequency,
            ));
        }
        Ok(FormatParams {
            mode,
            config,
            size_length,
            index_length,
            index_delta_length,
        })
    }
}

/// The received prefix of a single access unit which has been spread across
/// multiple packets.
#[derive(Debug)]
struct Fragment {
    timestamp: Timestamp,

    /// The AU-size declared in every fragment's AU-header.
    size: usize,
    buf: BytesMut,
}

/// Depacketizes `mpeg4-generic` packets carrying one access unit or one
/// fragment of an access unit each.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    size_length: u32,
    index_length: u32,
    frag: Option<Fragment>,
    pending: Option<AudioFrame>,

    /// Loss not yet attributed to an emitted frame.
    loss: u16,
}

impl Depacketizer {
    pub(crate) fn new(params: &FormatParams) -> Self {
        Depacketizer {
            size_length: u32::from(params.size_length),
            index_length: u32::from(params.index_length),
            frag: None,
            pending: None,
            loss: 0,
        }
    }

    pub(crate) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        if pkt.loss() > 0 {
            self.loss = self.loss.saturating_add(pkt.loss());
            if let Some(f) = self.frag.take() {
                debug!(
                    "discarding {}/{}-byte AAC fragment after loss of {} packet(s) before seq {:04x}",
                    f.buf.len(),
                    f.size,
                    pkt.loss(),
                    pkt.sequence_number()
                );
            }
        }
        let timestamp = pkt.timestamp();
        let mark = pkt.mark();
        let seq = pkt.sequence_number();
        let payload = pkt.into_payload_bytes();
        let Some(&len_bytes) = payload.first_chunk::<2>() else {
            return Err(format!("AAC packet seq {seq:04x} too short for AU-headers-length"));
        };
        let au_headers_length_bits = u32::from(u16::from_be_bytes(len_bytes));
        let header_bits = self.size_length + self.index_length;
        if au_headers_length_bits != header_bits {
            self.frag = None;
            if au_headers_length_bits > header_bits {
                return Err(format!(
                    "AU-headers-length {au_headers_length_bits} in seq {seq:04x}: \
                     multiple access units per packet are unsupported"
                ));
            }
            return Err(format!(
                "AU-headers-length {au_headers_length_bits} in seq {seq:04x} shorter than one \
                 {header_bits}-bit AU-header"
            ));
        }
        let header_bytes = (au_headers_length_bits as usize).div_ceil(8);
        let Some(headers) = payload.get(2..2 + header_bytes) else {
            return Err(format!("AAC packet seq {seq:04x} truncated in AU-headers"));
        };
        let mut r = bitstream_io::BitReader::endian(headers, bitstream_io::BigEndian);
        let (size, index) = (|| {
            let size = r.read::<u32>(self.size_length)?;
            let index = r.read::<u32>(self.index_length)?;
            Ok::<_, std::io::Error>((size as usize, index))
        })()
        .map_err(|e| format!("unable to read AU-header in seq {seq:04x}: {e}"))?;
        if index != 0 {
            self.frag = None;
            return Err(format!(
                "AU-Index {index} in seq {seq:04x}: interleaving is unsupported"
            ));
        }
        let data = payload.slice(2 + header_bytes..);

        match self.frag.take() {
            Some(mut frag)
                if frag.timestamp.timestamp() == timestamp.timestamp() && frag.size == size =>
            {
                frag.buf.extend_from_slice(&data);
                if frag.buf.len() > size {
                    return Err(format!(
                        "AAC fragments total {} bytes, more than declared {size} in seq {seq:04x}",
                        frag.buf.len()
                    ));
                }
                if frag.buf.len() == size {
                    if !mark {
                        debug!("AAC access unit completed in seq {seq:04x} without marker bit");
                    }
                    self.emit(frag.timestamp, frag.buf.freeze());
                    return Ok(());
                }
                if mark {
                    debug!(
                        "marker in seq {seq:04x} with {}/{size} bytes of AAC access unit; \
                         awaiting the rest",
                        frag.buf.len()
                    );
                }
                self.frag = Some(frag);
                return Ok(());
            }
            Some(frag) => debug!(
                "discarding {}/{}-byte AAC fragment at {}: seq {seq:04x} starts a {size}-byte \
                 access unit at {timestamp}",
                frag.buf.len(),
                frag.size,
                frag.timestamp
            ),
            None => {}
        }

        if data.len() == size {
            self.emit(timestamp, data);
            return Ok(());
        }
        if data.len() > size {
            return Err(format!(
                "AAC packet seq {seq:04x} has {} bytes after AU-headers for a {size}-byte access \
                 unit",
                data.len()
            ));
        }
        if mark {
            debug!(
                "AAC packet seq {seq:04x} with marker has only {}/{size} bytes; awaiting the rest",
                data.len()
            );
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.extend_from_slice(&data);
        self.frag = Some(Fragment {
            timestamp,
            size,
            buf,
        });
        Ok(())
    }

    pub(crate) fn pull(&mut self) -> Option<AudioFrame> {
        self.pending.take()
    }

    pub(crate) fn reset(&mut self) {
        self.frag = None;
        self.pending = None;
        self.loss = 0;
    }

    fn emit(&mut self, timestamp: Timestamp, data: Bytes) {
        self.pending = Some(AudioFrame {
            timestamp,
            data,
            loss: std::mem::take(&mut self.loss),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{init_logging, packet};
    use std::num::NonZeroU32;

    fn ts(t: i64) -> Timestamp {
        Timestamp::new(t, NonZeroU32::new(12_000).unwrap(), 0).unwrap()
    }

    fn params() -> FormatParams {
        FormatParams::parse(
            12_000,
            "profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1490;",
        )
        .unwrap()
    }

    /// An AAC-hbr payload with one AU-header declaring `size`.
    fn hbr(size: u16, data: &[u8]) -> Vec<u8> {
        let mut p = vec![0x00, 0x10];
        p.extend_from_slice(&(size << 3).to_be_bytes());
        p.extend_from_slice(data);
        p
    }

    #[test]
    fn parse_audio_specific_config() {
        let dahua = &[0x11, 0x88];
        let dahua = AudioSpecificConfig::parse(dahua).unwrap();
        assert_eq!(dahua.sampling_frequency, 48_000);
        assert_eq!(dahua.channels, 1);
        assert_eq!(dahua.frame_length, 1024);

        let bunny = &[0x14, 0x90];
        let bunny = AudioSpecificConfig::parse(bunny).unwrap();
        assert_eq!(bunny.audio_object_type, 2);
        assert_eq!(bunny.sampling_frequency, 12_000);
        assert_eq!(bunny.channels, 2);
        assert_eq!(CHANNEL_CONFIGS[2].as_ref().unwrap().name, "stereo");

        let rfc3640 = &[0x11, 0xB0];
        let rfc3640 = AudioSpecificConfig::parse(rfc3640).unwrap();
        assert_eq!(rfc3640.sampling_frequency, 48_000);
        assert_eq!(rfc3640.channels, 6);

        AudioSpecificConfig::parse(&[0x16, 0x90]).unwrap_err(); // reserved frequency 0xd
        AudioSpecificConfig::parse(&[0x14]).unwrap_err();
    }

    #[test]
    fn adts() {
        let p = params();
        assert_eq!(
            p.config.adts_header(100).unwrap(),
            [0xff, 0xf1, 0x64, 0x80, 0x0d, 0x7f, 0xfc]
        );
        p.config.adts_header(0x2000).unwrap_err();
    }

    #[test]
    fn format_params() {
        let p = params();
        assert_eq!(p.mode, Mode::Hbr);
        assert_eq!(p.size_length, 13);

        // AAC-lbr defaults.
        let lbr = FormatParams::parse(12_000, "mode=AAC-lbr;config=1490").unwrap();
        assert_eq!((lbr.size_length, lbr.index_length), (6, 2));

        FormatParams::parse(48_000, "mode=AAC-hbr;config=1490").unwrap_err(); // clock mismatch
        FormatParams::parse(12_000, "mode=AAC-hbr").unwrap_err();
        FormatParams::parse(12_000, "config=1490").unwrap_err();
        FormatParams::parse(12_000, "mode=CELP-cbr;config=1490").unwrap_err();
        FormatParams::parse(12_000, "mode=AAC-hbr;sizelength=6;config=1490").unwrap_err();
    }

    #[test]
    fn single_access_unit() {
        init_logging();
        let mut d = Depacketizer::new(&params());
        d.push(packet(ts(0), 0, true, 0, &hbr(4, b"asdf"))).unwrap();
        let f = d.pull().unwrap();
        assert_eq!(&f.data[..], b"asdf");
        assert_eq!(f.timestamp, ts(0));
        assert!(d.pull().is_none());
    }

    #[test]
    fn fragmented() {
        let mut d = Depacketizer::new(&params());
        d.push(packet(ts(0), 0, false, 0, &hbr(9, b"foo"))).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts(0), 1, false, 0, &hbr(9, b"bar"))).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts(0), 2, true, 0, &hbr(9, b"baz"))).unwrap();
        assert_eq!(&d.pull().unwrap().data[..], b"foobarbaz");
    }

    #[test]
    fn loss_during_fragment() {
        let mut d = Depacketizer::new(&params());
        d.push(packet(ts(0), 0, false, 0, &hbr(6, b"foo"))).unwrap();
        // The continuation arrives after loss; with no fragment in progress it
        // looks like a short single packet carrying the marker, and is kept
        // until the next access unit replaces it.
        d.push(packet(ts(0), 2, true, 1, &hbr(6, b"bar"))).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts(1024), 3, true, 0, &hbr(4, b"next"))).unwrap();
        let f = d.pull().unwrap();
        assert_eq!(&f.data[..], b"next");
        assert_eq!(f.loss, 1);
    }

    #[test]
    fn marker_before_complete_unit() {
        init_logging();
        let mut d = Depacketizer::new(&params());
        d.push(packet(ts(0), 0, true, 0, &hbr(9, b"foo"))).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts(0), 1, true, 0, &hbr(9, b"bar"))).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(ts(0), 2, true, 0, &hbr(9, b"baz"))).unwrap();
        let f = d.pull().unwrap();
        assert_eq!(&f.data[..], b"foobarbaz");
        assert_eq!(f.timestamp, ts(0));
    }

    #[test]
    fn bad_packets() {
        let mut d = Depacketizer::new(&params());
        d.push(packet(ts(0), 0, true, 0, b"\x00")).unwrap_err();
        d.push(packet(ts(0), 1, true, 0, b"\x00\x20\x00\x20\x00\x20ab")).unwrap_err(); // two AUs
        d.push(packet(ts(0), 2, true, 0, b"\x00\x08\x00")).unwrap_err(); // short header
        d.push(packet(ts(0), 3, true, 0, &hbr(2, b"toolong"))).unwrap_err();
        d.push(packet(ts(0), 4, true, 0, b"\x00\x10\x00\x21a")).unwrap_err(); // AU-Index 1
        assert!(d.pull().is_none());
    }
}
