// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP responses: the `DESCRIBE` body (SDP) and the `Session`,
//! `Transport`, and `RTP-Info` headers.

use bytes::Bytes;
use log::debug;
use pretty_hex::PrettyHex;
use sdp_types::Media;
use url::Url;

use crate::codec::{AudioCodec, VideoCodec, aac, h264, h265};

/// Session timeout assumed when the `Session` header doesn't specify one.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u32 = 60;

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1)
/// which may be routed without an `rtpmap`.
struct StaticPayloadType {
    payload_type: u8,
    encoding: &'static str,
    clock_rate: u32,
}

static STATIC_PAYLOAD_TYPES: [StaticPayloadType; 2] = [
    StaticPayloadType {
        payload_type: 0,
        encoding: "pcmu",
        clock_rate: 8_000,
    },
    StaticPayloadType {
        payload_type: 8,
        encoding: "pcma",
        clock_rate: 8_000,
    },
];

/// The parsed session description from a `DESCRIBE` response.
///
/// Only the first video and first audio media sections are kept.
#[derive(Debug)]
pub struct SdpInfo {
    /// `s=` line.
    pub session_name: String,

    /// `i=` line at session level, if any.
    pub session_description: Option<String>,

    /// URL against which relative control URLs were resolved.
    pub base_url: Url,

    /// Aggregate control URL, used for `PLAY`, `GET_PARAMETER` and `TEARDOWN`.
    pub control: Url,

    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}

/// A `m=video` section.
#[derive(Clone, Debug)]
pub struct VideoTrack {
    /// Absolute control URL for `SETUP`; `None` means use the aggregate URL.
    pub control: Option<Url>,

    /// RTP payload type (the first listed format).
    pub payload_type: u8,

    /// Lowercase `rtpmap` encoding name.
    pub encoding_name: String,
    pub clock_rate: u32,

    /// `None` if the encoding isn't supported; such tracks are skipped by
    /// `SETUP`.
    pub codec: Option<VideoCodec>,

    /// Out-of-band parameter sets from `fmtp`, each with an Annex B start
    /// code. `vps` is only for H.265.
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl VideoTrack {
    pub fn is_supported(&self) -> bool {
        self.codec.is_some()
    }
}

/// A `m=audio` section.
#[derive(Clone, Debug)]
pub struct AudioTrack {
    pub control: Option<Url>,
    pub payload_type: u8,
    pub encoding_name: String,

    /// `None` if the encoding isn't recognized; such tracks are skipped by
    /// `SETUP`.
    pub codec: Option<AudioCodec>,
    pub sample_rate_hz: u32,
    pub channels: u16,

    /// RFC 3640 parameters, for [`AudioCodec::Aac`] only.
    pub aac: Option<aac::FormatParams>,
}

impl AudioTrack {
    pub fn is_supported(&self) -> bool {
        self.codec.is_some()
    }

    /// `AAC-hbr` or `AAC-lbr`.
    pub fn mode(&self) -> Option<&'static str> {
        self.aac.as_ref().map(|a| a.mode.as_str())
    }

    /// The raw `AudioSpecificConfig`.
    pub fn config(&self) -> Option<&Bytes> {
        self.aac.as_ref().map(|a| &a.config.raw)
    }
}

/// Joins a control URL to a base URL the way live555 and ffmpeg do, which
/// differs from RFC 3986 when the base lacks a trailing slash.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    let sep = if base_url.as_str().ends_with('/') { "" } else { "/" };
    Url::parse(&format!("{}{sep}{control}", base_url.as_str()))
        .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

/// Returns the `CSeq` from an RTSP response, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str().trim(), 10).ok())
}

/// `rtpmap`-derived description of a media section's first format.
struct Rtpmap<'a> {
    encoding_name: String,
    clock_rate: u32,
    channels: Option<u16>,
    fmtp: Option<&'a str>,
    control: Option<Url>,
    payload_type: u8,
}

fn parse_rtpmap<'a>(base_url: &Url, m: &'a Media) -> Result<Rtpmap<'a>, String> {
    // "TCP/RTP/AVP" and similar variants show up in the wild.
    if !m.proto.starts_with("RTP/") && !m.proto.contains("/RTP/") {
        return Err(format!("expected RTP-based proto, got {:?}", m.proto));
    }

    // Only the first listed format is used.
    let payload_type_str = m
        .fmt
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| "no RTP payload type".to_owned())?;
    let payload_type = u8::from_str_radix(payload_type_str, 10)
        .ok()
        .filter(|pt| pt & 0x80 == 0)
        .ok_or_else(|| format!("invalid RTP payload type {payload_type_str:?}"))?;

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    for a in &m.attributes {
        let value = a.value.as_deref();
        match &a.attribute[..] {
            "rtpmap" => {
                let v = value.ok_or_else(|| "rtpmap attribute with no value".to_owned())?;
                let (pt, v) = v
                    .split_once(' ')
                    .ok_or_else(|| format!("invalid rtpmap attribute {v:?}"))?;
                if pt == payload_type_str {
                    rtpmap = Some(v.trim());
                }
            }
            "fmtp" => {
                let v = value.ok_or_else(|| "fmtp attribute with no value".to_owned())?;
                let (pt, v) = v
                    .split_once(' ')
                    .ok_or_else(|| format!("invalid fmtp attribute {v:?}"))?;
                if pt == payload_type_str {
                    fmtp = Some(v.trim());
                }
            }
            "control" => control = value.map(|c| join_control(base_url, c)).transpose()?,
            _ => {}
        }
    }

    let (encoding_name, clock_rate, channels) = match rtpmap {
        Some(rtpmap) => {
            // encoding-name "/" clock-rate [ "/" channels ]
            let mut parts = rtpmap.split('/');
            let encoding_name = parts.next().unwrap_or_default().to_ascii_lowercase();
            let clock_rate = parts
                .next()
                .and_then(|c| u32::from_str_radix(c, 10).ok())
                .filter(|&c| c > 0)
                .ok_or_else(|| format!("bad clock rate in rtpmap {rtpmap:?}"))?;
            let channels = parts
                .next()
                .map(|c| {
                    u16::from_str_radix(c, 10)
                        .ok()
                        .filter(|&c| c > 0)
                        .ok_or_else(|| format!("invalid channels specification {c:?}"))
                })
                .transpose()?;
            (encoding_name, clock_rate, channels)
        }
        None => {
            let s = STATIC_PAYLOAD_TYPES
                .iter()
                .find(|s| s.payload_type == payload_type)
                .ok_or_else(|| {
                    format!("expected rtpmap or a known static payload type, got {payload_type}")
                })?;
            if m.media != "audio" {
                return Err(format!("static payload type {payload_type} requires m=audio"));
            }
            (s.encoding.to_owned(), s.clock_rate, Some(1))
        }
    };
    Ok(Rtpmap {
        encoding_name,
        clock_rate,
        channels,
        fmtp,
        control,
        payload_type,
    })
}

fn parse_video(base_url: &Url, m: &Media) -> Result<VideoTrack, String> {
    let r = parse_rtpmap(base_url, m)?;
    let codec = VideoCodec::from_encoding_name(&r.encoding_name);
    let mut track = VideoTrack {
        control: r.control,
        payload_type: r.payload_type,
        encoding_name: r.encoding_name,
        clock_rate: r.clock_rate,
        codec,
        vps: None,
        sps: None,
        pps: None,
    };
    let (Some(codec), Some(fmtp)) = (codec, r.fmtp) else {
        return Ok(track);
    };
    for p in fmtp.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = p.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match (codec, &key.trim().to_ascii_lowercase()[..]) {
            (VideoCodec::H264, "sprop-parameter-sets") => {
                let (sps, pps) = h264::parse_sprop_parameter_sets(value)?;
                track.sps = Some(sps);
                track.pps = Some(pps);
            }
            (VideoCodec::H265, "sprop-vps") => {
                track.vps = first(h265::parse_sprop(value, h265::nal::UnitType::VpsNut)?);
            }
            (VideoCodec::H265, "sprop-sps") => {
                track.sps = first(h265::parse_sprop(value, h265::nal::UnitType::SpsNut)?);
            }
            (VideoCodec::H265, "sprop-pps") => {
                track.pps = first(h265::parse_sprop(value, h265::nal::UnitType::PpsNut)?);
            }
            (VideoCodec::H265, "sprop-max-don-diff") if value != "0" => {
                return Err(format!("H.265 with sprop-max-don-diff={value} is unsupported"));
            }
            _ => {}
        }
    }
    Ok(track)
}

fn first(mut sets: Vec<Bytes>) -> Option<Bytes> {
    if sets.len() > 1 {
        debug!("ignoring {} extra out-of-band parameter sets", sets.len() - 1);
    }
    sets.drain(..).next()
}

fn parse_audio(base_url: &Url, m: &Media) -> Result<AudioTrack, String> {
    let r = parse_rtpmap(base_url, m)?;
    let codec = AudioCodec::from_encoding_name(&r.encoding_name);
    let aac = match codec {
        Some(AudioCodec::Aac) => {
            let fmtp = r
                .fmtp
                .ok_or_else(|| "mpeg4-generic requires format-specific-params".to_owned())?;
            Some(aac::FormatParams::parse(r.clock_rate, fmtp)?)
        }
        _ => None,
    };
    let channels = match (&aac, r.channels) {
        (Some(a), _) => a.config.channels,
        (None, Some(c)) => c,
        (None, None) => 1,
    };
    Ok(AudioTrack {
        control: r.control,
        payload_type: r.payload_type,
        encoding_name: r.encoding_name,
        codec,
        sample_rate_hz: r.clock_rate,
        channels,
        aac,
    })
}

/// Parses the SDP body of a `DESCRIBE` response.
pub(crate) fn parse_sdp(base_url: Url, request_url: &Url, body: &[u8]) -> Result<SdpInfo, String> {
    let sdp = sdp_types::Session::parse(body)
        .map_err(|e| format!("unable to parse SDP: {e}\n\n{:#?}", body.hex_dump()))?;

    let control = sdp
        .attributes
        .iter()
        .find(|a| a.attribute == "control")
        .and_then(|a| a.value.as_deref())
        .map(|c| join_control(&base_url, c))
        .transpose()?
        .unwrap_or_else(|| request_url.clone());

    let mut video: Option<VideoTrack> = None;
    let mut audio: Option<AudioTrack> = None;
    for (i, m) in sdp.medias.iter().enumerate() {
        let ctx = |e: String| format!("unable to parse media {i}: {e}\n\n{m:#?}");
        match &m.media[..] {
            "video" if video.as_ref().is_none_or(|v| !v.is_supported()) => {
                let v = parse_video(&base_url, m).map_err(ctx)?;
                if video.is_none() || v.is_supported() {
                    video = Some(v);
                }
            }
            "audio" if audio.as_ref().is_none_or(|a| !a.is_supported()) => {
                let a = parse_audio(&base_url, m).map_err(ctx)?;
                if audio.is_none() || a.is_supported() {
                    audio = Some(a);
                }
            }
            other => debug!("ignoring media {i} of type {other:?}"),
        }
    }
    Ok(SdpInfo {
        session_name: sdp.session_name,
        session_description: sdp.session_description,
        base_url,
        control,
        video,
        audio,
    })
}

/// Parses a successful `DESCRIBE` response.
pub(crate) fn parse_describe(
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<SdpInfo, String> {
    if !matches!(response.header(&rtsp_types::headers::CONTENT_TYPE),
                 Some(v) if v.as_str().trim().eq_ignore_ascii_case("application/sdp"))
    {
        return Err(format!(
            "DESCRIBE response not of expected application/sdp content type: {response:#?}"
        ));
    }

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| (rtsp_types::headers::CONTENT_BASE, v))
        .or_else(|| {
            response
                .header(&rtsp_types::headers::CONTENT_LOCATION)
                .map(|v| (rtsp_types::headers::CONTENT_LOCATION, v))
        })
        .map(|(h, v)| Url::parse(v.as_str().trim()).map_err(|e| format!("bad {h} {v:?}: {e}")))
        .unwrap_or_else(|| Ok(request_url.clone()))?;

    let sdp = parse_sdp(base_url, request_url, &response.body()[..])?;
    if !sdp.video.as_ref().is_some_and(VideoTrack::is_supported)
        && !sdp.audio.as_ref().is_some_and(AudioTrack::is_supported)
    {
        return Err(format!(
            "no supported video or audio track (video: {:?}, audio: {:?})",
            sdp.video.as_ref().map(|v| &v.encoding_name),
            sdp.audio.as_ref().map(|a| &a.encoding_name),
        ));
    }
    Ok(sdp)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

/// Parses a `Session` header value: `id[;timeout=N]`.
pub(crate) fn parse_session_header(value: &str) -> Result<SessionHeader, String> {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err(format!("empty session id in {value:?}"));
    }
    let mut timeout_sec = DEFAULT_SESSION_TIMEOUT_SECS;
    for p in parts {
        let Some(t) = p.trim().strip_prefix("timeout=") else {
            return Err(format!("unparseable Session header {value:?}"));
        };
        timeout_sec = u32::from_str_radix(t.trim(), 10)
            .ok()
            .filter(|&t| t > 0)
            .ok_or_else(|| format!("unparseable timeout {t:?}"))?;
    }
    Ok(SessionHeader {
        id: id.into(),
        timeout_sec,
    })
}

#[derive(Debug)]
pub(crate) struct SetupResponse {
    pub(crate) session: SessionHeader,
    pub(crate) ssrc: Option<u32>,

    /// The RTP channel; RTCP is on the next one.
    pub(crate) channel_id: Option<u8>,
}

/// Parses a `SETUP` response's `Session` and `Transport` headers.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.37
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "missing Session header".to_owned())?;
    let session = parse_session_header(session.as_str())?;
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "missing Transport header".to_owned())?;
    let mut channel_id = None;
    let mut ssrc = None;
    for part in transport.as_str().split(';').map(str::trim) {
        if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v}"))?);
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let (n, m) = match interleaved.split_once('-') {
                Some((n, m)) => (n, Some(m)),
                None => (interleaved, None),
            };
            let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel number {n}"))?;
            if let Some(m) = m {
                let m = u8::from_str_radix(m, 10)
                    .map_err(|_| format!("bad second channel number {m}"))?;
                if n.checked_add(1) != Some(m) {
                    return Err(format!("expected adjacent channels; got {n}-{m}"));
                }
            }
            if n % 2 != 0 {
                return Err(format!("RTP channel {n} must be even"));
            }
            channel_id = Some(n);
        }
    }
    Ok(SetupResponse {
        session,
        ssrc,
        channel_id,
    })
}

/// One stream's entry in the `RTP-Info` header of a `PLAY` response.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RtpInfo {
    pub(crate) url: Option<Url>,
    pub(crate) seq: Option<u16>,
    pub(crate) rtptime: Option<u32>,
    pub(crate) ssrc: Option<u32>,
}

/// Parses the `RTP-Info` header, if any, of a `PLAY` response.
pub(crate) fn parse_play(
    response: &rtsp_types::Response<Bytes>,
    base_url: &Url,
) -> Result<Vec<RtpInfo>, String> {
    // https://tools.ietf.org/html/rfc2326#section-12.33
    let Some(rtp_info) = response.header(&rtsp_types::headers::RTP_INFO) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for s in rtp_info.as_str().split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut info = RtpInfo::default();
        for part in s.split(';').map(str::trim) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("RTP-Info param {part:?} has no ="))?;
            match key {
                "url" => info.url = Some(join_control(base_url, value)?),
                "seq" => {
                    info.seq = Some(
                        u16::from_str_radix(value, 10).map_err(|_| format!("bad seq {value:?}"))?,
                    )
                }
                "rtptime" => {
                    info.rtptime = Some(
                        u32::from_str_radix(value, 10)
                            .map_err(|_| format!("bad rtptime {value:?}"))?,
                    )
                }
                "ssrc" => {
                    info.ssrc = Some(
                        u32::from_str_radix(value, 16)
                            .map_err(|_| format!("unparseable ssrc {value:?}"))?,
                    )
                }
                _ => {}
            }
        }
        out.push(info);
    }
    Ok(out)
}
