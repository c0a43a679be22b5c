// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Routes interleaved RTP data to the per-track depacketizers during `PLAY`
//! and hands their output to the codec queues.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};

use crate::codec::{AudioFrame, CodecItem, Depacketizer, NalUnit};
use crate::queue::{Queue, TryEnqueueError};
use crate::rtp::RtpHeader;
use crate::{ConnectionContext, Error, ErrorInt, PacketContext, RtspMessageContext};

use super::TrackKind;
use super::rtp::InorderParser;
use super::timeline::Timeline;

/// Counters kept by the network task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// RTP packets accepted and passed to a depacketizer.
    pub packets: u64,

    /// Interleaved frames on RTCP channels, which are ignored.
    pub rtcp_frames: u64,

    /// Packets dropped because no set-up track takes their payload type, or
    /// the track has no depacketizer (PCMU, PCMA, LATM).
    pub unroutable: u64,

    /// Packets rejected as malformed RTP.
    pub rtp_errors: u64,

    /// Packets rejected by a depacketizer.
    pub depacketization_errors: u64,
}

/// One set-up track in the data phase.
pub(crate) struct DemuxTrack {
    pub(crate) kind: TrackKind,
    pub(crate) payload_type: u8,

    /// The RTP channel; RTCP is on `channel_id + 1`.
    pub(crate) channel_id: u8,
    pub(crate) parser: InorderParser,
    pub(crate) timeline: Timeline,

    /// `None` for recognized codecs which aren't depacketized.
    pub(crate) depacketizer: Option<Depacketizer>,
}

/// Routes packets by channel and payload type, tracks sequence numbers, and
/// depacketizes. Owned by the network task.
pub(crate) struct Demuxer {
    conn_ctx: ConnectionContext,
    tracks: Vec<DemuxTrack>,
    video: Option<Arc<Queue<NalUnit>>>,
    audio: Option<Arc<Queue<AudioFrame>>>,

    /// Depacketized output which didn't fit in a full blocking queue.
    backlog: VecDeque<CodecItem>,
    stats: DemuxStats,
}

impl Demuxer {
    pub(crate) fn new(
        conn_ctx: ConnectionContext,
        tracks: Vec<DemuxTrack>,
        video: Option<Arc<Queue<NalUnit>>>,
        audio: Option<Arc<Queue<AudioFrame>>>,
    ) -> Self {
        Self {
            conn_ctx,
            tracks,
            video,
            audio,
            backlog: VecDeque::new(),
            stats: DemuxStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Finds the track for an RTP packet.
    ///
    /// The channel assigned at `SETUP` is preferred; a packet on an unknown
    /// channel is matched by payload type alone if that is unambiguous.
    fn route(&self, channel_id: u8, payload_type: u8) -> Option<usize> {
        if let Some(i) = self
            .tracks
            .iter()
            .position(|t| t.channel_id == channel_id && t.payload_type == payload_type)
        {
            return Some(i);
        }
        if self.tracks.iter().any(|t| t.channel_id == channel_id) {
            return None;
        }
        let mut candidates = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.payload_type == payload_type);
        match (candidates.next(), candidates.next()) {
            (Some((i, _)), None) => Some(i),
            _ => None,
        }
    }

    /// Handles one interleaved data frame.
    ///
    /// Errors concern only this frame; the caller logs them and continues.
    pub(crate) fn handle_data(
        &mut self,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        body: Bytes,
    ) -> Result<(), Error> {
        let pkt_ctx = PacketContext::tcp(msg_ctx, channel_id);
        if channel_id % 2 == 1 {
            trace!("{pkt_ctx}: ignoring {}-byte RTCP frame", body.len());
            self.stats.rtcp_frames += 1;
            return Ok(());
        }
        let Some(hdr) = RtpHeader::parse(&body) else {
            self.stats.rtp_errors += 1;
            let (ssrc, sequence_number) = super::rtp::ids_if_present(&body);
            bail!(ErrorInt::RtpPacketError {
                conn_ctx: self.conn_ctx,
                pkt_ctx,
                stream_id: usize::from(channel_id / 2),
                ssrc,
                sequence_number,
                description: format!(
                    "invalid RTP header\n{:#?}",
                    crate::hex::LimitedHex::new(&body, 64)
                ),
            });
        };
        let Some(stream_id) = self.route(channel_id, hdr.payload_type) else {
            self.stats.unroutable += 1;
            match hdr.payload_type {
                0 | 8 => debug!(
                    "{pkt_ctx}: dropping G.711 packet (pt={}) with no set-up track",
                    hdr.payload_type
                ),
                pt => debug!("{pkt_ctx}: dropping packet with unroutable payload type {pt}"),
            }
            return Ok(());
        };
        let conn_ctx = self.conn_ctx;
        let track = &mut self.tracks[stream_id];
        let pkt = match track
            .parser
            .rtp(&conn_ctx, &pkt_ctx, &mut track.timeline, stream_id, body)
        {
            Ok(Some(pkt)) => pkt,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.stats.rtp_errors += 1;
                return Err(e);
            }
        };
        let Some(depacketizer) = track.depacketizer.as_mut() else {
            trace!("{pkt_ctx}: dropping {:?} packet; codec not depacketized", track.kind);
            self.stats.unroutable += 1;
            return Ok(());
        };
        trace!("{pkt_ctx}: {:?} seq={:04x}", track.kind, pkt.sequence_number());
        self.stats.packets += 1;
        if let Err(description) = depacketizer.push(pkt) {
            self.stats.depacketization_errors += 1;
            bail!(ErrorInt::DepacketizationError {
                conn_ctx,
                pkt_ctx,
                stream_id,
                description,
            });
        }
        while let Some(item) = depacketizer.pull() {
            self.backlog.push_back(item);
        }
        self.flush_backlog();
        Ok(())
    }

    /// Moves pending output to the codec queues without blocking.
    ///
    /// Returns false while a full [`crate::queue::OverflowPolicy::Block`]
    /// queue holds some back; the caller should stop reading until it drains.
    pub(crate) fn flush_backlog(&mut self) -> bool {
        while let Some(item) = self.backlog.pop_front() {
            // A closed queue means the consumer is shutting down.
            let full = match item {
                CodecItem::Nal(nal) => match self.video.as_ref().map(|q| q.try_enqueue(nal)) {
                    Some(Err(TryEnqueueError::Full(nal))) => Some(CodecItem::Nal(nal)),
                    _ => None,
                },
                CodecItem::AudioFrame(frame) => {
                    match self.audio.as_ref().map(|q| q.try_enqueue(frame)) {
                        Some(Err(TryEnqueueError::Full(frame))) => {
                            Some(CodecItem::AudioFrame(frame))
                        }
                        _ => None,
                    }
                }
            };
            if let Some(item) = full {
                self.backlog.push_front(item);
                return false;
            }
        }
        true
    }

    /// Drops partial units and closes the output queues so consumers drain
    /// and exit.
    pub(crate) fn finish(&mut self) {
        if !self.backlog.is_empty() {
            debug!("discarding {} unit(s) not yet queued", self.backlog.len());
            self.backlog.clear();
        }
        for t in &mut self.tracks {
            if let Some(d) = t.depacketizer.as_mut() {
                d.reset();
            }
        }
        if let Some(q) = &self.video {
            q.close();
        }
        if let Some(q) = &self.audio {
            q.close();
        }
    }
}
