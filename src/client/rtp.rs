// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-stream RTP sequence tracking; see
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use bytes::Bytes;
use log::{debug, info};

use crate::rtp::{RawPacket, ReceivedPacket};
use crate::{ConnectionContext, Error, ErrorInt, PacketContext};

use super::timeline::Timeline;

/// Validates RTP packets of one stream and annotates them with loss and an
/// extended timestamp.
///
/// Over TCP, packets can't be reordered in transit, but servers sometimes
/// send duplicates or drop packets internally. Packets whose sequence number
/// is behind the expected one (by less than half the sequence space) are
/// duplicates or stale and are skipped; any forward gap is reported as
/// [`ReceivedPacket::loss`].
///
/// A change of SSRC restarts tracking rather than failing the stream.
#[derive(Debug)]
pub struct InorderParser {
    ssrc: Option<u32>,
    next_seq: Option<u16>,
}

impl InorderParser {
    /// `next_seq` is typically the `seq` parameter of the `RTP-Info` header.
    pub fn new(ssrc: Option<u32>, next_seq: Option<u16>) -> Self {
        Self { ssrc, next_seq }
    }

    /// Handles one RTP packet.
    ///
    /// Returns `Ok(None)` for packets to silently skip. Errors concern only
    /// this packet.
    pub fn rtp(
        &mut self,
        conn_ctx: &ConnectionContext,
        pkt_ctx: &PacketContext,
        timeline: &mut Timeline,
        stream_id: usize,
        data: Bytes,
    ) -> Result<Option<ReceivedPacket>, Error> {
        let (raw, payload_range) = match RawPacket::new(data) {
            Ok(p) => p,
            Err(e) => {
                let (ssrc, sequence_number) = ids_if_present(&e.data);
                bail!(ErrorInt::RtpPacketError {
                    conn_ctx: *conn_ctx,
                    pkt_ctx: *pkt_ctx,
                    stream_id,
                    ssrc,
                    sequence_number,
                    description: format!(
                        "corrupt RTP packet while expecting seq={:04x?}: {}\n{:#?}",
                        self.next_seq,
                        e.reason,
                        crate::hex::LimitedHex::new(&e.data, 64),
                    ),
                });
            }
        };
        let ssrc = raw.ssrc();
        let sequence_number = raw.sequence_number();
        if matches!(self.ssrc, Some(s) if s != ssrc) {
            info!(
                "stream {stream_id}: ssrc changed from {:08x?} to {ssrc:08x} at seq={sequence_number:04x}",
                self.ssrc
            );
            self.next_seq = None;
        }
        let loss = sequence_number.wrapping_sub(self.next_seq.unwrap_or(sequence_number));
        if loss >= 0x80_00 {
            debug!(
                "stream {stream_id}: skipping out-of-order seq={sequence_number:04x} \
                 when expecting seq={:04x?}",
                self.next_seq
            );
            return Ok(None);
        }
        let timestamp = timeline.advance_to(raw.timestamp()).map_err(|description| {
            wrap!(ErrorInt::RtpPacketError {
                conn_ctx: *conn_ctx,
                pkt_ctx: *pkt_ctx,
                stream_id,
                ssrc,
                sequence_number,
                description,
            })
        })?;
        self.ssrc = Some(ssrc);
        self.next_seq = Some(sequence_number.wrapping_add(1));
        Ok(Some(ReceivedPacket {
            ctx: *pkt_ctx,
            stream_id,
            timestamp,
            raw,
            payload_range,
            loss,
        }))
    }
}

/// Pulls the SSRC and sequence number out of a packet too broken to parse,
/// for error context.
pub(super) fn ids_if_present(data: &[u8]) -> (u32, u16) {
    match data.get(..12) {
        Some(h) => (
            u32::from_be_bytes([h[8], h[9], h[10], h[11]]),
            u16::from_be_bytes([h[2], h[3]]),
        ),
        None => (0, 0),
    }
}
