// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use rtsp_ingest::codec::{Depacketizer, VideoCodec};
use std::num::NonZeroU32;

fuzz_target!(|data: &[u8]| {
    let mut data = data;
    let mut depacketizer = Depacketizer::new_video(VideoCodec::H264, 16);
    let mut timestamp =
        rtsp_ingest::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0).unwrap();
    let mut sequence_number: u16 = 0;
    let pkt_ctx = rtsp_ingest::PacketContext::dummy();
    loop {
        let Some((hdr, rest)) = data.split_first() else {
            return;
        };
        let ts_change = (hdr & 0b001) != 0;
        let mark = (hdr & 0b010) != 0;
        let loss = (hdr & 0b100) != 0;
        let len = usize::from(hdr >> 3);
        if rest.len() < len {
            return;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        if loss {
            sequence_number = sequence_number.wrapping_add(1);
        }
        if ts_change {
            timestamp = timestamp.try_add(1).unwrap();
        }
        let pkt = rtsp_ingest::rtp::ReceivedPacketBuilder {
            ctx: pkt_ctx,
            stream_id: 0,
            timestamp,
            ssrc: 0,
            sequence_number,
            loss: u16::from(loss),
            payload_type: 96,
            mark,
        }
        .build(payload.iter().copied())
        .unwrap();

        // Errors drop only the packet; the depacketizer must stay usable.
        let _ = depacketizer.push(pkt);
        while depacketizer.pull().is_some() {}
        sequence_number = sequence_number.wrapping_add(1);
    }
});
