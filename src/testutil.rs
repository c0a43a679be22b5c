// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::num::NonZeroU32;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rtsp_types::headers::{self, HeaderName};
use rtsp_types::{Message, Method, StatusCode};
use tokio::net::TcpListener;

use crate::bits::{BitWriter, escape_rbsp};
use crate::queue::Queue;
use crate::rtp::{ReceivedPacket, ReceivedPacketBuilder, RtpHeader};
use crate::tokio::Connection;
use crate::{PacketContext, Timestamp};

pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

pub(crate) fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

/// A timestamp at the 90 kHz video clock rate, starting at 0.
pub(crate) fn ts90k(timestamp: i64) -> Timestamp {
    Timestamp::new(timestamp, NonZeroU32::new(90_000).unwrap(), 0).unwrap()
}

pub(crate) fn packet(
    timestamp: Timestamp,
    sequence_number: u16,
    mark: bool,
    loss: u16,
    payload: &[u8],
) -> ReceivedPacket {
    ReceivedPacketBuilder {
        ctx: PacketContext::dummy(),
        stream_id: 0,
        sequence_number,
        timestamp,
        payload_type: 96,
        ssrc: 0x1234_5678,
        mark,
        loss,
    }
    .build(payload.iter().copied())
    .unwrap()
}

/// An H.264 704x480 SPS with `pic_order_cnt_type` 0, and its PPS.
pub(crate) const H264_SPROP: &str = "Z01AHppkBYHv/lBgYGQAAA+gAAE4gBA=,aO48gA==";

/// Builds a slice NAL (without start code) for [`H264_SPROP`]: 9-bit
/// `frame_num` and 9-bit `pic_order_cnt_lsb`.
pub(crate) fn h264_slice(nal_header: u8, slice_type: u32, frame_num: u64, lsb: u64) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(0); // first_mb_in_slice
    w.write_ue(slice_type);
    w.write_ue(0); // pic_parameter_set_id
    w.write_bits(9, frame_num);
    if nal_header & 0b1_1111 == crate::codec::h264::UNIT_TYPE_IDR {
        w.write_ue(0); // idr_pic_id
    }
    w.write_bits(9, lsb);
    w.write_bits(8, 0xa5); // rest of the slice
    w.write_rbsp_trailing_bits();
    let mut nal = vec![nal_header];
    nal.extend(escape_rbsp(&w.into_bytes()));
    nal
}

/// An H.265 704x480 VPS, SPS (no reordering), and PPS, as `sprop-*` values.
pub(crate) const H265_VPS: &str = "QAEMAf//AWAAAAMAsAAAAwAAAwBarAwAAAMABAAAAwAyqA==";
pub(crate) const H265_SPS: &str = "QgEBAWAAAAMAsAAAAwAAAwBaoAWCAeFja5JFL83BQYFBAAADAAEAAAMADKE=";
pub(crate) const H265_PPS: &str = "RAHA8saNA7NA";

/// Builds a TRAIL_R or IDR_W_RADL slice NAL (without start code) for the
/// `H265_*` parameter sets.
pub(crate) fn h265_slice(idr: bool, lsb: u64) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bit(true); // first_slice_segment_in_pic_flag
    if idr {
        w.write_bit(false); // no_output_of_prior_pics_flag
    }
    w.write_ue(0); // slice_pic_parameter_set_id
    w.write_ue(2); // slice_type I
    if !idr {
        w.write_bits(16, lsb);
        w.write_bit(false); // short_term_ref_pic_set_sps_flag
        w.write_ue(0); // num_negative_pics
        w.write_ue(0); // num_positive_pics
        w.write_ue(0); // num_long_term_pics
        w.write_bit(false); // slice_temporal_mvp_enabled_flag
    }
    w.write_bits(2, 0); // slice_sao_luma_flag, slice_sao_chroma_flag
    w.write_se(0); // slice_qp_delta
    w.write_bit(false); // deblocking_filter_override_flag
    w.write_bit(false); // slice_loop_filter_across_slices_enabled_flag
    w.write_ue(0); // slice_segment_header_extension_length
    w.write_rbsp_trailing_bits();
    w.write_bits(16, 0);
    let mut nal = if idr { vec![0x26, 0x01] } else { vec![0x02, 0x01] };
    nal.extend_from_slice(&escape_rbsp(&w.into_bytes()));
    nal
}

/// A serialized RTP packet with SSRC 0x1234.
pub(crate) fn rtp_packet(pt: u8, seq: u16, ts: u32, mark: bool, payload: &[u8]) -> Bytes {
    let mut buf = Vec::new();
    RtpHeader {
        padding: false,
        extension: false,
        csrc_count: 0,
        marker: mark,
        payload_type: pt,
        sequence_number: seq,
        timestamp: ts,
        ssrc: 0x1234,
        payload_size: 0,
    }
    .write(&mut buf);
    buf.extend_from_slice(payload);
    buf.into()
}

/// Polls a queue without blocking the runtime.
pub(crate) async fn next_item<T>(q: &Queue<T>) -> T {
    for _ in 0..500 {
        if let Some(item) = q.try_dequeue() {
            return item;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for queue item");
}

/// Binds a loopback listener and returns it with an `rtsp://<addr>/cam` URL.
pub(crate) async fn listen() -> (TcpListener, url::Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = url::Url::parse(&format!("rtsp://{}/cam", listener.local_addr().unwrap())).unwrap();
    (listener, url)
}

/// The server side of one RTSP connection, scripted by each test.
pub(crate) struct FakeServer {
    conn: Connection,
}

impl FakeServer {
    pub(crate) async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        FakeServer {
            conn: Connection::from_stream(stream).unwrap(),
        }
    }

    /// Returns the next request, or `None` once the client closes.
    pub(crate) async fn next_request(&mut self) -> Option<rtsp_types::Request<Bytes>> {
        match self.conn.next().await?.unwrap().msg {
            Message::Request(r) => Some(r),
            o => panic!("unexpected message {o:?}"),
        }
    }

    pub(crate) async fn expect(&mut self, method: Method) -> rtsp_types::Request<Bytes> {
        let req = self.next_request().await.unwrap();
        assert_eq!(req.method(), &method);
        req
    }

    pub(crate) async fn reply_with_cseq(
        &mut self,
        cseq: &str,
        status: StatusCode,
        headers: &[(HeaderName, &str)],
        body: &[u8],
    ) {
        let mut resp = rtsp_types::Response::builder(rtsp_types::Version::V1_0, status)
            .header(headers::CSEQ, cseq.to_owned());
        for (name, value) in headers {
            resp = resp.header(name.clone(), (*value).to_owned());
        }
        self.conn
            .send(Message::Response(resp.build(Bytes::copy_from_slice(body))))
            .await
            .unwrap();
    }

    pub(crate) async fn reply(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        status: StatusCode,
        headers: &[(HeaderName, &str)],
        body: &[u8],
    ) {
        let cseq = req.header(&headers::CSEQ).unwrap().as_str().to_owned();
        self.reply_with_cseq(&cseq, status, headers, body).await;
    }

    pub(crate) async fn data(&mut self, channel_id: u8, body: Bytes) {
        self.conn
            .send(Message::Data(rtsp_types::Data::new(channel_id, body)))
            .await
            .unwrap();
    }

    /// Answers DESCRIBE with `sdp`, one SETUP on channels 0-1, and PLAY.
    pub(crate) async fn negotiate_one_track(&mut self, sdp: &[u8]) {
        let req = self.expect(Method::Describe).await;
        self.reply(&req, StatusCode::Ok, &[(headers::CONTENT_TYPE, "application/sdp")], sdp)
            .await;
        let req = self.expect(Method::Setup).await;
        self.reply(
            &req,
            StatusCode::Ok,
            &[
                (headers::SESSION, "feed;timeout=60"),
                (headers::TRANSPORT, "RTP/AVP/TCP;unicast;interleaved=0-1"),
            ],
            b"",
        )
        .await;
        let req = self.expect(Method::Play).await;
        self.reply(&req, StatusCode::Ok, &[(headers::SESSION, "feed")], b"")
            .await;
    }

    /// Answers keepalives until TEARDOWN, which it also answers.
    ///
    /// Returns the number of keepalives.
    pub(crate) async fn serve_until_teardown(&mut self) -> usize {
        let mut keepalives = 0;
        loop {
            let req = self.next_request().await.unwrap();
            match req.method() {
                Method::GetParameter => {
                    keepalives += 1;
                    self.reply(&req, StatusCode::Ok, &[], b"").await;
                }
                Method::Teardown => {
                    self.reply(&req, StatusCode::Ok, &[], b"").await;
                    return keepalives;
                }
                m => panic!("unexpected {m:?}"),
            }
        }
    }
}
