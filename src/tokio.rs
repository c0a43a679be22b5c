// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`]: one TCP stream carrying both RTSP messages and
//! `$`-framed interleaved RTP/RTCP data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use rtsp_types::{Data, Message};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Host;

use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// Length of the interleaved frame header: `$`, channel id, 16-bit length.
const INTERLEAVED_HEADER_LEN: usize = 4;

/// A RTSP connection which implements `Stream`, `Sink`, and `Unpin`.
pub(crate) struct Connection(Framed<TcpStream, Codec>);

impl Connection {
    pub(crate) async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self(Framed::new(
            stream,
            Codec {
                ctx: ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall,
                },
                read_pos: 0,
            },
        )))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.0.codec().read_pos + crate::to_u64(self.0.read_buffer().remaining()),
            received_wall: WallTime::now(),
            received: Instant::now(),
        }
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        let source = match e {
            CodecError::IoError(source) => source,
            CodecError::ParseError { description, .. } => std::io::Error::other(description),
        };
        ErrorInt::WriteError {
            conn_ctx: *self.ctx(),
            source,
        }
    }
}

impl Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(error) => ErrorInt::RtspReadError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: self.eof_ctx(),
                    source: error,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                        received: Instant::now(),
                    },
                    description,
                },
            })
        })
    }
}

impl Sink<Message<Bytes>> for Connection {
    type Error = ErrorInt;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.0
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}

/// Splits the byte stream into RTSP messages and interleaved data frames.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn parse_msg(&mut self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // Skip stray CRLFs between messages, as `rtsp-types` would. This must
        // happen before the `$` check so a data frame after a CRLF takes the
        // fast path below.
        while src.starts_with(b"\r\n") {
            src.advance(2);
            self.read_pos += 2;
        }

        if src.first() == Some(&b'$') {
            // Fast path for interleaved data: `$`, channel, 16-bit big-endian
            // length, then exactly that many bytes.
            if src.len() < INTERLEAVED_HEADER_LEN {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = INTERLEAVED_HEADER_LEN + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(INTERLEAVED_HEADER_LEN);
            return Ok(Some((
                len,
                Message::Data(Data::new(channel_id, msg.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Re-home the body as a `Bytes` slice of `src`. The parsed message
        // borrows `src`, so first detach it (replacing the body with `Empty`),
        // then split `src` and put the owned body back.
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                Message::Request(msg.replace_body(split_body(src, len, body_range)))
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                Message::Response(msg.replace_body(split_body(src, len, body_range)))
            }
            Message::Data(_) => {
                return Err(CodecError::ParseError {
                    description: "unexpected data message from slow path".to_owned(),
                    pos: self.read_pos,
                });
            }
        };
        Ok(Some((len, msg)))
    }
}

/// Removes the `len`-byte message from the front of `src`, returning the body.
fn split_body(src: &mut BytesMut, len: usize, body_range: Option<std::ops::Range<usize>>) -> Bytes {
    match body_range {
        Some(r) => {
            let mut raw_msg = src.split_to(len);
            raw_msg.advance(r.start);
            raw_msg.truncate(r.len());
            raw_msg.freeze()
        }
        None => {
            src.advance(len);
            Bytes::new()
        }
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, msg)) = self.parse_msg(src)? else {
            return Ok(None);
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
                received: Instant::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<rtsp_types::Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(
        &mut self,
        item: rtsp_types::Message<Bytes>,
        mut dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .map_err(|e| CodecError::IoError(std::io::Error::other(format!("{e:?}"))))?;
        Ok(())
    }
}
