// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, PacketContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages: in most cases they
/// carry enough context to find the offending packet in a capture. Callers
/// that need to branch on the failure can use [`Error::kind`].
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInt::InvalidArgument(_) | ErrorInt::FailedPrecondition(_) => {
                ErrorKind::InvalidArgument
            }
            ErrorInt::ConnectError(_)
            | ErrorInt::RtspReadError { .. }
            | ErrorInt::WriteError { .. }
            | ErrorInt::Timeout { .. } => ErrorKind::Connection,
            ErrorInt::RtspFramingError { .. } | ErrorInt::RtspResponseError { .. } => {
                ErrorKind::Protocol
            }
            ErrorInt::SdpError { .. } => ErrorKind::Sdp,
            ErrorInt::RtpPacketError { .. } => ErrorKind::Rtp,
            ErrorInt::DepacketizationError { .. } => ErrorKind::Depacketization,
            ErrorInt::BitstreamError(_) => ErrorKind::Bitstream,
            ErrorInt::PocError(_) => ErrorKind::Poc,
            ErrorInt::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Broad category of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// TCP connect, read, write, or timeout failure. Fatal to the session.
    Connection,

    /// Malformed RTSP message or non-success RTSP status. Fatal to the session.
    Protocol,

    /// Unusable session description.
    Sdp,

    /// Malformed RTP packet. The packet is dropped.
    Rtp,

    /// Invalid payload structure. The in-progress unit is dropped.
    Depacketization,

    /// Malformed or missing parameter set or slice header. The access unit is
    /// dropped.
    Bitstream,

    /// Picture order count couldn't be computed. The access unit is dropped.
    Poc,

    /// The caller supplied an invalid argument or called out of order.
    InvalidArgument,

    /// A bug or unexpected runtime failure.
    Internal,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {status} response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Unusable SDP: {description}")]
    SdpError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error(
        "[{conn_ctx}, {pkt_ctx}, stream={stream_id}, ssrc={ssrc:08x}, \
         seq={sequence_number:04x}] {description}"
    )]
    RtpPacketError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        stream_id: usize,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("[{conn_ctx}, {pkt_ctx}, stream={stream_id}] {description}")]
    DepacketizationError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        stream_id: usize,
        description: String,
    },

    #[error("Bitstream error: {0}")]
    BitstreamError(String),

    #[error("Picture order count error: {0}")]
    PocError(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("[{conn_ctx}] Timeout: {description}")]
    Timeout {
        conn_ctx: ConnectionContext,
        description: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let e = wrap!(ErrorInt::BitstreamError("missing SPS".to_owned()));
        assert_eq!(e.kind(), ErrorKind::Bitstream);
        assert_eq!(e.to_string(), "Bitstream error: missing SPS");
        let e = wrap!(ErrorInt::Timeout {
            conn_ctx: ConnectionContext::dummy(),
            description: "no data".to_owned(),
        });
        assert_eq!(e.kind(), ErrorKind::Connection);
        let e = wrap!(ErrorInt::FailedPrecondition("PLAY before SETUP".to_owned()));
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }
}
