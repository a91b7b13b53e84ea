//! # Protocol Errors
//!
//! Failures that callers need to tell apart. Everything above the wire layer
//! carries these inside `anyhow::Error` and recovers them with
//! `downcast_ref` when the distinction matters.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket failure, short read, or expired deadline.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("message frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("expected message id {expected}, got {actual}")]
    UnexpectedMessage { expected: u8, actual: u8 },

    #[error("malformed {kind} payload of {len} bytes")]
    MalformedPayload { kind: &'static str, len: usize },

    #[error("expected piece {expected}, got piece {actual}")]
    PieceIndexMismatch { expected: u32, actual: u32 },

    #[error("block [{begin}:{end}] out of bounds for piece of {length} bytes")]
    BlockOutOfBounds {
        begin: usize,
        end: usize,
        length: usize,
    },

    #[error("invalid handshake length {0}")]
    InvalidHandshakeLength(usize),

    #[error("unexpected protocol string {0:?}")]
    UnexpectedProtocol(String),

    #[error("info hash mismatch in handshake")]
    InfoHashMismatch,

    /// Downloaded bytes do not hash to the expected digest.
    #[error("piece {0} failed integrity check")]
    HashMismatch(u32),

    #[error("compact peer list of {0} bytes is not a multiple of 6")]
    MalformedPeers(usize),

    #[error("piece hash list of {0} bytes is not a multiple of 20")]
    MalformedPieceHashes(usize),
}

impl ProtocolError {
    /// Returns `true` if the error came from the socket rather than the peer's data.
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}
