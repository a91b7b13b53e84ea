//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and serialization for the BitTorrent
//! peer wire protocol. All communication after the handshake uses these messages.
//!
//! ## Message Structure
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Total length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | bitfield bytes |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |
//!
//! ## Keep-Alive Messages
//!
//! A frame with length 0 has no ID or payload. It is represented as `None`
//! on both the read and the write side.

use crate::bitfield::Bitfield;
use crate::error::ProtocolError;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Cursor, Read};

pub type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// Largest frame accepted from a peer. A 16 KiB block or a bitfield for
/// millions of pieces fits comfortably.
pub const MAX_MESSAGE_LEN: usize = 1 << 21;

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message into a length-prefixed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized.extend_from_slice(&(message_len as u32).to_be_bytes());
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        serialized
    }

    /// Human-readable message name, for logs.
    pub fn name(&self) -> &'static str {
        match self.id {
            MESSAGE_CHOKE => "CHOKE",
            MESSAGE_UNCHOKE => "UNCHOKE",
            MESSAGE_INTERESTED => "INTERESTED",
            MESSAGE_NOT_INTERESTED => "NOT_INTERESTED",
            MESSAGE_HAVE => "HAVE",
            MESSAGE_BITFIELD => "BITFIELD",
            MESSAGE_REQUEST => "REQUEST",
            MESSAGE_PIECE => "PIECE",
            MESSAGE_CANCEL => "CANCEL",
            _ => "UNKNOWN",
        }
    }
}

/// Serialize an optional message; `None` is the keep-alive frame.
pub fn serialize(message: Option<&Message>) -> Vec<u8> {
    match message {
        Some(message) => message.serialize(),
        None => vec![0; 4],
    }
}

/// Read exactly one frame from `reader`.
///
/// Returns `Ok(None)` for a keep-alive. A stream that ends inside a frame is
/// an I/O error.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let message_len = reader.read_u32::<BigEndian>()? as usize;

    if message_len == 0 {
        return Ok(None);
    }
    if message_len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::FrameTooLarge(message_len));
    }

    let mut message_buf: Vec<u8> = vec![0; message_len];
    reader.read_exact(&mut message_buf)?;

    let id = message_buf[0];
    let payload = message_buf.split_off(1);

    Ok(Some(Message::new_with_payload(id, payload)))
}

fn index_begin_length(id: MessageId, index: u32, begin: u32, length: u32) -> Message {
    let mut payload: Vec<u8> = Vec::with_capacity(12);
    // Writing into a Vec cannot fail.
    let _ = payload.write_u32::<BigEndian>(index);
    let _ = payload.write_u32::<BigEndian>(begin);
    let _ = payload.write_u32::<BigEndian>(length);
    Message::new_with_payload(id, payload)
}

/// Build a REQUEST for `length` bytes at `begin` within piece `index`.
pub fn format_request(index: u32, begin: u32, length: u32) -> Message {
    index_begin_length(MESSAGE_REQUEST, index, begin, length)
}

/// Build a CANCEL matching an earlier REQUEST.
pub fn format_cancel(index: u32, begin: u32, length: u32) -> Message {
    index_begin_length(MESSAGE_CANCEL, index, begin, length)
}

/// Build a HAVE announcing piece `index`.
pub fn format_have(index: u32) -> Message {
    Message::new_with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec())
}

/// Build a BITFIELD from a piece set.
///
/// The payload is the raw bitfield bytes, MSB first, without padding beyond
/// what the bitfield stores.
pub fn format_bitfield(bitfield: &Bitfield) -> Message {
    Message::new_with_payload(MESSAGE_BITFIELD, bitfield.as_bytes().to_vec())
}

/// Build a PIECE carrying `block` at `begin` within piece `index`.
pub fn format_piece(index: u32, begin: u32, block: &[u8]) -> Message {
    let mut payload: Vec<u8> = Vec::with_capacity(8 + block.len());
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(block);
    Message::new_with_payload(MESSAGE_PIECE, payload)
}

fn expect_id(message: &Message, expected: MessageId) -> Result<(), ProtocolError> {
    if message.id != expected {
        return Err(ProtocolError::UnexpectedMessage {
            expected,
            actual: message.id,
        });
    }
    Ok(())
}

/// Extract the piece index from a HAVE.
pub fn parse_have(message: &Message) -> Result<u32, ProtocolError> {
    expect_id(message, MESSAGE_HAVE)?;
    if message.payload.len() != 4 {
        return Err(ProtocolError::MalformedPayload {
            kind: "HAVE",
            len: message.payload.len(),
        });
    }

    let index = Cursor::new(&message.payload).read_u32::<BigEndian>()?;
    Ok(index)
}

/// Extract `(index, begin, length)` from a REQUEST or CANCEL.
pub fn parse_request(message: &Message) -> Result<(u32, u32, u32), ProtocolError> {
    if message.id != MESSAGE_REQUEST && message.id != MESSAGE_CANCEL {
        return Err(ProtocolError::UnexpectedMessage {
            expected: MESSAGE_REQUEST,
            actual: message.id,
        });
    }
    if message.payload.len() != 12 {
        return Err(ProtocolError::MalformedPayload {
            kind: message.name(),
            len: message.payload.len(),
        });
    }

    let mut cursor = Cursor::new(&message.payload);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()?;

    Ok((index, begin, length))
}

/// Copy the block carried by a PIECE into `buf`.
///
/// The message must belong to piece `index` and the block must fit inside
/// `buf`; nothing is written otherwise. Returns the number of bytes copied.
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<usize, ProtocolError> {
    expect_id(message, MESSAGE_PIECE)?;
    if message.payload.len() < 8 {
        return Err(ProtocolError::MalformedPayload {
            kind: "PIECE",
            len: message.payload.len(),
        });
    }

    let mut cursor = Cursor::new(&message.payload[0..8]);
    let parsed_index = cursor.read_u32::<BigEndian>()?;
    if parsed_index != index {
        return Err(ProtocolError::PieceIndexMismatch {
            expected: index,
            actual: parsed_index,
        });
    }

    let begin = cursor.read_u32::<BigEndian>()? as usize;
    let block = &message.payload[8..];
    let end = begin + block.len();
    if begin >= buf.len() || end > buf.len() {
        return Err(ProtocolError::BlockOutOfBounds {
            begin,
            end,
            length: buf.len(),
        });
    }

    buf[begin..end].copy_from_slice(block);

    Ok(block.len())
}
