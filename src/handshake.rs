//! # BitTorrent Handshake Protocol
//!
//! The first exchange on every peer connection. It confirms both sides speak
//! the BitTorrent protocol, are interested in the same torrent, and trades
//! peer identifiers.
//!
//! ## Message Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: Variable - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - Sent as zeros, accepted with any value
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Identifier of the sending peer
//!
//! Remote peers set reserved bits to advertise extensions this client does
//! not speak. Those bits are kept but never acted on.

use crate::error::ProtocolError;
use crate::{InfoHash, PeerId};

use std::io::Read;

pub const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Bytes following the protocol string: reserved + info hash + peer id.
const HANDSHAKE_TAIL_LEN: usize = 8 + 20 + 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// Extension bits, zero on our side
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new handshake for the standard BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake for network transmission.
    ///
    /// Total size is always 49 + pstrlen bytes (68 bytes for the standard protocol).
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(1 + self.pstr.len() + HANDSHAKE_TAIL_LEN);

        serialized.push(self.pstr.len() as u8);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }

    /// Reads a handshake from `reader`.
    ///
    /// The first byte gives the protocol string length; exactly that many
    /// bytes plus 48 follow. The protocol string is not checked here, see
    /// [`Handshake::validate`].
    pub fn read<R: Read>(reader: &mut R) -> Result<Handshake, ProtocolError> {
        let mut len_buf = [0; 1];
        reader.read_exact(&mut len_buf)?;

        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(ProtocolError::InvalidHandshakeLength(pstrlen));
        }

        let mut buf: Vec<u8> = vec![0; pstrlen + HANDSHAKE_TAIL_LEN];
        reader.read_exact(&mut buf)?;

        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        reserved.copy_from_slice(&buf[pstrlen..pstrlen + 8]);
        info_hash.copy_from_slice(&buf[pstrlen + 8..pstrlen + 28]);
        peer_id.copy_from_slice(&buf[pstrlen + 28..]);
        buf.truncate(pstrlen);

        Ok(Handshake {
            pstr: buf,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Checks a received handshake against the torrent we are downloading.
    pub fn validate(&self, expected_info_hash: &InfoHash) -> Result<(), ProtocolError> {
        if self.pstr != PROTOCOL_ID.as_bytes() {
            return Err(ProtocolError::UnexpectedProtocol(
                String::from_utf8_lossy(&self.pstr).into_owned(),
            ));
        }
        if &self.info_hash != expected_info_hash {
            return Err(ProtocolError::InfoHashMismatch);
        }
        Ok(())
    }
}
