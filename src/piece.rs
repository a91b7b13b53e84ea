//! # BitTorrent Piece Download
//!
//! Pieces are the verification units of a torrent. Each one is fetched from a
//! single peer in blocks of at most 16 KiB, then hashed against the digest
//! from the metainfo.
//!
//! ## Request Pipeline
//!
//! Waiting for every block before asking for the next wastes a round trip per
//! block. Instead up to [`MAX_BACKLOG`] requests are kept in flight:
//!
//! ```text
//! requested ──────────────────────────►
//! [ downloaded ][ in flight (backlog) ][ not yet requested ]
//! 0                                                   length
//! ```
//!
//! A CHOKE stops new requests until the next UNCHOKE. Requests already sent
//! are left alone; if the peer never answers them the attempt runs into its
//! deadline and the piece goes back to the queue.

use crate::client::{Client, PeerState};
use crate::error::ProtocolError;
use crate::message::*;
use crate::Sha1Hash;

use anyhow::Result;
use sha1::{Digest, Sha1};

use std::time::{Duration, Instant};

/// Largest number of bytes a single request asks for.
pub const MAX_BLOCK_SIZE: u32 = 16384;

/// Number of unanswered requests kept in flight per peer.
pub const MAX_BACKLOG: u32 = 5;

/// Wall-clock budget for downloading one piece from one peer.
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(30);

/// A piece still to be downloaded.
///
/// Work items are handed out by the queue to one worker at a time and are
/// only consumed once their bytes pass [`check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// SHA-1 hash of the piece
    pub hash: Sha1Hash,
    /// Total length of the piece in bytes
    pub length: u32,
}

/// A downloaded and verified piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Piece bytes, already checked against the digest
    pub data: Vec<u8>,
}

impl PieceWork {
    /// Creates a work item for one piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index in the torrent
    /// * `hash` - SHA-1 digest the downloaded bytes must match
    /// * `length` - Size of the piece in bytes; only the last piece may be
    ///   shorter than the torrent's piece length
    pub fn new(index: u32, hash: Sha1Hash, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    /// Wraps verified piece bytes for the aggregator.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index in the torrent
    /// * `data` - Bytes that passed [`check_integrity`]
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}

/// One block request to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Progress of one attempt at one piece.
#[derive(Debug)]
pub struct PieceProgress {
    index: u32,
    buf: Vec<u8>,
    /// Bytes received and copied into `buf`
    downloaded: u32,
    /// Bytes asked for, received or not
    requested: u32,
    /// Requests sent but not yet answered
    backlog: u32,
}

impl PieceProgress {
    pub fn new(work: &PieceWork) -> PieceProgress {
        PieceProgress {
            index: work.index,
            buf: vec![0; work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }

    fn length(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.length()
    }

    /// Next block to request, if the pipeline has room.
    ///
    /// Nothing is requested while choked, once the backlog is full, or once
    /// the whole piece has been asked for.
    pub fn next_request(&mut self, state: &PeerState) -> Option<BlockRequest> {
        if state.choked || self.backlog >= MAX_BACKLOG || self.requested >= self.length() {
            return None;
        }

        // Last block might be shorter than the typical block
        let length = MAX_BLOCK_SIZE.min(self.length() - self.requested);
        let request = BlockRequest {
            index: self.index,
            begin: self.requested,
            length,
        };

        self.requested += length;
        self.backlog += 1;

        Some(request)
    }

    /// Applies one message read from the peer.
    ///
    /// PIECE blocks are copied into the buffer; state-changing messages go to
    /// `state`; keep-alives and anything else are ignored.
    pub fn handle(
        &mut self,
        state: &mut PeerState,
        message: Option<Message>,
    ) -> Result<(), ProtocolError> {
        let Some(message) = message else {
            return Ok(());
        };

        match message.id {
            MESSAGE_PIECE => {
                let n = parse_piece(self.index, &mut self.buf, &message)?;
                self.downloaded += n as u32;
                self.backlog = self.backlog.saturating_sub(1);
            }
            _ => state.apply(&message)?,
        }

        Ok(())
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}

/// Downloads one piece over `client`.
///
/// The attempt gets [`PIECE_TIMEOUT`] in total. The deadline is cleared
/// before returning, whatever the outcome, so it never carries over to the
/// next piece. Any error leaves nothing behind: partial data is dropped.
pub fn attempt_download_piece(client: &mut Client, work: &PieceWork) -> Result<Vec<u8>> {
    client.set_deadline(Some(Instant::now() + PIECE_TIMEOUT))?;
    let result = download(client, work);
    client.set_deadline(None)?;
    result
}

fn download(client: &mut Client, work: &PieceWork) -> Result<Vec<u8>> {
    let mut progress = PieceProgress::new(work);

    while !progress.is_complete() {
        while let Some(request) = progress.next_request(client.state()) {
            client.send_request(request.index, request.begin, request.length)?;
        }

        // this call blocks
        let message = client.read()?;
        if let Some(message) = &message {
            match message.id {
                MESSAGE_CHOKE => warn!("Peer {} choked us, waiting for unchoke", client.peer()),
                MESSAGE_UNCHOKE => debug!("Peer {} unchoked us", client.peer()),
                _ => {}
            }
        }
        progress.handle(client.state_mut(), message)?;
    }

    debug!(
        "Downloaded piece {} from peer {}",
        work.index,
        client.peer()
    );

    Ok(progress.into_data())
}

/// SHA-1 digest of `data`.
pub fn hash_piece(data: &[u8]) -> Sha1Hash {
    Sha1::digest(data).into()
}

/// Checks downloaded bytes against the expected digest.
///
/// A mismatch means the piece was corrupted or mis-delivered. It is not a
/// connection failure.
pub fn check_integrity(work: &PieceWork, buf: &[u8]) -> Result<(), ProtocolError> {
    if hash_piece(buf) != work.hash {
        return Err(ProtocolError::HashMismatch(work.index));
    }
    Ok(())
}
