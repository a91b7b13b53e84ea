//! Simulated peers for tests.
//!
//! Each simulated peer is a thread serving the peer wire protocol on a
//! loopback listener, so connection, worker and download logic run against
//! real sockets.

use crate::bitfield::Bitfield;
use crate::handshake::Handshake;
use crate::message::*;
use crate::peer::Peer;
use crate::piece::{hash_piece, PieceWork};
use crate::{InfoHash, PeerId};

use std::collections::HashSet;
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

pub const INFO_HASH: InfoHash = [7; 20];
pub const CLIENT_ID: PeerId = *b"-RV0100-testclient00";
pub const REMOTE_ID: PeerId = *b"-SIM001-remotepeer00";

/// Piece count for tests that do not build a full torrent.
pub const NB_PIECES: u32 = 64;

/// Listens on loopback, answers the client's handshake with `info_hash`
/// and hands the stream to `serve`.
pub fn spawn_peer<F>(info_hash: InfoHash, serve: F) -> (Peer, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        Handshake::read(&mut stream).unwrap();
        stream
            .write_all(&Handshake::new(info_hash, REMOTE_ID).serialize())
            .unwrap();
        serve(stream);
    });

    (Peer::new(Ipv4Addr::LOCALHOST, port), handle)
}

pub fn send(stream: &mut TcpStream, message: Option<&Message>) {
    stream.write_all(&serialize(message)).unwrap();
}

/// Deterministic content for a test torrent.
pub fn content(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i * 31 % 251) as u8).collect()
}

/// Splits `content` into work items the way a torrent would.
pub fn work_items(content: &[u8], piece_length: usize) -> Vec<PieceWork> {
    content
        .chunks(piece_length)
        .enumerate()
        .map(|(index, piece)| PieceWork::new(index as u32, hash_piece(piece), piece.len() as u32))
        .collect()
}

/// A peer that serves block requests for a complete copy of the content.
#[derive(Clone)]
pub struct Seeder {
    content: Vec<u8>,
    piece_length: usize,
    /// Pieces advertised in the initial bitfield
    bitfield: Bitfield,
    /// Pieces served with every byte flipped
    corrupt: HashSet<u32>,
    /// Pieces announced with HAVE right after UNCHOKE
    announce: Vec<u32>,
    /// Close the connection after this many HAVE messages
    hang_up_after: Option<usize>,
}

impl Seeder {
    pub fn new(content: Vec<u8>, piece_length: usize) -> Seeder {
        let nb_pieces = content.len().div_ceil(piece_length);
        let mut bitfield = Bitfield::new();
        for index in 0..nb_pieces {
            bitfield.set_piece(index as u32);
        }

        Seeder {
            content,
            piece_length,
            bitfield,
            corrupt: HashSet::new(),
            announce: Vec::new(),
            hang_up_after: None,
        }
    }

    pub fn with_bitfield(mut self, bitfield: Bitfield) -> Seeder {
        self.bitfield = bitfield;
        self
    }

    pub fn corrupting(mut self, index: u32) -> Seeder {
        self.corrupt.insert(index);
        self
    }

    /// Sends HAVE for `index` once the session is set up, as a peer that
    /// just finished the piece would.
    pub fn announcing(mut self, index: u32) -> Seeder {
        self.announce.push(index);
        self
    }

    pub fn hang_up_after(mut self, haves: usize) -> Seeder {
        self.hang_up_after = Some(haves);
        self
    }

    pub fn spawn(self, info_hash: InfoHash) -> (Peer, JoinHandle<()>) {
        spawn_peer(info_hash, move |stream| self.serve(stream))
    }

    /// Sends BITFIELD, UNCHOKE and any announced HAVEs, then answers
    /// requests until the client goes away.
    pub fn serve(self, mut stream: TcpStream) {
        send(&mut stream, Some(&format_bitfield(&self.bitfield)));
        send(&mut stream, Some(&Message::new(MESSAGE_UNCHOKE)));
        for index in &self.announce {
            send(&mut stream, Some(&format_have(*index)));
        }

        let mut haves = 0;
        loop {
            let message = match read_message(&mut stream) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(_) => return,
            };

            match message.id {
                MESSAGE_REQUEST => {
                    let (index, begin, length) = parse_request(&message).unwrap();
                    let start = index as usize * self.piece_length + begin as usize;
                    let mut block = self.content[start..start + length as usize].to_vec();
                    if self.corrupt.contains(&index) {
                        block.iter_mut().for_each(|b| *b = !*b);
                    }
                    if stream
                        .write_all(&format_piece(index, begin, &block).serialize())
                        .is_err()
                    {
                        return;
                    }
                }
                MESSAGE_HAVE => {
                    haves += 1;
                    if self.hang_up_after == Some(haves) {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}
