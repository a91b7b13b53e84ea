//! # BitTorrent Peer Client
//!
//! One TCP connection to one remote peer, from handshake to close.
//!
//! ## Protocol Overview
//!
//! 1. **Handshake**: Protocol negotiation and info hash check
//! 2. **Bitfield**: The peer usually announces which pieces it has
//! 3. **Choke/Unchoke**: The peer decides when it will serve our requests
//! 4. **Requests/Pieces**: Blocks of data are requested and received
//!
//! ## Connection State
//!
//! [`PeerState`] holds what we know about the remote side: whether it is
//! choking us and which pieces it has. It changes only through
//! [`PeerState::apply`], so download logic can be exercised with synthetic
//! message sequences.
//!
//! ## Failure Model
//!
//! Any I/O error is terminal for the connection. There is no reconnect: the
//! worker gives its piece back to the queue and exits.

use crate::bitfield::Bitfield;
use crate::error::ProtocolError;
use crate::handshake::Handshake;
use crate::message::*;
use crate::peer::Peer;
use crate::{InfoHash, PeerId};

use anyhow::{Context, Result};

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// Time allowed to open the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Time allowed for the handshake and the initial bitfield.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// What we know about the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    /// Whether the peer is choking us
    pub choked: bool,
    /// Pieces the peer has announced
    pub bitfield: Bitfield,
    /// Number of pieces in the torrent; HAVE indices at or past it are ignored
    nb_pieces: u32,
}

impl PeerState {
    /// Creates the state of a fresh connection: choked, no pieces known.
    ///
    /// # Arguments
    ///
    /// * `nb_pieces` - Number of pieces in the torrent, used to bound HAVE
    ///   indices so a peer cannot make the bitfield grow without limit
    pub fn new(nb_pieces: u32) -> Self {
        PeerState {
            choked: true,
            bitfield: Bitfield::new(),
            nb_pieces,
        }
    }

    /// Applies a state-changing message from the peer.
    ///
    /// CHOKE, UNCHOKE, HAVE and BITFIELD are transitions; every other message
    /// leaves the state unchanged. A HAVE for a piece the torrent does not
    /// have is dropped.
    pub fn apply(&mut self, message: &Message) -> Result<(), ProtocolError> {
        match message.id {
            MESSAGE_CHOKE => self.choked = true,
            MESSAGE_UNCHOKE => self.choked = false,
            MESSAGE_HAVE => {
                let index = parse_have(message)?;
                if index < self.nb_pieces {
                    self.bitfield.set_piece(index);
                } else {
                    debug!(
                        "Ignoring HAVE for piece {}, torrent has {} pieces",
                        index, self.nb_pieces
                    );
                }
            }
            MESSAGE_BITFIELD => self.bitfield = Bitfield::from(message.payload.clone()),
            _ => {}
        }
        Ok(())
    }
}

/// Socket view that enforces an absolute deadline on every read and write.
struct Deadlined<'a> {
    conn: &'a TcpStream,
    deadline: Option<Instant>,
}

impl Deadlined<'_> {
    fn arm(&self) -> io::Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
        }

        self.conn.set_read_timeout(Some(remaining))?;
        self.conn.set_write_timeout(Some(remaining))
    }
}

/// Socket timeouts surface as `WouldBlock` on some platforms.
fn timed_out(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
    } else {
        err
    }
}

impl Read for Deadlined<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm()?;
        self.conn.read(buf).map_err(timed_out)
    }
}

impl Write for Deadlined<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm()?;
        self.conn.write(buf).map_err(timed_out)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

/// A live, handshaken connection to a remote peer.
pub struct Client {
    /// Address of the remote peer
    peer: Peer,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Remote choke state and bitfield
    state: PeerState,
    /// Absolute time after which socket operations fail
    deadline: Option<Instant>,
}

impl Client {
    /// Connects to `peer`, completes the handshake and reads its bitfield.
    ///
    /// The peer is expected to send BITFIELD first. If it sends something
    /// else, that message is applied to the state and the connection goes on
    /// with an empty bitfield.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - TCP connection cannot be established within [`CONNECT_TIMEOUT`]
    /// - Peer sends an invalid handshake (wrong protocol or info hash)
    /// - Handshake and first message take longer than [`HANDSHAKE_TIMEOUT`]
    pub fn connect(
        peer: Peer,
        peer_id: PeerId,
        info_hash: InfoHash,
        nb_pieces: u32,
    ) -> Result<Client> {
        let conn = TcpStream::connect_timeout(&peer.socket_addr(), CONNECT_TIMEOUT)
            .with_context(|| format!("could not connect to peer {}", peer))?;

        debug!("Connected to peer {}", peer);

        let mut client = Client {
            peer,
            conn,
            state: PeerState::new(nb_pieces),
            deadline: None,
        };

        client.set_deadline(Some(Instant::now() + HANDSHAKE_TIMEOUT))?;
        let setup = match client.handshake(peer_id, info_hash) {
            Ok(()) => client.receive_bitfield(),
            Err(e) => Err(e),
        };
        client.set_deadline(None)?;
        setup?;

        Ok(client)
    }

    fn handshake(&mut self, peer_id: PeerId, info_hash: InfoHash) -> Result<()> {
        let handshake = Handshake::new(info_hash, peer_id);
        self.stream()
            .write_all(&handshake.serialize())
            .with_context(|| format!("could not send handshake to peer {}", self.peer))?;

        let received = Handshake::read(&mut self.stream())
            .with_context(|| format!("could not read handshake from peer {}", self.peer))?;
        received
            .validate(&info_hash)
            .with_context(|| format!("invalid handshake from peer {}", self.peer))?;

        debug!("Completed handshake with peer {}", self.peer);

        Ok(())
    }

    fn receive_bitfield(&mut self) -> Result<()> {
        match self.read()? {
            Some(message) if message.id == MESSAGE_BITFIELD => {
                self.state.bitfield = Bitfield::from(message.payload);
                debug!(
                    "Peer {} has {} pieces",
                    self.peer,
                    self.state.bitfield.count()
                );
            }
            Some(message) => {
                debug!(
                    "Peer {} sent {} before any bitfield, assuming no pieces",
                    self.peer,
                    message.name()
                );
                self.state.apply(&message)?;
            }
            None => debug!("Peer {} sent no bitfield, assuming no pieces", self.peer),
        }
        Ok(())
    }

    fn stream(&self) -> Deadlined<'_> {
        Deadlined {
            conn: &self.conn,
            deadline: self.deadline,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PeerState {
        &mut self.state
    }

    /// Returns whether the peer is choking us.
    pub fn is_choked(&self) -> bool {
        self.state.choked
    }

    /// Checks if the peer has announced a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.state.bitfield.has_piece(index)
    }

    /// Sets an absolute deadline for all following socket operations.
    ///
    /// `None` clears it. An expired deadline makes reads and writes fail with
    /// [`io::ErrorKind::TimedOut`].
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline;
        if deadline.is_none() {
            self.conn.set_read_timeout(None)?;
            self.conn.set_write_timeout(None)?;
        }
        Ok(())
    }

    /// Waits up to `timeout` for the peer to send something, without
    /// consuming it.
    ///
    /// Returns `Ok(false)` if nothing arrived in time. A connection closed by
    /// the peer is an [`io::ErrorKind::UnexpectedEof`] error.
    pub fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut byte = [0u8; 1];

        self.conn.set_read_timeout(Some(timeout))?;
        let peeked = self.conn.peek(&mut byte);
        // Reads under a deadline re-arm their own timeout.
        self.conn.set_read_timeout(None)?;

        match peeked {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Blocks until the next message arrives. `None` is a keep-alive.
    pub fn read(&mut self) -> Result<Option<Message>, ProtocolError> {
        read_message(&mut self.stream())
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        self.stream()
            .write_all(&message.serialize())
            .with_context(|| format!("could not send {} to peer {}", message.name(), self.peer))
    }

    /// Tells the peer we will serve it. This client never uploads; the
    /// message is a courtesy.
    pub fn send_unchoke(&mut self) -> Result<()> {
        debug!("Send UNCHOKE to peer {}", self.peer);
        self.send(&Message::new(MESSAGE_UNCHOKE))
    }

    /// Tells the peer we want to download from it.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Send INTERESTED to peer {}", self.peer);
        self.send(&Message::new(MESSAGE_INTERESTED))
    }

    pub fn send_not_interested(&mut self) -> Result<()> {
        debug!("Send NOT_INTERESTED to peer {}", self.peer);
        self.send(&Message::new(MESSAGE_NOT_INTERESTED))
    }

    /// Announces that we now have a verified piece.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        debug!("Send HAVE {} to peer {}", index, self.peer);
        self.send(&format_have(index))
    }

    /// Asks the peer for `length` bytes at `begin` within piece `index`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        trace!(
            "Send REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send(&format_request(index, begin, length))
    }

    /// Withdraws an earlier request.
    pub fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        trace!(
            "Send CANCEL for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send(&format_cancel(index, begin, length))
    }
}
