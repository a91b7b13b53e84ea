//! # BitTorrent Peer Information
//!
//! Remote peer addresses, as handed out by trackers.
//!
//! ## Compact Peer Format
//!
//! Trackers answer `compact=1` announces with a string of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order.

use crate::error::ProtocolError;

use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

const PEER_SIZE: usize = 6;

/// A candidate peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    /// Creates a peer address.
    ///
    /// # Arguments
    ///
    /// * `ip` - IPv4 address of the peer
    /// * `port` - TCP port the peer listens on
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    /// Address to open a TCP connection to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses a compact peer list from a tracker response.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPeers`] if the length is not a multiple
/// of 6 bytes.
pub fn decode_compact_peers(tracker_peers: &[u8]) -> Result<Vec<Peer>, ProtocolError> {
    if tracker_peers.len() % PEER_SIZE != 0 {
        return Err(ProtocolError::MalformedPeers(tracker_peers.len()));
    }

    let mut peers = Vec::with_capacity(tracker_peers.len() / PEER_SIZE);
    for entry in tracker_peers.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = Cursor::new(&entry[4..6]).read_u16::<BigEndian>()?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}
