//! # BitTorrent Worker Thread
//!
//! Each worker owns the connection to one peer and downloads pieces from it,
//! one at a time, until the queue shuts down or the connection breaks.
//!
//! ## Work Loop
//!
//! 1. **Connect**: TCP connect, handshake, bitfield. On failure the worker
//!    exits; it has not taken any work yet.
//! 2. **Announce**: Send UNCHOKE (courtesy, we never upload) and INTERESTED
//! 3. **Claim**: Take a piece the peer has, putting back the ones it lacks.
//!    If it has none of them, wait for it to announce more
//! 4. **Download**: Pipelined block requests under a per-piece deadline
//! 5. **Verify**: SHA-1 against the metainfo digest
//! 6. **Publish**: Send HAVE to the peer and the piece to the aggregator
//!
//! ## Failure Handling
//!
//! | Failure | Piece | Connection |
//! |---------|-------|------------|
//! | Peer lacks piece | put back | kept |
//! | Peer lacks every waiting piece | put back | kept, idle until it speaks |
//! | Hash mismatch | put back | kept |
//! | I/O or protocol error | put back | dropped, worker exits |

use crate::client::{Client, PeerState};
use crate::peer::Peer;
use crate::piece::*;
use crate::queue::WorkQueue;
use crate::{InfoHash, PeerId};

use anyhow::Result;
use crossbeam_channel::Sender;

use std::time::{Duration, Instant};

/// How long a worker with nothing to download waits for its peer to speak.
pub const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Time allowed to read a message once it has started to arrive.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of trying to claim work for a peer.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// A piece the peer has, checked out to this worker
    Work(PieceWork),
    /// Every waiting piece was tried and the peer has none of them
    Unavailable,
    /// The download is over
    Shutdown,
}

/// What happened to one piece.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Verified and published
    Completed,
    /// Downloaded but failed verification; put back, connection kept
    Corrupt,
    /// Download failed; put back, connection presumed broken
    Failed,
    /// Nobody is collecting results anymore
    Closed,
}

/// Downloads from a single peer.
pub struct Worker {
    /// Remote peer address
    peer: Peer,
    /// 20-byte identifier of this client
    peer_id: PeerId,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: InfoHash,
    /// Number of pieces in the torrent
    nb_pieces: u32,
    /// Pieces still to download
    queue: WorkQueue,
    /// Verified pieces, to the aggregator
    results: Sender<PieceResult>,
}

impl Worker {
    /// Creates a worker for one peer. Nothing happens until [`Worker::run`].
    ///
    /// # Arguments
    ///
    /// * `peer` - Address of the remote peer
    /// * `peer_id` - 20-byte identifier of this client
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    /// * `nb_pieces` - Number of pieces in the torrent
    /// * `queue` - Shared queue of pieces still to download
    /// * `results` - Channel the verified pieces are sent on
    pub fn new(
        peer: Peer,
        peer_id: PeerId,
        info_hash: InfoHash,
        nb_pieces: u32,
        queue: WorkQueue,
        results: Sender<PieceResult>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            nb_pieces,
            queue,
            results,
        }
    }

    /// Runs the worker until the queue shuts down or the connection fails.
    pub fn run(self) {
        let mut client = match Client::connect(
            self.peer,
            self.peer_id,
            self.info_hash,
            self.nb_pieces,
        ) {
            Ok(client) => client,
            Err(e) => {
                info!("Could not handshake with {}: {:#}. Disconnecting", self.peer, e);
                return;
            }
        };

        info!("Completed handshake with {}", self.peer);

        if let Err(e) = client.send_unchoke() {
            warn!("Dropping peer {}: {:#}", self.peer, e);
            return;
        }
        if let Err(e) = client.send_interested() {
            warn!("Dropping peer {}: {:#}", self.peer, e);
            return;
        }

        loop {
            let work = match self.claim(client.state()) {
                Claim::Work(work) => work,
                Claim::Unavailable => {
                    if let Err(e) = self.idle(&mut client) {
                        info!("Dropping idle peer {}: {:#}", self.peer, e);
                        return;
                    }
                    continue;
                }
                Claim::Shutdown => {
                    debug!("Worker for peer {} exiting: download complete", self.peer);
                    return;
                }
            };

            match self.process(&mut client, work) {
                Outcome::Completed | Outcome::Corrupt => continue,
                Outcome::Failed | Outcome::Closed => return,
            }
        }
    }

    /// Takes the next piece the peer has.
    ///
    /// Pieces the peer lacks go straight back to the queue. After one full
    /// pass over the waiting pieces without a match the worker is told to
    /// try again later instead of spinning here.
    pub fn claim(&self, state: &PeerState) -> Claim {
        let mut skipped = 0;
        loop {
            let Some(work) = self.queue.take() else {
                return Claim::Shutdown;
            };

            if state.bitfield.has_piece(work.index) {
                return Claim::Work(work);
            }

            self.queue.put_back(work);
            skipped += 1;
            if skipped >= self.queue.len() {
                return Claim::Unavailable;
            }
        }
    }

    /// Waits up to [`IDLE_WAIT`] for the peer to send a message and applies it.
    ///
    /// This is how a worker whose peer has none of the waiting pieces learns
    /// about new ones. A message is only read once it has started to arrive,
    /// so a quiet peer never leaves a frame half read.
    fn idle(&self, client: &mut Client) -> Result<()> {
        if !client.wait_readable(IDLE_WAIT)? {
            return Ok(());
        }

        client.set_deadline(Some(Instant::now() + MESSAGE_TIMEOUT))?;
        let message = client.read();
        client.set_deadline(None)?;

        if let Some(message) = message? {
            trace!("Peer {} sent {} while idle", self.peer, message.name());
            client.state_mut().apply(&message)?;
        }

        Ok(())
    }

    /// Downloads, verifies and publishes one checked-out piece.
    pub fn process(&self, client: &mut Client, work: PieceWork) -> Outcome {
        let data = match attempt_download_piece(client, &work) {
            Ok(data) => data,
            Err(e) => {
                warn!("Exiting worker for peer {}: {:#}", self.peer, e);
                self.queue.put_back(work);
                return Outcome::Failed;
            }
        };

        if let Err(e) = check_integrity(&work, &data) {
            warn!("Peer {}: {}", self.peer, e);
            self.queue.put_back(work);
            return Outcome::Corrupt;
        }

        // Courtesy only; a broken connection shows up on the next piece.
        if let Err(e) = client.send_have(work.index) {
            debug!("{:#}", e);
        }

        if self
            .results
            .send(PieceResult::new(work.index, data))
            .is_err()
        {
            debug!("Worker for peer {} exiting: results closed", self.peer);
            return Outcome::Closed;
        }

        Outcome::Completed
    }
}
