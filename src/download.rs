//! # Download Coordination
//!
//! Spreads piece work over one worker thread per peer and assembles the
//! verified pieces into the final buffer.
//!
//! ## Threads and Channels
//!
//! ```text
//!              ┌──────── WorkQueue (take / put_back) ────────┐
//!              ▼                     ▼                       ▼
//!          worker(peer 0)       worker(peer 1)   ...    worker(peer n)
//!              │                     │                       │
//!              └──────────── results channel ────────────────┘
//!                                    ▼
//!                               aggregator
//! ```
//!
//! Pieces are never given up on. The aggregator waits until every piece has
//! been accepted once. If every worker has exited first, nothing can make
//! progress anymore and the download fails.

use crate::peer::Peer;
use crate::piece::*;
use crate::queue::{Shutdown, WorkQueue};
use crate::worker::Worker;
use crate::{InfoHash, PeerId, Sha1Hash};

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver};
use indicatif::{ProgressBar, ProgressStyle};

use std::thread;

/// A single-file download, ready to run against a set of peers.
pub struct Download {
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: InfoHash,
    /// 20-byte identifier of this client
    peer_id: PeerId,
    /// One digest per piece, in file order
    piece_hashes: Vec<Sha1Hash>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u64,
}

impl Download {
    /// Checks that the piece list covers `length` exactly.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    /// * `peer_id` - 20-byte identifier of this client
    /// * `piece_hashes` - One SHA-1 digest per piece, in file order
    /// * `piece_length` - Size of each piece in bytes (except possibly the last)
    /// * `length` - Total size of the file in bytes
    ///
    /// # Errors
    ///
    /// Fails if `piece_length` is zero or the number of digests does not
    /// match `length`.
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        piece_hashes: Vec<Sha1Hash>,
        piece_length: u32,
        length: u64,
    ) -> Result<Download> {
        if piece_length == 0 {
            bail!("piece length must not be zero");
        }

        let expected = length.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            bail!(
                "{} piece hashes for {} bytes in pieces of {} bytes, expected {}",
                piece_hashes.len(),
                length,
                piece_length,
                expected
            );
        }

        Ok(Download {
            info_hash,
            peer_id,
            piece_hashes,
            piece_length,
            length,
        })
    }

    /// Number of pieces in the torrent.
    pub fn nb_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece in the output.
    pub fn piece_bounds(&self, index: u32) -> (u64, u64) {
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.length);
        (begin, end)
    }

    /// Size in bytes of piece `index`.
    pub fn piece_length_at(&self, index: u32) -> u32 {
        let (begin, end) = self.piece_bounds(index);
        (end - begin) as u32
    }

    fn work_items(&self) -> Vec<PieceWork> {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let index = index as u32;
                PieceWork::new(index, *hash, self.piece_length_at(index))
            })
            .collect()
    }

    /// Downloads every piece from `peers` and returns the assembled file.
    ///
    /// # Errors
    ///
    /// Fails if a worker thread cannot be spawned, or if every worker has
    /// exited while pieces are still missing.
    pub fn run(&self, peers: &[Peer]) -> Result<Vec<u8>> {
        let (queue, shutdown, results) = self.spawn_workers(peers)?;
        let data = self.collect(&queue, results);
        shutdown.close();
        data
    }

    /// Seeds the queue and starts one worker thread per peer.
    ///
    /// The returned channel yields every piece any worker verified and
    /// disconnects once the last worker has exited.
    fn spawn_workers(
        &self,
        peers: &[Peer],
    ) -> Result<(WorkQueue, Shutdown, Receiver<PieceResult>)> {
        let (queue, shutdown) = WorkQueue::new(self.work_items());
        let (results_tx, results_rx) = unbounded();

        for peer in peers {
            let worker = Worker::new(
                *peer,
                self.peer_id,
                self.info_hash,
                self.nb_pieces() as u32,
                queue.clone(),
                results_tx.clone(),
            );

            thread::Builder::new()
                .name(format!("peer {}", peer))
                .spawn(move || worker.run())?;
        }

        // Only workers hold senders now, so the channel closes when the last
        // one exits.
        drop(results_tx);

        Ok((queue, shutdown, results_rx))
    }

    fn collect(&self, queue: &WorkQueue, results: Receiver<PieceResult>) -> Result<Vec<u8>> {
        let pb = ProgressBar::new(self.length);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
                .progress_chars("#>-"),
        );

        let mut assembler = Assembler::new(self);
        while !assembler.is_complete() {
            let result = results.recv().map_err(|_| {
                anyhow!(
                    "no peer left to download from, {} of {} pieces missing",
                    assembler.missing(),
                    self.nb_pieces()
                )
            })?;

            let len = result.data.len() as u64;
            let index = result.index;
            if assembler.accept(result) {
                queue.resolve();
                pb.inc(len);
                debug!(
                    "Accepted piece #{}, {} to go",
                    index,
                    assembler.missing()
                );
            }
        }

        pb.finish();

        Ok(assembler.into_data())
    }
}

/// Writes each piece into the output exactly once.
pub struct Assembler<'a> {
    download: &'a Download,
    data: Vec<u8>,
    received: Vec<bool>,
    missing: usize,
}

impl<'a> Assembler<'a> {
    /// Creates an empty output buffer of the full file length.
    pub fn new(download: &'a Download) -> Assembler<'a> {
        Assembler {
            download,
            data: vec![0; download.length as usize],
            received: vec![false; download.nb_pieces()],
            missing: download.nb_pieces(),
        }
    }

    /// Copies a verified piece into place.
    ///
    /// Returns `false`, leaving the output untouched, for a piece that was
    /// already accepted or that does not fit its slot.
    pub fn accept(&mut self, result: PieceResult) -> bool {
        let index = result.index as usize;
        match self.received.get(index) {
            None => {
                warn!("Ignoring unknown piece #{}", result.index);
                return false;
            }
            Some(true) => {
                debug!("Ignoring duplicate piece #{}", result.index);
                return false;
            }
            Some(false) => {}
        }

        let (begin, end) = self.download.piece_bounds(result.index);
        if result.data.len() as u64 != end - begin {
            warn!(
                "Ignoring piece #{} of {} bytes, expected {}",
                result.index,
                result.data.len(),
                end - begin
            );
            return false;
        }

        self.data[begin as usize..end as usize].copy_from_slice(&result.data);
        self.received[index] = true;
        self.missing -= 1;

        true
    }

    pub fn missing(&self) -> usize {
        self.missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::Bitfield;
    use crate::piece::hash_piece;
    use crate::sim::{content, spawn_peer, Seeder, CLIENT_ID, INFO_HASH};

    fn download_for(data: &[u8], piece_length: u32) -> Download {
        let hashes = data
            .chunks(piece_length as usize)
            .map(hash_piece)
            .collect();
        Download::new(INFO_HASH, CLIENT_ID, hashes, piece_length, data.len() as u64).unwrap()
    }

    #[test]
    fn piece_bounds_clamp_last_piece() {
        let download = download_for(&content(2500), 1000);

        assert_eq!(download.nb_pieces(), 3);
        assert_eq!(download.piece_bounds(0), (0, 1000));
        assert_eq!(download.piece_bounds(2), (2000, 2500));
        assert_eq!(download.piece_length_at(1), 1000);
        assert_eq!(download.piece_length_at(2), 500);
    }

    #[test]
    fn new_rejects_inconsistent_lengths() {
        assert!(Download::new(INFO_HASH, CLIENT_ID, vec![[0; 20]; 2], 1000, 2500).is_err());
        assert!(Download::new(INFO_HASH, CLIENT_ID, vec![[0; 20]; 3], 0, 2500).is_err());
        assert!(Download::new(INFO_HASH, CLIENT_ID, vec![[0; 20]; 3], 1000, 2500).is_ok());
    }

    #[test]
    fn assembler_accepts_each_piece_once() {
        let data = content(2500);
        let download = download_for(&data, 1000);
        let mut assembler = Assembler::new(&download);

        assert!(assembler.accept(PieceResult::new(2, data[2000..].to_vec())));
        assert!(assembler.accept(PieceResult::new(0, data[..1000].to_vec())));
        assert!(!assembler.accept(PieceResult::new(0, vec![0xff; 1000])));
        assert!(!assembler.accept(PieceResult::new(7, vec![0; 1000])));
        assert!(!assembler.accept(PieceResult::new(1, vec![0; 10])));
        assert_eq!(assembler.missing(), 1);

        assert!(assembler.accept(PieceResult::new(1, data[1000..2000].to_vec())));
        assert!(assembler.is_complete());
        assert_eq!(assembler.into_data(), data);
    }

    #[test]
    fn downloads_from_single_seeder() -> Result<()> {
        let data = content(2 * 20000 + 1234);
        let download = download_for(&data, 20000);
        let (peer, _seeder) = Seeder::new(data.clone(), 20000).spawn(INFO_HASH);

        assert_eq!(download.run(&[peer])?, data);
        Ok(())
    }

    #[test]
    fn peer_leaving_after_first_piece_delivers_it_once() -> Result<()> {
        let data = content(3 * 20000);
        let download = download_for(&data, 20000);
        let (flaky, flaky_handle) = Seeder::new(data.clone(), 20000)
            .with_bitfield(Bitfield::from(vec![0b1000_0000]))
            .hang_up_after(1)
            .spawn(INFO_HASH);
        let (steady, _steady_handle) = Seeder::new(data.clone(), 20000)
            .with_bitfield(Bitfield::from(vec![0b0110_0000]))
            .spawn(INFO_HASH);

        let (queue, shutdown, results) = download.spawn_workers(&[flaky, steady])?;
        let mut assembler = Assembler::new(&download);
        let mut received = vec![0; download.nb_pieces()];
        while !assembler.is_complete() {
            let result = results.recv()?;
            received[result.index as usize] += 1;
            if assembler.accept(result) {
                queue.resolve();
            }
        }
        shutdown.close();

        // The flaky peer only returns after our HAVE for piece 0.
        flaky_handle.join().unwrap();

        // Nothing else arrives once every worker has exited.
        assert_eq!(results.iter().count(), 0);
        assert_eq!(received, vec![1, 1, 1]);
        assert_eq!(queue.unresolved(), 0);
        assert_eq!(assembler.into_data(), data);
        Ok(())
    }

    #[test]
    fn idle_peer_picks_up_announced_pieces() -> Result<()> {
        let data = content(3 * 10000);
        let download = download_for(&data, 10000);
        let (late, _late_handle) = Seeder::new(data.clone(), 10000)
            .with_bitfield(Bitfield::new())
            .announcing(2)
            .announcing(0)
            .announcing(1)
            .spawn(INFO_HASH);

        assert_eq!(download.run(&[late])?, data);
        Ok(())
    }

    #[test]
    fn corrupt_pieces_are_fetched_elsewhere() -> Result<()> {
        let data = content(4 * 10000);
        let download = download_for(&data, 10000);
        let (liar, _liar_handle) = Seeder::new(data.clone(), 10000)
            .corrupting(1)
            .corrupting(3)
            .spawn(INFO_HASH);
        let (honest, _honest_handle) = Seeder::new(data.clone(), 10000).spawn(INFO_HASH);

        assert_eq!(download.run(&[liar, honest])?, data);
        Ok(())
    }

    #[test]
    fn peer_without_pieces_does_not_block_completion() -> Result<()> {
        let data = content(3 * 10000);
        let download = download_for(&data, 10000);
        let (empty, _empty_handle) = Seeder::new(data.clone(), 10000)
            .with_bitfield(Bitfield::new())
            .spawn(INFO_HASH);
        let (seeder, _seeder_handle) = Seeder::new(data.clone(), 10000).spawn(INFO_HASH);

        assert_eq!(download.run(&[empty, seeder])?, data);
        Ok(())
    }

    #[test]
    fn fails_when_no_peer_is_left() {
        let data = content(3 * 10000);
        let download = download_for(&data, 10000);

        assert!(download.run(&[]).is_err());

        let (quitter, handle) = spawn_peer(INFO_HASH, |_| {});
        assert!(download.run(&[quitter]).is_err());
        handle.join().unwrap();
    }
}
