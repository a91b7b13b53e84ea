//! # Torrent Metainfo
//!
//! Decodes a single-file `.torrent` into what the download needs.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Optional tiers of tracker URLs
//! - **info**: Dictionary with file information and piece hashes
//!   - **pieces**: Concatenated SHA-1 hashes for integrity verification
//!   - **piece length**: Size of each piece
//!   - **length**: Total file size
//!   - **name**: Suggested filename
//!
//! The info hash is the SHA-1 of the bencoded `info` dictionary as found in
//! the file, including keys this client does not use.

use crate::error::ProtocolError;
use crate::{InfoHash, Sha1Hash};

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use std::fs;
use std::path::Path;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// Metadata for a single-file torrent.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker URLs, deduplicated
    pub trackers: Vec<String>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    pub info_hash: InfoHash,
    /// One 20-byte SHA-1 hash per piece
    pub piece_hashes: Vec<Sha1Hash>,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// Total size of the file in bytes
    pub length: u64,
    /// Suggested filename from torrent metadata
    pub name: String,
}

#[derive(Deserialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes; multi-file torrents have none
    length: Option<u64>,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Kept raw so the info hash covers every key
    info: Value,
}

/// Split concatenated piece hashes into 20-byte digests.
fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<Sha1Hash>, ProtocolError> {
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(ProtocolError::MalformedPieceHashes(pieces.len()));
    }

    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Flatten announce tiers into one list of distinct URLs.
///
/// Each tier is shuffled, as BEP 12 asks, before tiers are concatenated.
fn collect_trackers(announce: String, mut announce_list: Vec<Vec<String>>) -> Vec<String> {
    let mut rng = rand::thread_rng();
    for tier in &mut announce_list {
        tier.shuffle(&mut rng);
    }

    let mut trackers: Vec<String> = Vec::new();
    let candidates = announce_list
        .into_iter()
        .flatten()
        .chain(std::iter::once(announce));
    for url in candidates {
        if !url.is_empty() && !trackers.contains(&url) {
            trackers.push(url);
        }
    }
    trackers
}

impl Torrent {
    /// Open and decode a torrent file.
    pub fn open<P: AsRef<Path>>(filepath: P) -> Result<Torrent> {
        let filepath = filepath.as_ref();
        let buf = fs::read(filepath)
            .with_context(|| format!("could not read torrent {}", filepath.display()))?;
        Torrent::from_bytes(&buf)
    }

    /// Decode bencoded torrent metadata.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let bencode = de::from_bytes::<BencodeTorrent>(buf).context("could not decode torrent")?;

        let info_bytes = ser::to_bytes(&bencode.info).context("could not encode torrent info")?;
        let info_hash: InfoHash = Sha1::digest(&info_bytes).into();

        let info =
            de::from_bytes::<BencodeInfo>(&info_bytes).context("could not decode torrent info")?;
        let Some(length) = info.length else {
            bail!("multi-file torrents are not supported");
        };

        let piece_hashes = split_piece_hashes(&info.pieces)?;

        let trackers = collect_trackers(bencode.announce, bencode.announce_list);
        if trackers.is_empty() {
            bail!("torrent has no announce or announce-list");
        }

        Ok(Torrent {
            trackers,
            info_hash,
            piece_hashes,
            piece_length: info.piece_length,
            length,
            name: info.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bstr(s: &[u8]) -> Vec<u8> {
        let mut out = format!("{}:", s.len()).into_bytes();
        out.extend_from_slice(s);
        out
    }

    fn info_dict(pieces: &[u8]) -> Vec<u8> {
        let mut info = b"d6:lengthi2500e4:name8:file.bin12:piece lengthi1000e".to_vec();
        info.extend(bstr(b"pieces"));
        info.extend(bstr(pieces));
        info.extend(bstr(b"private"));
        info.extend(b"i1e");
        info.push(b'e');
        info
    }

    fn torrent_file(announce_list: &[u8], info: &[u8]) -> Vec<u8> {
        let mut file = b"d8:announce".to_vec();
        file.extend(bstr(b"http://tracker.example/announce"));
        file.extend_from_slice(announce_list);
        file.extend(bstr(b"info"));
        file.extend_from_slice(info);
        file.push(b'e');
        file
    }

    fn piece_hashes() -> Vec<u8> {
        (0..60).map(|i| i as u8).collect()
    }

    #[test]
    fn decodes_single_file_torrent() {
        let info = info_dict(&piece_hashes());
        let torrent = Torrent::from_bytes(&torrent_file(b"", &info)).unwrap();

        let expected: InfoHash = Sha1::digest(&info).into();
        assert_eq!(torrent.info_hash, expected);
        assert_eq!(torrent.trackers, vec!["http://tracker.example/announce"]);
        assert_eq!(torrent.piece_length, 1000);
        assert_eq!(torrent.length, 2500);
        assert_eq!(torrent.name, "file.bin");
        assert_eq!(torrent.piece_hashes.len(), 3);
        assert_eq!(torrent.piece_hashes[1][0], 20);
        assert_eq!(torrent.piece_hashes[2][19], 59);
    }

    #[test]
    fn merges_announce_list() {
        let mut list = bstr(b"announce-list");
        list.extend(b"ll");
        list.extend(bstr(b"http://a.example/announce"));
        list.extend(bstr(b"http://tracker.example/announce"));
        list.extend(b"el");
        list.extend(bstr(b"http://b.example/announce"));
        list.extend(b"ee");

        let torrent =
            Torrent::from_bytes(&torrent_file(&list, &info_dict(&piece_hashes()))).unwrap();

        let mut trackers = torrent.trackers.clone();
        trackers.sort();
        assert_eq!(
            trackers,
            vec![
                "http://a.example/announce",
                "http://b.example/announce",
                "http://tracker.example/announce",
            ]
        );
        assert_eq!(torrent.trackers[2], "http://b.example/announce");
    }

    #[test]
    fn rejects_truncated_piece_hashes() {
        let info = info_dict(&piece_hashes()[..59]);

        let err = Torrent::from_bytes(&torrent_file(b"", &info)).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::MalformedPieceHashes(59))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Torrent::from_bytes(b"not a torrent").is_err());
    }
}
