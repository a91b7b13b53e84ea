//! # Tracker Announce
//!
//! Asks HTTP trackers for peers. Every tracker URL is announced to in
//! parallel and the answers are merged.
//!
//! ## Request
//!
//! ```text
//! GET <announce>?info_hash=..&peer_id=..&port=..&uploaded=0&downloaded=0&compact=1&left=..
//! ```
//!
//! ## Response
//!
//! A bencoded dictionary with a refresh `interval` and a compact `peers`
//! string, or a `failure reason`.

use crate::peer::{decode_compact_peers, Peer};
use crate::{InfoHash, PeerId};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::form_urlencoded::byte_serialize;
use url::Url;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

/// Time allowed for one tracker to answer.
pub const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct BencodeTracker {
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: u32,
    // Compact peers list
    #[serde(default)]
    peers: Option<ByteBuf>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

/// Builds the announce URL for one tracker.
///
/// Binary values are percent-encoded byte by byte.
pub fn build_tracker_url(
    announce: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<String> {
    let mut url =
        Url::parse(announce).with_context(|| format!("could not parse tracker url {}", announce))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
        byte_serialize(info_hash).collect::<String>(),
        byte_serialize(peer_id).collect::<String>(),
        port,
        left
    );

    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, query),
        _ => query,
    };
    url.set_query(Some(&query));

    Ok(url.into())
}

/// Decodes a tracker response body into peers.
pub fn decode_response(body: &[u8]) -> Result<Vec<Peer>> {
    let response = de::from_bytes::<BencodeTracker>(body).context("could not decode tracker response")?;

    if let Some(reason) = response.failure_reason {
        bail!("tracker refused announce: {}", reason);
    }

    let peers = response
        .peers
        .ok_or_else(|| anyhow!("tracker response has no peers"))?;
    let peers = decode_compact_peers(&peers)?;

    debug!(
        "Tracker returned {} peers, refresh in {}s",
        peers.len(),
        response.interval
    );

    Ok(peers)
}

fn announce(url: &str) -> Result<Vec<Peer>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()?;

    let body = client.get(url).send()?.error_for_status()?.bytes()?;

    decode_response(&body)
}

/// Announces to every tracker and merges the peers they return.
///
/// Trackers that fail are logged and skipped. Peers reported by several
/// trackers are kept once, in first-seen order.
pub fn request_peers(
    trackers: &[String],
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    if trackers.is_empty() {
        bail!("no tracker URLs available");
    }

    let responses: Vec<(&String, Result<Vec<Peer>>)> = thread::scope(|s| {
        let handles: Vec<_> = trackers
            .iter()
            .map(|tracker| {
                let handle = s.spawn(move || {
                    let url = build_tracker_url(tracker, info_hash, peer_id, port, left)?;
                    announce(&url)
                });
                (tracker, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(tracker, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("tracker thread panicked")));
                (tracker, result)
            })
            .collect()
    });

    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    for (tracker, result) in responses {
        match result {
            Ok(tracker_peers) => {
                info!("Tracker {} returned {} peers", tracker, tracker_peers.len());
                peers.extend(tracker_peers.into_iter().filter(|peer| seen.insert(*peer)));
            }
            Err(e) => warn!("Skipping tracker {}: {:#}", tracker, e),
        }
    }

    if peers.is_empty() {
        bail!("could not get peers from any tracker");
    }

    Ok(peers)
}
