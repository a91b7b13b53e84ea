//! # Rivulet BitTorrent Client
//!
//! A command-line BitTorrent download client written in Rust.
//!
//! ## Features
//!
//! - Peer wire protocol: handshake, bitfield, choke/unchoke, pipelined requests
//! - Multi-tracker announce
//! - One worker thread per peer sharing a single piece queue
//! - Piece verification with SHA-1 hashing, failed pieces retried elsewhere
//! - Progress tracking with visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! rivulet <torrent_file>
//! rivulet <torrent_file> -o <output_file>
//! RUST_LOG=debug rivulet <torrent_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: Parses arguments, loads torrent, announces, assembles pieces
//! - **Worker threads**: Each handles communication with one peer
//! - **Channels**: Coordinate piece work distribution and result collection

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod download;
mod error;
mod handshake;
mod message;
mod peer;
mod piece;
mod queue;
mod torrent;
mod tracker;
mod worker;

#[cfg(test)]
mod sim;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;

use download::Download;
use torrent::Torrent;

/// 20-byte SHA-1 hash of a torrent's info dictionary.
pub type InfoHash = [u8; 20];

/// 20-byte identifier a client announces in handshakes and to trackers.
pub type PeerId = [u8; 20];

pub type Sha1Hash = [u8; 20];

/// Default port advertised to trackers
const PORT: u16 = 6881;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Port reported to trackers
    #[arg(short = 'p', long, default_value_t = PORT)]
    port: u16,

    /// Overwrite the output file without asking
    #[arg(short = 'y', long)]
    yes: bool,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Random peer id, generated once per run.
fn generate_peer_id() -> PeerId {
    rand::thread_rng().gen()
}

fn confirm_overwrite(output: &Path) -> Result<bool> {
    println!("Output file '{}' already exists.", output.display());
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn run(args: Args) -> Result<()> {
    let torrent = Torrent::open(&args.torrent)?;

    let output_filepath = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(&torrent.name)));

    if output_filepath.exists() && !args.yes && !confirm_overwrite(&output_filepath)? {
        println!("Download cancelled.");
        return Ok(());
    }

    // Create the output file up front so a bad path fails before downloading
    let mut output_file = File::create(&output_filepath).with_context(|| {
        format!(
            "could not create output file '{}'",
            output_filepath.display()
        )
    })?;

    let peer_id = generate_peer_id();
    let peers = tracker::request_peers(
        &torrent.trackers,
        &torrent.info_hash,
        &peer_id,
        args.port,
        torrent.length,
    )?;

    let download = Download::new(
        torrent.info_hash,
        peer_id,
        torrent.piece_hashes,
        torrent.piece_length,
        torrent.length,
    )?;

    println!(
        "Downloading {:?} ({} pieces) from {} peers",
        torrent.name,
        download.nb_pieces(),
        peers.len()
    );

    let data = download.run(&peers)?;

    output_file.write_all(&data).with_context(|| {
        format!(
            "could not write data to file '{}'",
            output_filepath.display()
        )
    })?;

    println!("Saved in \"{}\".", output_filepath.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    // Exit without waiting on worker threads still blocked on their peers
    std::process::exit(0);
}
