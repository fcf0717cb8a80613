//! # Grebe BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol (BEP 3)
//! - HTTP and UDP tracker support, with multitracker tiers (BEP 12/15)
//! - Multi-peer concurrent downloading with pipelined block requests
//! - Piece verification with SHA-1 hashing
//! - Single-file and multi-file torrents
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! grebe <torrent_file>
//! grebe <torrent_file> -o <output_name>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads the torrent, contacts
//!   trackers, assembles the download and writes it to disk
//! - **Worker threads**: One per peer, each owning its TCP connection
//! - **Channels**: A bounded work queue distributes pieces, a results
//!   channel collects them

mod bitfield;
mod client;
mod error;
mod handshake;
mod message;
mod peer;
mod piece;
mod storage;
mod torrent;
mod tracker;
mod types;
mod worker;

use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use clap::Parser;
use log::debug;

use crate::torrent::TorrentFile;

// Default port advertised to trackers and peers
const DEFAULT_PORT: u16 = 6881;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Output name (defaults to the name from the torrent)
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Port to advertise to trackers and peers
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

/// Sanitize a filename from torrent metadata to prevent path traversal.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Ask before clobbering an existing file or directory.
fn confirm_overwrite(name: &str) -> Result<bool> {
    println!("Output '{}' already exists.", name);
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn run(args: Args) -> Result<()> {
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    let torrent = TorrentFile::open(Path::new(&args.torrent))?;

    let output_name = match args.output {
        Some(name) => name,
        None => sanitize_filename(torrent.name()),
    };

    if Path::new(&output_name).exists() && !confirm_overwrite(&output_name)? {
        println!("Download cancelled.");
        return Ok(());
    }

    // One random identity per invocation
    let peer_id = peer::random_peer_id();
    debug!("Using peer id {:02x?}", peer_id);

    let peers = tracker::request_peers(&torrent, peer_id, args.port)?;

    let data = torrent.download(peer_id, &peers)?;

    storage::write_to_disk(&torrent, &output_name, &data)?;
    println!("Saved in \"{}\".", output_name);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
