//! # Torrent Metadata and Download Coordination
//!
//! This module owns the two ends of a download: parsing the bencoded
//! `.torrent` file into an immutable [`TorrentFile`], and driving the
//! download itself.
//!
//! ## Metainfo
//!
//! A torrent file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URLs, optionally tiered
//! - **info**: payload metadata; the SHA-1 of this dictionary re-encoded
//!   is the info hash that identifies the swarm
//! - **info.pieces**: concatenated 20-byte SHA-1 digests, one per piece
//! - **info.piece length**: bytes per piece, except possibly the last
//! - **info.length** or **info.files**: single-file size, or the file
//!   list of a multi-file torrent
//!
//! ## Coordination
//!
//! One worker thread per peer, coordinated with two channels: a work
//! queue holding one [`PieceWork`](crate::piece::PieceWork) per piece
//! (bounded at the piece count, so a requeue can never block), and a
//! results channel the assembler drains. Pieces complete in arbitrary
//! order; the assembler copies each one to `index * piece_length` in
//! the output buffer and tracks per-index done bits so a duplicate
//! delivery is counted once.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use boring::sha::Sha1;
use crossbeam_channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::types::{PeerId, Sha1Hash, SHA1_HASH_SIZE};
use crate::worker::Worker;

/// One file of a multi-file torrent, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File size in bytes
    pub length: u64,
    /// Path components below the torrent's directory name
    pub path: Vec<String>,
}

/// Parsed, immutable metadata of a `.torrent` file.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    /// Tracker tiers, tried in order (BEP 12)
    tiers: Vec<Vec<String>>,
    /// SHA-1 of the bencoded info dictionary
    info_hash: Sha1Hash,
    /// One 20-byte digest per piece
    piece_hashes: Vec<Sha1Hash>,
    /// Bytes per piece, except possibly the last
    piece_length: u32,
    /// Total payload size in bytes
    total_length: u64,
    /// Suggested file name, or directory name for multi-file torrents
    name: String,
    /// File list, present only for multi-file torrents
    files: Option<Vec<FileEntry>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeFile {
    length: u64,
    path: Vec<String>,
}

// Field order matters: bencode dictionaries are sorted by key, and the
// info hash is taken over the re-encoded dictionary.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<BencodeFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    pieces: ByteBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Hash the re-encoded info dictionary to identify the swarm.
    fn hash(&self) -> Result<Sha1Hash> {
        let buf = ser::to_bytes(self)
            .map_err(|e| Error::Parse(format!("could not encode info dictionary: {}", e)))?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        Ok(hasher.finish())
    }

    /// Split the concatenated piece digests into one hash per piece.
    fn split_piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(Error::Parse(format!(
                "pieces length {} is not a multiple of {}",
                self.pieces.len(),
                SHA1_HASH_SIZE
            )));
        }

        let mut hashes = Vec::with_capacity(self.pieces.len() / SHA1_HASH_SIZE);
        for chunk in self.pieces.chunks_exact(SHA1_HASH_SIZE) {
            let mut hash: Sha1Hash = [0; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        Ok(hashes)
    }

    fn total_length(&self) -> Result<u64> {
        match (&self.files, self.length) {
            (Some(files), _) => Ok(files.iter().map(|f| f.length).sum()),
            (None, Some(length)) => Ok(length),
            (None, None) => Err(Error::Parse(
                "info dictionary has neither length nor files".into(),
            )),
        }
    }
}

impl TorrentFile {
    /// Parse a torrent file from disk.
    pub fn open(path: &Path) -> Result<TorrentFile> {
        let mut file = File::open(path)
            .map_err(|e| Error::Parse(format!("could not open torrent: {}", e)))?;

        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .map_err(|e| Error::Parse(format!("could not read torrent: {}", e)))?;

        TorrentFile::from_bytes(&buf)
    }

    /// Parse a torrent file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<TorrentFile> {
        let bencode: BencodeTorrent = de::from_bytes(buf)
            .map_err(|e| Error::Parse(format!("could not decode torrent: {}", e)))?;

        let tiers = if !bencode.announce_list.is_empty() {
            bencode.announce_list
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce]]
        } else {
            return Err(Error::Parse(
                "torrent has no announce or announce-list".into(),
            ));
        };

        if bencode.info.piece_length == 0 {
            return Err(Error::Parse("piece length is zero".into()));
        }

        let info_hash = bencode.info.hash()?;
        let piece_hashes = bencode.info.split_piece_hashes()?;
        let total_length = bencode.info.total_length()?;

        // Every piece is piece_length bytes except a shorter final one
        let expected_pieces = total_length.div_ceil(bencode.info.piece_length as u64);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(Error::Parse(format!(
                "{} piece hashes for a payload needing {}",
                piece_hashes.len(),
                expected_pieces
            )));
        }

        let files = bencode.info.files.map(|files| {
            files
                .into_iter()
                .map(|f| FileEntry {
                    length: f.length,
                    path: f.path,
                })
                .collect()
        });

        Ok(TorrentFile {
            tiers,
            info_hash,
            piece_hashes,
            piece_length: bencode.info.piece_length,
            total_length,
            name: bencode.info.name,
            files,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// File list of a multi-file torrent, `None` in single-file mode.
    pub fn files(&self) -> Option<&[FileEntry]> {
        self.files.as_deref()
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; all pieces are `piece_length` bytes
    /// except the last, which covers whatever remains.
    pub fn piece_length_at(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.total_length);
        (end - begin) as u32
    }

    /// Download the whole payload into memory.
    ///
    /// Spawns one worker per peer and assembles verified pieces as they
    /// arrive. Returns the complete buffer, or an error if every worker
    /// exits before the payload is complete.
    pub fn download(&self, peer_id: PeerId, peers: &[Peer]) -> Result<Vec<u8>> {
        let num_pieces = self.num_pieces();
        println!("Downloading {:?} ({} pieces)", self.name, num_pieces);

        // The work queue holds every piece, so a requeue never blocks.
        let (work_tx, work_rx) = bounded::<PieceWork>(num_pieces);
        let (result_tx, result_rx) = bounded::<PieceResult>(peers.len().max(1));

        for (index, hash) in self.piece_hashes.iter().enumerate() {
            let index = index as u32;
            let piece_work = PieceWork::new(index, *hash, self.piece_length_at(index));
            work_tx
                .send(piece_work)
                .map_err(|_| Error::tracker("work queue closed before the download started"))?;
        }

        let live_workers = Arc::new(AtomicUsize::new(0));
        for &peer in peers {
            let worker = Worker::new(
                peer,
                peer_id,
                self.info_hash,
                (work_tx.clone(), work_rx.clone()),
                result_tx.clone(),
                Arc::clone(&live_workers),
            );

            thread::spawn(move || {
                worker.start_download();
            });
        }

        // Only workers hold result senders now: when the last one
        // exits, the channel disconnects and the stall is detected.
        drop(result_tx);

        let progress = ProgressBar::new(self.total_length);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut data: Vec<u8> = vec![0; self.total_length as usize];
        let mut done = vec![false; num_pieces];
        let mut nb_pieces_downloaded = 0;

        while nb_pieces_downloaded < num_pieces {
            let piece_result = result_rx.recv().map_err(|_| {
                Error::tracker("all peer connections failed before the download completed")
            })?;

            let index = piece_result.index as usize;
            if done[index] {
                // Two workers raced on the same piece; count it once
                continue;
            }
            done[index] = true;

            let begin = index * self.piece_length as usize;
            data[begin..begin + piece_result.length as usize].copy_from_slice(&piece_result.data);
            nb_pieces_downloaded += 1;

            let live = live_workers.load(Ordering::SeqCst);
            progress.inc(piece_result.length as u64);
            progress.set_message(format!("{} peers", live));
            debug!(
                "({:.2}%) Downloaded piece #{} from {} peers",
                nb_pieces_downloaded as f64 / num_pieces as f64 * 100.0,
                piece_result.index,
                live
            );
        }

        progress.finish();

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_pieces(num_pieces: usize) -> ByteBuf {
        let mut pieces = vec![];
        for i in 0..num_pieces {
            pieces.extend_from_slice(&[i as u8; SHA1_HASH_SIZE]);
        }
        ByteBuf::from(pieces)
    }

    fn single_file_torrent() -> Vec<u8> {
        ser::to_bytes(&BencodeTorrent {
            announce: "http://bt.example.org:6969/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                files: None,
                length: Some(35),
                name: "payload.bin".to_string(),
                piece_length: 10,
                pieces: info_with_pieces(4),
            },
        })
        .unwrap()
    }

    #[test]
    fn test_open_single_file() {
        let torrent = TorrentFile::from_bytes(&single_file_torrent()).unwrap();

        assert_eq!(torrent.name(), "payload.bin");
        assert_eq!(
            torrent.tiers(),
            &[vec!["http://bt.example.org:6969/announce".to_string()]]
        );
        assert_eq!(torrent.total_length(), 35);
        assert_eq!(torrent.num_pieces(), 4);
        assert!(torrent.files().is_none());

        assert_eq!(torrent.piece_hashes[2], [2; 20]);
    }

    #[test]
    fn test_piece_length_arithmetic() {
        let torrent = TorrentFile::from_bytes(&single_file_torrent()).unwrap();

        // All full pieces except a 5-byte tail
        assert_eq!(torrent.piece_length_at(0), 10);
        assert_eq!(torrent.piece_length_at(2), 10);
        assert_eq!(torrent.piece_length_at(3), 5);

        let covered: u64 = (0..4).map(|i| torrent.piece_length_at(i) as u64).sum();
        assert_eq!(covered, torrent.total_length());
    }

    #[test]
    fn test_info_hash_is_sha1_of_info_dict() {
        let info = BencodeInfo {
            files: None,
            length: Some(35),
            name: "payload.bin".to_string(),
            piece_length: 10,
            pieces: info_with_pieces(4),
        };
        let expected = {
            let mut hasher = Sha1::new();
            hasher.update(&ser::to_bytes(&info).unwrap());
            hasher.finish()
        };

        let torrent = TorrentFile::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(torrent.info_hash(), expected);
    }

    #[test]
    fn test_open_multi_file() {
        let buf = ser::to_bytes(&BencodeTorrent {
            announce: "http://bt.example.org:6969/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                files: Some(vec![
                    BencodeFile {
                        length: 20,
                        path: vec!["sub".to_string(), "a.bin".to_string()],
                    },
                    BencodeFile {
                        length: 15,
                        path: vec!["b.bin".to_string()],
                    },
                ]),
                length: None,
                name: "payload".to_string(),
                piece_length: 10,
                pieces: info_with_pieces(4),
            },
        })
        .unwrap();

        let torrent = TorrentFile::from_bytes(&buf).unwrap();
        assert_eq!(torrent.total_length(), 35);

        let files = torrent.files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].length, 20);
        assert_eq!(files[0].path, vec!["sub".to_string(), "a.bin".to_string()]);
        assert_eq!(files[1].length, 15);
    }

    #[test]
    fn test_announce_list_takes_precedence() {
        let buf = ser::to_bytes(&BencodeTorrent {
            announce: "http://primary.example.org/announce".to_string(),
            announce_list: vec![
                vec![
                    "udp://t1.example.org:6969".to_string(),
                    "udp://t2.example.org:6969".to_string(),
                ],
                vec!["http://backup.example.org/announce".to_string()],
            ],
            info: BencodeInfo {
                files: None,
                length: Some(35),
                name: "payload.bin".to_string(),
                piece_length: 10,
                pieces: info_with_pieces(4),
            },
        })
        .unwrap();

        let torrent = TorrentFile::from_bytes(&buf).unwrap();
        assert_eq!(torrent.tiers().len(), 2);
        assert_eq!(torrent.tiers()[0].len(), 2);
        assert_eq!(torrent.tiers()[1][0], "http://backup.example.org/announce");
    }

    #[test]
    fn test_rejects_ragged_pieces() {
        let buf = ser::to_bytes(&BencodeTorrent {
            announce: "http://bt.example.org/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                files: None,
                length: Some(35),
                name: "payload.bin".to_string(),
                piece_length: 10,
                pieces: ByteBuf::from(vec![0xab; 70]),
            },
        })
        .unwrap();

        assert!(TorrentFile::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let buf = ser::to_bytes(&BencodeTorrent {
            announce: "http://bt.example.org/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                files: None,
                length: Some(100),
                name: "payload.bin".to_string(),
                piece_length: 10,
                pieces: info_with_pieces(4),
            },
        })
        .unwrap();

        assert!(TorrentFile::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_rejects_missing_announce() {
        let buf = ser::to_bytes(&BencodeTorrent {
            announce: String::new(),
            announce_list: vec![],
            info: BencodeInfo {
                files: None,
                length: Some(35),
                name: "payload.bin".to_string(),
                piece_length: 10,
                pieces: info_with_pieces(4),
            },
        })
        .unwrap();

        assert!(TorrentFile::from_bytes(&buf).is_err());
    }
}
