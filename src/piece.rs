//! Work and result units flowing through the download channels.
//!
//! A `PieceWork` describes one piece to fetch and is immutable: it
//! circulates on the work queue until some worker downloads and
//! verifies it. A `PieceResult` is produced exactly once per piece and
//! carries the verified bytes to the assembler.

use crate::types::Sha1Hash;

/// One piece waiting to be downloaded.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 of the piece data
    pub hash: Sha1Hash,
    /// Length of the piece in bytes; only the last piece may be short
    pub length: u32,
}

/// A downloaded and SHA-1 verified piece.
#[derive(Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Length of the piece in bytes
    pub length: u32,
    /// Verified piece data, `length` bytes
    pub data: Vec<u8>,
}

impl PieceWork {
    pub fn new(index: u32, hash: Sha1Hash, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    pub fn new(index: u32, length: u32, data: Vec<u8>) -> PieceResult {
        PieceResult {
            index,
            length,
            data,
        }
    }
}
