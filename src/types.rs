//! Shared byte-array aliases used across the wire codecs.

/// 20-byte SHA-1 digest, used for both the info hash and piece checksums.
pub type Sha1Hash = [u8; 20];

/// 20-byte identifier this client presents to trackers and peers.
pub type PeerId = [u8; 20];

pub const SHA1_HASH_SIZE: usize = 20;
