//! # BitTorrent Handshake
//!
//! The handshake is the first message two peers exchange after the TCP
//! connection opens. It is a fixed 68-byte layout:
//!
//! ```text
//! <pstrlen=19><pstr="BitTorrent protocol"><8 reserved><info_hash><peer_id>
//! ```
//!
//! The reserved bytes signal protocol extensions; this client sends all
//! zeros and does not interpret what it receives. The info hash binds
//! the connection to one swarm: the caller must check that the hash
//! echoed by the peer matches the one it sent.

use std::io::Read;

use crate::error::{Error, Result};
use crate::types::{PeerId, Sha1Hash};

const PROTOCOL_ID: &str = "BitTorrent protocol";
const PROTOCOL_ID_LEN: usize = 19;

/// Total size of a serialized handshake.
pub const HANDSHAKE_SIZE: usize = 49 + PROTOCOL_ID_LEN;

/// The opening handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 8 reserved bytes, zero on send, opaque on receive
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash identifying the swarm
    pub info_hash: Sha1Hash,
    /// 20-byte identifier of the sending peer
    pub peer_id: PeerId,
}

impl Handshake {
    /// Build a handshake for `info_hash`, introducing ourselves as
    /// `peer_id`. Reserved bytes are zero.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Handshake {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_SIZE);

        buf.push(PROTOCOL_ID_LEN as u8);
        buf.extend_from_slice(PROTOCOL_ID.as_bytes());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }

    /// Read and validate a handshake from a stream.
    ///
    /// Fails if the length byte is not 19 or the protocol string is not
    /// the BitTorrent literal. Reserved bytes are accepted as-is.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Handshake> {
        let mut buf = [0; HANDSHAKE_SIZE];
        reader.read_exact(&mut buf)?;

        if buf[0] as usize != PROTOCOL_ID_LEN {
            return Err(Error::protocol(format!(
                "invalid handshake pstrlen: {}, should be {}",
                buf[0], PROTOCOL_ID_LEN
            )));
        }
        if &buf[1..1 + PROTOCOL_ID_LEN] != PROTOCOL_ID.as_bytes() {
            return Err(Error::protocol("invalid handshake protocol string"));
        }

        let mut reserved = [0; 8];
        let mut info_hash: Sha1Hash = [0; 20];
        let mut peer_id: PeerId = [0; 20];
        reserved.copy_from_slice(&buf[20..28]);
        info_hash.copy_from_slice(&buf[28..48]);
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn test_serialize() {
        let info_hash = [
            134, 212, 200, 0, 36, 164, 105, 190, 76, 80, 188, 90, 16, 44, 247, 23, 128, 49, 0, 116,
        ];
        let peer_id = [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ];

        let buf = Handshake::new(info_hash, peer_id).serialize();

        let mut expected = vec![19];
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0; 8]);
        expected.extend_from_slice(&info_hash);
        expected.extend_from_slice(&peer_id);
        assert_eq!(buf, expected);
        assert_eq!(buf.len(), HANDSHAKE_SIZE);
    }

    #[test]
    fn test_round_trip() {
        let mut handshake = Handshake::new([7; 20], [42; 20]);
        handshake.reserved = [0, 1, 2, 3, 4, 5, 6, 7];

        let buf = handshake.serialize();
        let decoded = Handshake::read_from(&mut Cursor::new(buf)).unwrap();

        // Reserved bytes survive the round trip unchanged
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_rejects_wrong_pstrlen() {
        let mut buf = Handshake::new([7; 20], [42; 20]).serialize();
        buf[0] = 18;

        assert!(Handshake::read_from(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_rejects_wrong_protocol_string() {
        let mut buf = Handshake::new([7; 20], [42; 20]).serialize();
        buf[1..20].copy_from_slice(b"BitTorrent protocoX");

        assert!(Handshake::read_from(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_rejects_truncated_stream() {
        let buf = Handshake::new([7; 20], [42; 20]).serialize();

        assert!(Handshake::read_from(&mut Cursor::new(&buf[..40])).is_err());
    }
}
