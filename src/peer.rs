//! # Peer Addresses
//!
//! Trackers hand out peers in the compact format of BEP 23: a byte
//! string of 6-byte records, 4 bytes of IPv4 address followed by a
//! 2-byte big-endian port. Both the HTTP and UDP trackers use it.

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;

use crate::error::{Error, Result};
use crate::types::PeerId;

const PEER_SIZE: usize = 6;

/// Connection information for one peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list. The input length must be a multiple of
/// six; ordering is preserved.
pub fn from_compact(bytes: &[u8]) -> Result<Vec<Peer>> {
    if !bytes.len().is_multiple_of(PEER_SIZE) {
        return Err(Error::tracker(format!(
            "compact peer list of {} bytes is not a multiple of {}",
            bytes.len(),
            PEER_SIZE
        )));
    }

    let mut peers = Vec::with_capacity(bytes.len() / PEER_SIZE);
    for record in bytes.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
        let port = Cursor::new(&record[4..6]).read_u16::<BigEndian>()?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}

/// Encode peers back into the compact 6-byte record form.
#[allow(dead_code)]
pub fn to_compact(peers: &[Peer]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(peers.len() * PEER_SIZE);
    for peer in peers {
        bytes.extend_from_slice(&peer.ip.octets());
        bytes.extend_from_slice(&peer.port.to_be_bytes());
    }
    bytes
}

/// Generate the random 20-byte id this process presents to trackers and
/// peers. Generated once per invocation.
pub fn random_peer_id() -> PeerId {
    let mut peer_id: PeerId = [0; 20];
    rand::thread_rng().fill(&mut peer_id[..]);
    peer_id
}
