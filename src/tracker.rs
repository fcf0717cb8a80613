//! # Tracker Client
//!
//! Peer discovery over HTTP(S) and UDP trackers.
//!
//! Announce URLs come from the metainfo in tiers (BEP 12). Tiers are
//! walked in order, each tier left to right, and the first tracker that
//! yields a non-empty peer list wins. Every URL is dispatched on its
//! scheme: `http`/`https` speak the classic GET-with-query protocol of
//! BEP 3/23, `udp` speaks BEP 15.
//!
//! ## HTTP
//!
//! A GET request with `info_hash` and `peer_id` sent as raw bytes,
//! percent-encoded, plus the transfer counters and `compact=1`. The
//! response is a bencoded dict with `interval` and a compact peer list.
//!
//! ## UDP (BEP 15)
//!
//! Two request/response exchanges on one socket: a connect handshake
//! that yields a connection id, then the announce proper. Requests are
//! retransmitted with a timeout of `15 * 2^n` seconds, `n = 0..=8`
//! (3840 seconds at the cap), and `n` resets between the two steps.
//! Connection ids expire server-side after two minutes; since a fresh
//! connect precedes every announce here, an expired id is never reused.

use std::io::{Cursor, ErrorKind};
use std::net::UdpSocket;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use crate::error::{Error, Result};
use crate::peer::{self, Peer};
use crate::torrent::TorrentFile;
use crate::types::{PeerId, Sha1Hash};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

// BEP 15 magic constant identifying the connect request.
const UDP_PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

// Do not expect datagrams of an exact size; read up to this many bytes.
const UDP_PACKET_SIZE_MAX: usize = 20_000;

// Retransmit timeout is 15 * 2^n seconds; n stops at 8 (3840 seconds).
const UDP_RETRANSMIT_MAX: u32 = 8;

/// Bencoded body of an HTTP tracker response.
#[derive(Debug, Deserialize)]
struct BencodeTrackerResponse {
    // Seconds to wait before re-announcing; unused by this one-shot client
    interval: u32,
    // Compact peer records
    peers: ByteBuf,
}

/// Ask the torrent's trackers for peers, introducing ourselves with
/// `peer_id` and `port`.
///
/// Tiers are tried in order and exhausted trackers are skipped with a
/// warning; only a full sweep without a single peer is an error.
pub fn request_peers(torrent: &TorrentFile, peer_id: PeerId, port: u16) -> Result<Vec<Peer>> {
    for tier in torrent.tiers() {
        for announce in tier {
            info!("Contacting tracker at {}", announce);
            match request_peers_from(announce, torrent, peer_id, port) {
                Ok(peers) if !peers.is_empty() => {
                    info!("Tracker {} returned {} peers", announce, peers.len());
                    return Ok(peers);
                }
                Ok(_) => warn!("Tracker {} returned zero peers", announce),
                Err(e) => warn!("Tracker {} failed: {}", announce, e),
            }
        }
    }

    Err(Error::tracker("could not get peers from any tracker"))
}

fn request_peers_from(
    announce: &str,
    torrent: &TorrentFile,
    peer_id: PeerId,
    port: u16,
) -> Result<Vec<Peer>> {
    let url = Url::parse(announce)
        .map_err(|e| Error::tracker(format!("could not parse tracker url: {}", e)))?;

    let info_hash = torrent.info_hash();
    let left = torrent.total_length();

    match url.scheme() {
        "http" | "https" => http_request_peers(announce, info_hash, peer_id, port, left),
        "udp" => udp_request_peers(&url, info_hash, peer_id, port, left),
        scheme => Err(Error::tracker(format!(
            "unsupported tracker scheme: {}",
            scheme
        ))),
    }
}

/// Percent-encode binary data, one `%XX` triplet per byte.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }

    encoded
}

/// Build the announce GET url. The query string is assembled by hand:
/// `info_hash` and `peer_id` are raw bytes, and generic form encoders
/// mangle them.
fn build_tracker_url(
    announce: &str,
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> String {
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let separator = if announce.contains('?') { '&' } else { '?' };
    format!("{}{}{}", announce, separator, query)
}

fn http_request_peers(
    announce: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    let announce_url = build_tracker_url(announce, &info_hash, &peer_id, port, left);

    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::tracker(format!("could not build http client: {}", e)))?;

    let response = client
        .get(&announce_url)
        .send()
        .and_then(|response| response.bytes())
        .map_err(|e| Error::tracker(format!("request failed: {}", e)))?;

    let tracker_response: BencodeTrackerResponse = de::from_bytes(&response)
        .map_err(|e| Error::tracker(format!("could not decode response: {}", e)))?;

    debug!(
        "Tracker asks for re-announce every {} seconds",
        tracker_response.interval
    );

    peer::from_compact(&tracker_response.peers)
}

fn udp_request_peers(
    url: &Url,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::tracker("udp tracker url has no host"))?;
    let tracker_port = url
        .port()
        .ok_or_else(|| Error::tracker("udp tracker url has no port"))?;

    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect((host, tracker_port))?;

    let mut rng = rand::thread_rng();

    // Step one: obtain a connection id.
    let transaction_id: u32 = rng.gen();
    let response = exchange(&socket, &connect_request(transaction_id))?;
    let connection_id = parse_connect_response(&response, transaction_id)?;
    debug!("Tracker granted connection id {:#x}", connection_id);

    // Step two: announce. The retransmit counter starts over.
    let transaction_id: u32 = rng.gen();
    let key: u32 = rng.gen();
    let request = announce_request(
        connection_id,
        transaction_id,
        &info_hash,
        &peer_id,
        left,
        key,
        port,
    );
    let response = exchange(&socket, &request)?;
    parse_announce_response(&response, transaction_id)
}

/// Send `request` and wait for a datagram, retransmitting on the BEP 15
/// backoff schedule.
fn exchange(socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
    for n in 0..=UDP_RETRANSMIT_MAX {
        let timeout = retransmit_timeout(n);
        socket.set_read_timeout(Some(timeout))?;
        socket.send(request)?;

        let mut buf = vec![0; UDP_PACKET_SIZE_MAX];
        match socket.recv(&mut buf) {
            Ok(received) => {
                buf.truncate(received);
                return Ok(buf);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                debug!("No answer within {:?}, retransmitting", timeout);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::tracker("udp tracker did not answer, gave up"))
}

fn retransmit_timeout(n: u32) -> Duration {
    Duration::from_secs(15 * 2u64.pow(n))
}

fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf
}

fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64> {
    let (action, echoed_id) = parse_response_header(buf)?;

    if action == ACTION_ERROR {
        return Err(server_error(buf));
    }
    if action != ACTION_CONNECT {
        return Err(Error::tracker(format!(
            "expected connect action in response, got {}",
            action
        )));
    }
    if echoed_id != transaction_id {
        return Err(Error::tracker("transaction id mismatch in connect response"));
    }
    if buf.len() < 16 {
        return Err(Error::tracker(format!(
            "connect response of {} bytes, expected 16",
            buf.len()
        )));
    }

    let connection_id = Cursor::new(&buf[8..16]).read_u64::<BigEndian>()?;
    Ok(connection_id)
}

fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    left: u64,
    key: u32,
    port: u16,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.extend_from_slice(&connection_id.to_be_bytes());
    buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf.extend_from_slice(info_hash);
    buf.extend_from_slice(peer_id);
    buf.extend_from_slice(&0u64.to_be_bytes()); // downloaded
    buf.extend_from_slice(&left.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes()); // uploaded
    buf.extend_from_slice(&0u32.to_be_bytes()); // event: none
    buf.extend_from_slice(&0u32.to_be_bytes()); // ip: default
    buf.extend_from_slice(&key.to_be_bytes());
    buf.extend_from_slice(&u32::MAX.to_be_bytes()); // num_want: no limit
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<Vec<Peer>> {
    let (action, echoed_id) = parse_response_header(buf)?;

    if action == ACTION_ERROR {
        return Err(server_error(buf));
    }
    if action != ACTION_ANNOUNCE {
        return Err(Error::tracker(format!(
            "expected announce action in response, got {}",
            action
        )));
    }
    if echoed_id != transaction_id {
        return Err(Error::tracker(
            "transaction id mismatch in announce response",
        ));
    }
    if buf.len() < 20 {
        return Err(Error::tracker(format!(
            "announce response of {} bytes, expected at least 20",
            buf.len()
        )));
    }

    let mut cursor = Cursor::new(&buf[8..20]);
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;
    debug!(
        "Announce response: interval {}s, {} leechers, {} seeders",
        interval, leechers, seeders
    );

    peer::from_compact(&buf[20..])
}

fn parse_response_header(buf: &[u8]) -> Result<(u32, u32)> {
    if buf.len() < 8 {
        return Err(Error::tracker(format!(
            "tracker response of {} bytes is too short",
            buf.len()
        )));
    }

    let mut cursor = Cursor::new(&buf[..8]);
    let action = cursor.read_u32::<BigEndian>()?;
    let transaction_id = cursor.read_u32::<BigEndian>()?;
    Ok((action, transaction_id))
}

/// An `action = 3` response carries a human-readable message after the
/// header; surface it verbatim.
fn server_error(buf: &[u8]) -> Error {
    let message = String::from_utf8_lossy(&buf[8..]);
    Error::tracker(format!("tracker refused announce: {}", message))
}
