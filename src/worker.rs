//! # Download Worker
//!
//! One worker per peer. A worker owns its [`Client`] connection
//! exclusively and loops over the shared work queue:
//!
//! 1. Pop a piece. If the peer does not have it, put it back and move
//!    on.
//! 2. Attempt the piece under a 30 second socket deadline. Any I/O or
//!    protocol error costs this peer its connection: the piece goes
//!    back on the queue first, then the worker exits.
//! 3. Verify the piece's SHA-1. A mismatch requeues the piece but keeps
//!    the connection.
//! 4. Send HAVE and push the verified piece to the assembler.
//!
//! A failing worker always requeues before terminating, so a piece can
//! only be lost if no live peer has it, in which case the assembler
//! reports the stall.
//!
//! ## Pipelining
//!
//! Within a piece, up to five block requests are kept in flight at
//! once. Blocks are 16 KiB, the de facto maximum peers accept. The
//! attempt loop tracks outstanding requests, bytes requested and bytes
//! received, topping the pipeline up whenever the peer has us unchoked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::message::{
    self, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_KEEPALIVE, MESSAGE_PIECE, MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::types::{PeerId, Sha1Hash};

// Max number of unfulfilled block requests kept in flight per peer.
const MAX_BACKLOG: u32 = 5;

// Largest number of bytes a single request asks for (16 KiB).
const MAX_BLOCK_SIZE: u32 = 16384;

// 30 seconds is more than enough to move a 256 KiB piece; the deadline
// gets unresponsive peers unstuck.
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

/// Downloads pieces from a single peer.
pub struct Worker {
    peer: Peer,
    peer_id: PeerId,
    info_hash: Sha1Hash,
    /// Work queue; the sender side puts unserved pieces back
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Verified pieces flow to the assembler here
    result_chan: Sender<PieceResult>,
    /// Count of workers currently running, for progress reporting
    live_workers: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: PeerId,
        info_hash: Sha1Hash,
        work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
        result_chan: Sender<PieceResult>,
        live_workers: Arc<AtomicUsize>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_chan,
            result_chan,
            live_workers,
        }
    }

    /// Run the worker until the peer fails or the queue closes.
    pub fn start_download(&self) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
        self.download_from_peer();
        self.live_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn download_from_peer(&self) {
        let mut client = match Client::connect(self.peer, self.info_hash, self.peer_id) {
            Ok(client) => client,
            Err(e) => {
                debug!("Could not connect to peer {}: {}", self.peer, e);
                return;
            }
        };

        if client.send_unchoke().is_err() {
            return;
        }
        if client.send_interested().is_err() {
            return;
        }

        loop {
            let piece_work = match self.work_chan.1.recv() {
                Ok(piece_work) => piece_work,
                Err(_) => {
                    debug!("Worker for peer {} exiting: work queue closed", self.peer);
                    return;
                }
            };

            // Skip pieces this peer does not advertise
            if !client.has_piece(piece_work.index) {
                if self.requeue(piece_work).is_err() {
                    return;
                }
                continue;
            }

            let buf = match attempt_download_piece(&mut client, &piece_work) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!("Disconnecting from peer {}: {}", self.peer, e);
                    let _ = self.requeue(piece_work);
                    return;
                }
            };

            if let Err(e) = verify_piece(&piece_work, &buf) {
                warn!("Requeueing piece from peer {}: {}", self.peer, e);
                if self.requeue(piece_work).is_err() {
                    return;
                }
                continue;
            }

            debug!("Verified piece {} from peer {}", piece_work.index, self.peer);

            // The peer may want this piece from us one day; HAVE is a
            // courtesy and its failure does not invalidate the piece.
            if let Err(e) = client.send_have(piece_work.index) {
                debug!("Could not send HAVE to peer {}: {}", self.peer, e);
            }

            let piece_result = PieceResult::new(piece_work.index, piece_work.length, buf);
            if self.result_chan.send(piece_result).is_err() {
                // Assembler is gone, nothing left to deliver to
                return;
            }
        }
    }

    fn requeue(&self, piece_work: PieceWork) -> Result<()> {
        self.work_chan
            .0
            .send(piece_work)
            .map_err(|_| Error::tracker("work queue closed while requeueing a piece"))
    }
}

/// Download one piece over an established connection, keeping up to
/// [`MAX_BACKLOG`] block requests in flight.
fn attempt_download_piece(client: &mut Client, piece_work: &PieceWork) -> Result<Vec<u8>> {
    client.set_deadline(Some(PIECE_DEADLINE))?;

    let mut buf: Vec<u8> = vec![0; piece_work.length as usize];
    let mut backlog: u32 = 0;
    let mut requested: u32 = 0;
    let mut downloaded: u32 = 0;

    while downloaded < piece_work.length {
        if !client.is_choked() {
            // Top the request pipeline up
            while backlog < MAX_BACKLOG && requested < piece_work.length {
                let block_size = MAX_BLOCK_SIZE.min(piece_work.length - requested);

                client.send_request(piece_work.index, requested, block_size)?;
                backlog += 1;
                requested += block_size;
            }
        }

        let message = client.read_message()?;
        match message.id {
            MESSAGE_CHOKE => client.read_choke(),
            MESSAGE_UNCHOKE => client.read_unchoke(),
            MESSAGE_HAVE => client.read_have(&message)?,
            MESSAGE_PIECE => {
                let n = message::parse_piece(&message, piece_work.index, &mut buf)?;
                backlog = backlog.saturating_sub(1);
                downloaded += n as u32;
            }
            MESSAGE_KEEPALIVE => {}
            _ => debug!("Ignoring {} from peer {}", message.name(), client.peer()),
        }
    }

    client.set_deadline(None)?;

    Ok(buf)
}

/// Compare the downloaded piece against its expected SHA-1.
fn verify_piece(piece_work: &PieceWork, buf: &[u8]) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(buf);

    if hasher.finish() != piece_work.hash {
        return Err(Error::Integrity {
            index: piece_work.index,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use crossbeam_channel::bounded;

    use crate::bitfield::Bitfield;
    use crate::handshake::Handshake;
    use crate::message::{Message, MESSAGE_BITFIELD, MESSAGE_REQUEST};

    const TEST_INFO_HASH: Sha1Hash = [0x11; 20];

    fn sha1(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish()
    }

    fn test_piece(length: usize, seed: u8) -> Vec<u8> {
        (0..length)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    /// Serve the scripted side of the peer wire protocol: handshake
    /// echo, full bitfield, an immediate unchoke, then blocks on
    /// demand. When `corrupt_first_block` is set, the first block of
    /// that piece is served flipped once, and correctly afterwards.
    fn spawn_fake_peer(pieces: Vec<Vec<u8>>, corrupt_first_block: Option<u32>) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();

            let handshake = Handshake::read_from(&mut conn).unwrap();
            assert_eq!(handshake.info_hash, TEST_INFO_HASH);
            conn.write_all(&Handshake::new(TEST_INFO_HASH, [0x22; 20]).serialize())
                .unwrap();

            let mut bitfield = Bitfield::with_capacity(pieces.len());
            for index in 0..pieces.len() {
                bitfield.set_piece(index as u32);
            }
            let bitfield_msg =
                Message::new_with_payload(MESSAGE_BITFIELD, bitfield.as_bytes().to_vec());
            conn.write_all(&bitfield_msg.serialize()).unwrap();
            conn.write_all(&Message::new(MESSAGE_UNCHOKE).serialize()).unwrap();

            let mut corruption_spent = false;
            loop {
                let msg = match Message::read_from(&mut conn) {
                    Ok(msg) => msg,
                    Err(_) => return,
                };
                if msg.id != MESSAGE_REQUEST {
                    // UNCHOKE, INTERESTED and HAVE from the client
                    continue;
                }

                let (index, begin, length) = message::parse_request(&msg).unwrap();
                let piece = &pieces[index as usize];
                let mut block = piece[begin as usize..(begin + length) as usize].to_vec();

                if corrupt_first_block == Some(index) && begin == 0 && !corruption_spent {
                    corruption_spent = true;
                    for byte in block.iter_mut() {
                        *byte = !*byte;
                    }
                }

                conn.write_all(&Message::piece(index, begin, &block).serialize())
                    .unwrap();
            }
        });

        Peer::new(std::net::Ipv4Addr::LOCALHOST, addr.port())
    }

    #[test]
    fn test_attempt_download_piece() {
        // One full multi-block piece and a short tail piece
        let pieces = vec![test_piece(20000, 3), test_piece(1000, 5)];
        let peer = spawn_fake_peer(pieces.clone(), None);

        let mut client = Client::connect(peer, TEST_INFO_HASH, [0x33; 20]).unwrap();
        client.send_unchoke().unwrap();
        client.send_interested().unwrap();

        for (index, piece) in pieces.iter().enumerate() {
            let piece_work =
                PieceWork::new(index as u32, sha1(piece), piece.len() as u32);
            assert!(client.has_piece(piece_work.index));

            let buf = attempt_download_piece(&mut client, &piece_work).unwrap();
            assert_eq!(&buf, piece);
            assert!(verify_piece(&piece_work, &buf).is_ok());
        }
    }

    #[test]
    fn test_worker_requeues_corrupt_piece_and_recovers() {
        let pieces = vec![test_piece(20000, 7), test_piece(1000, 9)];
        let peer = spawn_fake_peer(pieces.clone(), Some(0));

        let (work_tx, work_rx) = bounded::<PieceWork>(pieces.len());
        let (result_tx, result_rx) = bounded::<PieceResult>(pieces.len());
        for (index, piece) in pieces.iter().enumerate() {
            work_tx
                .send(PieceWork::new(index as u32, sha1(piece), piece.len() as u32))
                .unwrap();
        }

        let live_workers = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(
            peer,
            [0x33; 20],
            TEST_INFO_HASH,
            (work_tx.clone(), work_rx),
            result_tx,
            Arc::clone(&live_workers),
        );
        thread::spawn(move || worker.start_download());

        // The corrupted first delivery of piece 0 must not surface: the
        // worker requeues it and serves the good copy on the retry.
        let mut results = vec![
            result_rx.recv_timeout(Duration::from_secs(30)).unwrap(),
            result_rx.recv_timeout(Duration::from_secs(30)).unwrap(),
        ];
        results.sort_by_key(|piece| piece.index);

        assert_eq!(results[0].index, 0);
        assert_eq!(results[0].data, pieces[0]);
        assert_eq!(results[1].index, 1);
        assert_eq!(results[1].data, pieces[1]);
    }

    #[test]
    fn test_connect_rejects_non_bitfield_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let _ = Handshake::read_from(&mut conn).unwrap();
            conn.write_all(&Handshake::new(TEST_INFO_HASH, [0x22; 20]).serialize())
                .unwrap();

            // An unexpected id where the bitfield belongs
            let msg = Message::new_with_payload(99, vec![1, 2, 3, 4, 5]);
            conn.write_all(&msg.serialize()).unwrap();

            // Hold the socket open so the client fails on the message,
            // not on a reset connection
            let _ = Message::read_from(&mut conn);
        });

        let peer = Peer::new(std::net::Ipv4Addr::LOCALHOST, addr.port());
        assert!(Client::connect(peer, TEST_INFO_HASH, [0x33; 20]).is_err());
    }

    #[test]
    fn test_connect_rejects_wrong_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let _ = Handshake::read_from(&mut conn).unwrap();
            // Echo a handshake for some other swarm
            conn.write_all(&Handshake::new([0x44; 20], [0x22; 20]).serialize())
                .unwrap();
            let _ = Message::read_from(&mut conn);
        });

        let peer = Peer::new(std::net::Ipv4Addr::LOCALHOST, addr.port());
        assert!(Client::connect(peer, TEST_INFO_HASH, [0x33; 20]).is_err());
    }

    #[test]
    fn test_verify_piece() {
        let data = test_piece(1234, 1);
        let piece_work = PieceWork::new(0, sha1(&data), data.len() as u32);

        assert!(verify_piece(&piece_work, &data).is_ok());

        let mut tampered = data.clone();
        tampered[100] ^= 0x01;
        let err = verify_piece(&piece_work, &tampered).unwrap_err();
        assert!(err.to_string().contains("integrity"));
    }
}
