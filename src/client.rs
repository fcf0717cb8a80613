//! # Peer Connection
//!
//! One `Client` owns one TCP connection to one remote peer and carries
//! the connection state the wire protocol requires: whether the peer
//! has us choked, and which pieces the peer claims to have.
//!
//! Opening a connection is a three-step sequence with its own
//! deadlines:
//!
//! 1. TCP dial, 3 seconds.
//! 2. Handshake exchange, 3 seconds; the echoed info hash must match.
//! 3. One message read, 5 seconds; it must be the peer's BITFIELD.
//!
//! After that the caller owns pacing: the download worker puts a 30
//! second deadline around each piece attempt via [`Client::set_deadline`].
//!
//! A client is used by exactly one worker thread and is dropped (closing
//! the socket) when that worker exits.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use log::{debug, info};

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::message::{self, Message, MESSAGE_BITFIELD};
use crate::peer::Peer;
use crate::types::{PeerId, Sha1Hash};

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// A TCP connection with one peer.
pub struct Client {
    peer: Peer,
    conn: TcpStream,
    bitfield: Bitfield,
    choked: bool,
}

impl Client {
    /// Dial `peer`, complete the handshake for `info_hash` and receive
    /// the initial bitfield. The returned client starts out choked.
    pub fn connect(peer: Peer, info_hash: Sha1Hash, peer_id: PeerId) -> Result<Client> {
        let mut conn = TcpStream::connect_timeout(&peer.socket_addr(), DIAL_TIMEOUT)?;

        complete_handshake(&mut conn, info_hash, peer_id)?;
        let bitfield = recv_bitfield(&mut conn)?;

        // Hand pacing back to the caller
        conn.set_read_timeout(None)?;
        conn.set_write_timeout(None)?;

        info!("Completed handshake with {}", peer);

        Ok(Client {
            peer,
            conn,
            bitfield,
            choked: true,
        })
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Whether the peer currently has us choked.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Whether the peer advertises piece `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Set or clear the socket read/write deadline.
    pub fn set_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        self.conn.set_read_timeout(deadline)?;
        self.conn.set_write_timeout(deadline)?;
        Ok(())
    }

    /// Read the next message from the peer. Keep-alives are returned
    /// as-is; the caller decides what to ignore.
    pub fn read_message(&mut self) -> Result<Message> {
        let message = Message::read_from(&mut self.conn)?;
        debug!("Receive {} from peer {}", message.name(), self.peer);
        Ok(message)
    }

    /// Record a CHOKE from the peer: requests will go unanswered until
    /// the next unchoke.
    pub fn read_choke(&mut self) {
        self.choked = true;
    }

    /// Record an UNCHOKE from the peer.
    pub fn read_unchoke(&mut self) {
        self.choked = false;
    }

    /// Record a HAVE from the peer, updating its bitfield.
    pub fn read_have(&mut self, message: &Message) -> Result<()> {
        let index = message::parse_have(message)?;
        self.bitfield.set_piece(index);
        Ok(())
    }

    pub fn send_unchoke(&mut self) -> Result<()> {
        self.send_message(&Message::new(message::MESSAGE_UNCHOKE))
    }

    pub fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::new(message::MESSAGE_INTERESTED))
    }

    #[allow(dead_code)]
    pub fn send_not_interested(&mut self) -> Result<()> {
        self.send_message(&Message::new(message::MESSAGE_NOT_INTERESTED))
    }

    /// Tell the peer we now own piece `index`.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        self.send_message(&Message::have(index))
    }

    /// Request `length` bytes of piece `index` starting at `begin`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send_message(&Message::request(index, begin, length))
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        debug!("Send {} to peer {}", message.name(), self.peer);
        self.conn.write_all(&message.serialize())?;
        Ok(())
    }
}

fn complete_handshake(conn: &mut TcpStream, info_hash: Sha1Hash, peer_id: PeerId) -> Result<()> {
    conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let handshake = Handshake::new(info_hash, peer_id);
    conn.write_all(&handshake.serialize())?;

    let reply = Handshake::read_from(conn)?;
    if reply.info_hash != info_hash {
        return Err(Error::protocol(format!(
            "expected info hash {:x?}, got {:x?}",
            info_hash, reply.info_hash
        )));
    }

    Ok(())
}

fn recv_bitfield(conn: &mut TcpStream) -> Result<Bitfield> {
    conn.set_read_timeout(Some(BITFIELD_TIMEOUT))?;

    let message = Message::read_from(conn)?;
    if message.id != MESSAGE_BITFIELD {
        return Err(Error::protocol(format!(
            "expected BITFIELD as first message, got {}",
            message.name()
        )));
    }

    Ok(Bitfield::new(message.payload))
}
