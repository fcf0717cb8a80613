//! # Peer Wire Messages
//!
//! Framing and payload helpers for the BitTorrent peer wire protocol.
//! Every message on the wire is length-prefixed:
//!
//! ```text
//! <length: u32><id: u8><payload: [u8; length - 1]>
//! ```
//!
//! A frame with length zero is a keep-alive and carries no id or
//! payload. All integers are big-endian.
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | availability bits |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
/// Sentinel id for a zero-length keep-alive frame.
pub const MESSAGE_KEEPALIVE: MessageId = 255;

// No legal message comes close to this: a PIECE frame tops out at a
// 16 KiB block plus 9 bytes of headers. Anything larger is a peer
// misbehaving and gets the connection dropped.
const MESSAGE_SIZE_MAX: u32 = 2 * 1024 * 1024;

/// A single peer wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message without a payload.
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    /// Build a keep-alive.
    pub fn keep_alive() -> Message {
        Message::new(MESSAGE_KEEPALIVE)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.id == MESSAGE_KEEPALIVE
    }

    /// Build a HAVE message announcing ownership of piece `index`.
    pub fn have(index: u32) -> Message {
        Message::new_with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec())
    }

    /// Build a REQUEST for `length` bytes of piece `index` at offset
    /// `begin`.
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// Build a PIECE message carrying a block of data.
    #[allow(dead_code)]
    pub fn piece(index: u32, begin: u32, data: &[u8]) -> Message {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        Message::new_with_payload(MESSAGE_PIECE, payload)
    }

    /// Serialize the message into its length-prefixed wire form. A
    /// keep-alive serializes to the bare four-byte zero prefix.
    pub fn serialize(&self) -> Vec<u8> {
        if self.is_keep_alive() {
            return vec![0; 4];
        }

        let message_len = 1 + self.payload.len();
        let mut buf = Vec::with_capacity(4 + message_len);

        buf.extend_from_slice(&(message_len as u32).to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Read one message from a stream.
    ///
    /// A zero length prefix yields the keep-alive sentinel without
    /// reading any further bytes for that frame. A prefix above the
    /// frame cap or a stream that ends mid-frame is an error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message> {
        let message_len = reader.read_u32::<BigEndian>()?;

        if message_len == 0 {
            return Ok(Message::keep_alive());
        }
        if message_len > MESSAGE_SIZE_MAX {
            return Err(Error::protocol(format!(
                "message length {} exceeds the {} byte cap",
                message_len, MESSAGE_SIZE_MAX
            )));
        }

        let mut buf = vec![0; message_len as usize];
        reader.read_exact(&mut buf)?;

        Ok(Message {
            id: buf[0],
            payload: buf[1..].to_vec(),
        })
    }

    /// Human-readable message name for logging.
    pub fn name(&self) -> &'static str {
        match self.id {
            MESSAGE_CHOKE => "CHOKE",
            MESSAGE_UNCHOKE => "UNCHOKE",
            MESSAGE_INTERESTED => "INTERESTED",
            MESSAGE_NOT_INTERESTED => "NOT_INTERESTED",
            MESSAGE_HAVE => "HAVE",
            MESSAGE_BITFIELD => "BITFIELD",
            MESSAGE_REQUEST => "REQUEST",
            MESSAGE_PIECE => "PIECE",
            MESSAGE_CANCEL => "CANCEL",
            MESSAGE_KEEPALIVE => "KEEP_ALIVE",
            _ => "UNKNOWN",
        }
    }
}

/// Extract the piece index from a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE {
        return Err(Error::protocol(format!(
            "expected HAVE (id {}), got id {}",
            MESSAGE_HAVE, message.id
        )));
    }
    if message.payload.len() != 4 {
        return Err(Error::protocol(format!(
            "expected HAVE payload of 4 bytes, got {}",
            message.payload.len()
        )));
    }

    let index = Cursor::new(&message.payload).read_u32::<BigEndian>()?;
    Ok(index)
}

/// Extract (index, begin, length) from a REQUEST message.
#[allow(dead_code)]
pub fn parse_request(message: &Message) -> Result<(u32, u32, u32)> {
    if message.id != MESSAGE_REQUEST {
        return Err(Error::protocol(format!(
            "expected REQUEST (id {}), got id {}",
            MESSAGE_REQUEST, message.id
        )));
    }
    if message.payload.len() != 12 {
        return Err(Error::protocol(format!(
            "expected REQUEST payload of 12 bytes, got {}",
            message.payload.len()
        )));
    }

    let mut cursor = Cursor::new(&message.payload);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()?;
    Ok((index, begin, length))
}

/// Copy the block carried by a PIECE message into `buf` at the offset
/// the message declares, returning the number of bytes copied.
///
/// The block must belong to `expected_index` and must fit inside `buf`;
/// a block ending exactly at `buf.len()` is accepted, since the last
/// block of a piece does exactly that.
pub fn parse_piece(message: &Message, expected_index: u32, buf: &mut [u8]) -> Result<usize> {
    if message.id != MESSAGE_PIECE {
        return Err(Error::protocol(format!(
            "expected PIECE (id {}), got id {}",
            MESSAGE_PIECE, message.id
        )));
    }
    if message.payload.len() < 8 {
        return Err(Error::protocol(format!(
            "PIECE payload too short, expected 8+ bytes, got {}",
            message.payload.len()
        )));
    }

    let mut cursor = Cursor::new(&message.payload[..8]);
    let index = cursor.read_u32::<BigEndian>()?;
    if index != expected_index {
        return Err(Error::protocol(format!(
            "expected piece index {}, got {}",
            expected_index, index
        )));
    }

    let begin = cursor.read_u32::<BigEndian>()? as usize;
    if begin >= buf.len() {
        return Err(Error::protocol(format!(
            "block offset {} too high for piece of {} bytes",
            begin,
            buf.len()
        )));
    }

    let data = &message.payload[8..];
    if begin + data.len() > buf.len() {
        return Err(Error::protocol(format!(
            "block of {} bytes at offset {} overflows piece of {} bytes",
            data.len(),
            begin,
            buf.len()
        )));
    }

    buf[begin..begin + data.len()].copy_from_slice(data);
    Ok(data.len())
}
