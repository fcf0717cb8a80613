//! Crate-wide error type.
//!
//! One variant per failure class: `Parse` and `Tracker` are fatal at
//! startup, `Io` and `Protocol` cost a worker its connection, and
//! `Integrity` is recoverable (the piece goes back on the queue).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("piece {index} failed integrity check")]
    Integrity { index: u32 },

    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("could not parse torrent: {0}")]
    Parse(String),
}

impl Error {
    /// Shorthand for a protocol violation with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    /// Shorthand for a tracker failure with a formatted message.
    pub fn tracker(msg: impl Into<String>) -> Error {
        Error::Tracker(msg.into())
    }
}
