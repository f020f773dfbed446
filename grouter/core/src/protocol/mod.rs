//! Memcached Wire Protocols
//!
//! Codecs between the router's [`Command`](crate::request::Command) /
//! [`Response`](crate::request::Response) model and memcached wire formats:
//!
//! - [`ascii`]: the text protocol, both the server side (used by the ascii
//!   source to talk to clients) and the client side (used by the ascii
//!   target to talk to a backend)
//! - [`binary`]: the binary protocol, client side only (used by the binary
//!   target)

pub mod ascii;
pub mod binary;

use std::io;

use thiserror::Error;

/// Longest key memcached accepts
pub const MAX_KEY_LEN: usize = 250;

/// Largest value a client may store (memcached's default item size)
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Framing errors while decoding client input
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Stream I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Command line exceeded the line limit without a terminator
    #[error("line too long")]
    LineTooLong,

    /// Stream ended in the middle of a command
    #[error("unexpected end of stream")]
    Truncated,

    /// Key longer than [`MAX_KEY_LEN`]
    #[error("key too long")]
    KeyTooLong,

    /// Value longer than [`MAX_VALUE_LEN`]
    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// Data block not followed by `\r\n`
    #[error("bad data chunk")]
    BadDataChunk,

    /// Command line does not parse
    #[error("bad command line format: {0}")]
    Malformed(String),
}
