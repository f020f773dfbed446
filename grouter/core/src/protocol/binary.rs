//! Memcached Binary Protocol (client side)
//!
//! Every packet starts with a 24-byte header:
//!
//! ```text
//!  0       1       2       3
//! +-------+-------+-------+-------+
//! | magic |opcode | key length    |
//! +-------+-------+-------+-------+
//! |extlen | dtype | vbucket/status|
//! +-------+-------+-------+-------+
//! | total body length             |
//! +-------+-------+-------+-------+
//! | opaque                        |
//! +-------+-------+-------+-------+
//! | cas                           |
//! |                               |
//! +-------+-------+-------+-------+
//! ```
//!
//! followed by `extras`, `key`, and `value`, all big-endian.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::MAX_VALUE_LEN;
use crate::error::BackendError;
use crate::request::{Command, Opcode, Response, Status};

/// Magic byte of a request packet
pub const REQUEST_MAGIC: u8 = 0x80;
/// Magic byte of a response packet
pub const RESPONSE_MAGIC: u8 = 0x81;
/// Fixed header size
pub const HEADER_LEN: usize = 24;

/// Arithmetic expiration meaning "do not create missing counters"
const NO_AUTO_CREATE: u32 = 0xffff_ffff;

/// Wire opcode for a command
#[must_use]
pub fn opcode_byte(opcode: Opcode) -> u8 {
    match opcode {
        Opcode::Get => 0x00,
        Opcode::Set => 0x01,
        Opcode::Add => 0x02,
        Opcode::Replace => 0x03,
        Opcode::Delete => 0x04,
        Opcode::Incr => 0x05,
        Opcode::Decr => 0x06,
        Opcode::Noop => 0x0a,
        Opcode::Version => 0x0b,
        Opcode::Append => 0x0e,
        Opcode::Prepend => 0x0f,
    }
}

/// A decoded response packet
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    /// Wire opcode echoed by the server
    pub opcode: u8,
    /// Status code
    pub status: u16,
    /// Request correlation id echoed by the server
    pub opaque: u32,
    /// Compare-and-swap token
    pub cas: u64,
    /// Command-specific extras
    pub extras: Vec<u8>,
    /// Key (only for the *K variants)
    pub key: Vec<u8>,
    /// Value or error message
    pub value: Vec<u8>,
}

/// Encode `command` as a request packet tagged with `opaque`
#[must_use]
pub fn encode_request(command: &Command, opaque: u32) -> Vec<u8> {
    let mut extras = Vec::new();
    let mut value: &[u8] = &[];
    let mut key: &[u8] = &command.key;

    match command.opcode {
        Opcode::Set | Opcode::Add | Opcode::Replace => {
            extras.extend_from_slice(&command.flags.to_be_bytes());
            extras.extend_from_slice(&command.expiry.to_be_bytes());
            value = &command.value;
        }
        Opcode::Append | Opcode::Prepend => value = &command.value,
        Opcode::Incr | Opcode::Decr => {
            extras.extend_from_slice(&command.delta.to_be_bytes());
            extras.extend_from_slice(&0u64.to_be_bytes());
            extras.extend_from_slice(&NO_AUTO_CREATE.to_be_bytes());
        }
        Opcode::Version | Opcode::Noop => key = &[],
        Opcode::Get | Opcode::Delete => {}
    }

    let key_len = u16::try_from(key.len()).unwrap_or(u16::MAX);
    let extras_len = u8::try_from(extras.len()).unwrap_or(u8::MAX);
    let body_len = u32::try_from(extras.len() + key.len() + value.len()).unwrap_or(u32::MAX);

    let mut out = Vec::with_capacity(HEADER_LEN + body_len as usize);
    out.push(REQUEST_MAGIC);
    out.push(opcode_byte(command.opcode));
    out.extend_from_slice(&key_len.to_be_bytes());
    out.push(extras_len);
    out.push(0); // data type
    out.extend_from_slice(&0u16.to_be_bytes()); // vbucket
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&command.cas.to_be_bytes());
    out.extend_from_slice(&extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// Read one response packet
///
/// # Errors
///
/// [`BackendError::Io`] on stream failure, [`BackendError::Protocol`] on a
/// bad magic byte or inconsistent lengths.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, BackendError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    if header[0] != RESPONSE_MAGIC {
        return Err(BackendError::Protocol(format!(
            "bad response magic: 0x{:02x}",
            header[0]
        )));
    }

    let key_len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let extras_len = usize::from(header[4]);
    let status = u16::from_be_bytes([header[6], header[7]]);
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let cas = u64::from_be_bytes([
        header[16], header[17], header[18], header[19], header[20], header[21], header[22],
        header[23],
    ]);

    if extras_len + key_len > body_len || body_len > MAX_VALUE_LEN + 512 {
        return Err(BackendError::Protocol(format!(
            "bad response lengths: extras {extras_len}, key {key_len}, body {body_len}"
        )));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    let value = body.split_off(extras_len + key_len);
    let key = body.split_off(extras_len);

    Ok(Packet {
        opcode: header[1],
        status,
        opaque,
        cas,
        extras: body,
        key,
        value,
    })
}

/// Interpret a response packet as the answer to `command`
///
/// # Errors
///
/// [`BackendError::Request`] for server-side failures (out of memory, busy,
/// and so on); [`BackendError::Protocol`] for malformed extras.
pub fn to_response(command: &Command, packet: Packet) -> Result<Response, BackendError> {
    let status = match packet.status {
        0x0000 => Status::Success,
        0x0001 => Status::KeyNotFound,
        0x0002 => Status::KeyExists,
        0x0005 => Status::NotStored,
        0x0006 => Status::DeltaBadValue,
        0x0081 => Status::UnknownCommand,
        other => {
            return Err(BackendError::Request(format!(
                "status 0x{other:04x}: {}",
                String::from_utf8_lossy(&packet.value)
            )))
        }
    };
    if status != Status::Success {
        return Ok(Response::new(storage_status(command, status)));
    }

    let response = Response::success().with_cas(packet.cas);
    match command.opcode {
        Opcode::Get => {
            let flags = match packet.extras.as_slice() {
                [a, b, c, d] => u32::from_be_bytes([*a, *b, *c, *d]),
                [] => 0,
                _ => {
                    return Err(BackendError::Protocol(
                        "GET response extras must be 4 bytes".into(),
                    ))
                }
            };
            Ok(response.with_flags(flags).with_value(packet.value))
        }
        Opcode::Incr | Opcode::Decr => {
            let bytes: [u8; 8] = packet.value.as_slice().try_into().map_err(|_| {
                BackendError::Protocol("arithmetic response value must be 8 bytes".into())
            })?;
            Ok(response.with_value(u64::from_be_bytes(bytes).to_string()))
        }
        Opcode::Version => Ok(response.with_value(packet.value)),
        _ => Ok(response),
    }
}

/// The binary protocol reports a failed `add` as `KeyExists` and an
/// unconditional `replace`/`append`/`prepend` of a missing key as
/// `KeyNotFound`; clients see both as `NotStored`.
fn storage_status(command: &Command, status: Status) -> Status {
    match (command.opcode, status) {
        (Opcode::Add, Status::KeyExists) => Status::NotStored,
        (Opcode::Replace | Opcode::Append | Opcode::Prepend, Status::KeyNotFound)
            if command.cas == 0 =>
        {
            Status::NotStored
        }
        _ => status,
    }
}

/// Read the response to a request tagged `opaque`, checking correlation
///
/// # Errors
///
/// As [`read_packet`] and [`to_response`], plus [`BackendError::Protocol`]
/// if the response answers a different request.
pub async fn read_response<R>(
    reader: &mut R,
    command: &Command,
    opaque: u32,
) -> Result<Response, BackendError>
where
    R: AsyncRead + Unpin,
{
    let packet = read_packet(reader).await?;
    if packet.opaque != opaque {
        return Err(BackendError::Protocol(format!(
            "response opaque {} does not match request {opaque}",
            packet.opaque
        )));
    }
    to_response(command, packet)
}

/// Encode a response packet (used by tests and fake backends)
#[must_use]
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let body_len = packet.extras.len() + packet.key.len() + packet.value.len();
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.push(RESPONSE_MAGIC);
    out.push(packet.opcode);
    out.extend_from_slice(&u16::try_from(packet.key.len()).unwrap_or(u16::MAX).to_be_bytes());
    out.push(u8::try_from(packet.extras.len()).unwrap_or(u8::MAX));
    out.push(0);
    out.extend_from_slice(&packet.status.to_be_bytes());
    out.extend_from_slice(&u32::try_from(body_len).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(&packet.opaque.to_be_bytes());
    out.extend_from_slice(&packet.cas.to_be_bytes());
    out.extend_from_slice(&packet.extras);
    out.extend_from_slice(&packet.key);
    out.extend_from_slice(&packet.value);
    out
}

/// Decode a request header's key and opaque (used by tests and fake backends)
///
/// # Errors
///
/// [`io::Error`] if the stream ends early or the magic byte is wrong.
pub async fn read_request<R>(reader: &mut R) -> io::Result<(u8, u32, Vec<u8>, Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[0] != REQUEST_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request magic"));
    }
    let key_len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let extras_len = usize::from(header[4]);
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    if extras_len + key_len > body_len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request lengths"));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    let value = body.split_off(extras_len + key_len);
    let key = body.split_off(extras_len);
    Ok((header[1], opaque, body, key, value))
}
