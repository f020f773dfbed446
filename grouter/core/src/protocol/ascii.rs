//! Memcached Ascii Protocol
//!
//! Server side: [`read_op`] decodes one client command (including the data
//! block of storage commands) and [`encode_reply`] / [`encode_get_reply`]
//! render outcomes the way memcached does.
//!
//! Client side: [`encode_request`] and [`read_reply`] speak to a memcached
//! backend on behalf of the ascii target.
//!
//! # Format
//!
//! ```text
//! get <key>*\r\n
//! gets <key>*\r\n
//! <set|add|replace|append|prepend> <key> <flags> <exptime> <bytes>\r\n<data>\r\n
//! cas <key> <flags> <exptime> <bytes> <cas>\r\n<data>\r\n
//! delete <key>\r\n
//! <incr|decr> <key> <delta>\r\n
//! version\r\n
//! quit\r\n
//! ```

use std::io;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{ProtocolError, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::error::BackendError;
use crate::request::{Command, Opcode, Outcome, Response, Status};

/// Longest command line accepted, excluding the terminator
pub const MAX_LINE_LEN: usize = 2048;

/// One decoded client operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientOp {
    /// `get`/`gets` of one or more keys
    Get {
        /// Keys in request order
        keys: Vec<Vec<u8>>,
        /// `gets`: include cas tokens in the reply
        with_cas: bool,
    },
    /// Any other single-key or keyless command
    Command(Command),
    /// Client wants the connection closed
    Quit,
    /// Command name we do not know
    Unknown(String),
}

// ============================================================================
// Server Side
// ============================================================================

/// Decode the next client operation
///
/// Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Any [`ProtocolError`]; the stream is not usable afterwards.
pub async fn read_op<R>(reader: &mut R) -> Result<Option<ClientOp>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&line)
        .map_err(|_| ProtocolError::Malformed("command line is not valid UTF-8".into()))?;

    let mut tokens = text.split_ascii_whitespace();
    let Some(name) = tokens.next() else {
        return Ok(Some(ClientOp::Unknown(String::new())));
    };
    let args: Vec<&str> = tokens.collect();

    let op = match name {
        "get" | "gets" => {
            if args.is_empty() {
                return Err(ProtocolError::Malformed(format!("{name} requires a key")));
            }
            let keys = args
                .iter()
                .map(|key| check_key(key))
                .collect::<Result<Vec<_>, _>>()?;
            ClientOp::Get {
                keys,
                with_cas: name == "gets",
            }
        }
        "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
            ClientOp::Command(read_storage(name, &args, reader).await?)
        }
        "delete" => {
            expect_args(name, &args, 1)?;
            ClientOp::Command(Command::new(Opcode::Delete).with_key(check_key(args[0])?))
        }
        "incr" | "decr" => {
            expect_args(name, &args, 2)?;
            let opcode = if name == "incr" {
                Opcode::Incr
            } else {
                Opcode::Decr
            };
            ClientOp::Command(
                Command::new(opcode)
                    .with_key(check_key(args[0])?)
                    .with_delta(parse_num(args[1], "delta")?),
            )
        }
        "version" => ClientOp::Command(Command::new(Opcode::Version)),
        "quit" => ClientOp::Quit,
        other => ClientOp::Unknown(other.to_owned()),
    };
    Ok(Some(op))
}

async fn read_storage<R>(
    name: &str,
    args: &[&str],
    reader: &mut R,
) -> Result<Command, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let with_cas = name == "cas";
    expect_args(name, args, if with_cas { 5 } else { 4 })?;

    let key = check_key(args[0])?;
    let flags: u32 = parse_num(args[1], "flags")?;
    let expiry: u32 = parse_num(args[2], "exptime")?;
    let bytes: usize = parse_num(args[3], "bytes")?;
    let cas: u64 = if with_cas {
        parse_num(args[4], "cas")?
    } else {
        0
    };
    if bytes > MAX_VALUE_LEN {
        return Err(ProtocolError::ValueTooLarge(bytes));
    }

    let mut data = vec![0u8; bytes + 2];
    reader.read_exact(&mut data).await.map_err(truncated)?;
    if !data.ends_with(b"\r\n") {
        return Err(ProtocolError::BadDataChunk);
    }
    data.truncate(bytes);

    let opcode = match name {
        "add" => Opcode::Add,
        "replace" => Opcode::Replace,
        "append" => Opcode::Append,
        "prepend" => Opcode::Prepend,
        _ => Opcode::Set,
    };
    Ok(Command::new(opcode)
        .with_key(key)
        .with_value(data)
        .with_flags(flags)
        .with_expiry(expiry)
        .with_cas(cas))
}

/// Render the reply to a `get`/`gets`
///
/// Hits become `VALUE` blocks, misses are omitted. A backend error for any
/// key turns the whole reply into a single `SERVER_ERROR` line.
pub fn encode_get_reply<'a, I>(results: I, with_cas: bool) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a [u8], Outcome)>,
{
    let mut out = Vec::new();
    for (key, outcome) in results {
        match outcome {
            Ok(response) if response.is_success() => {
                out.extend_from_slice(b"VALUE ");
                out.extend_from_slice(key);
                let header = format!(" {} {}", response.flags, response.value.len());
                out.extend_from_slice(header.as_bytes());
                if with_cas {
                    out.extend_from_slice(format!(" {}", response.cas).as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&response.value);
                out.extend_from_slice(b"\r\n");
            }
            Ok(_) => {}
            Err(e) => return server_error(&e),
        }
    }
    out.extend_from_slice(b"END\r\n");
    out
}

/// Render the reply to any command other than `get`/`gets`
pub fn encode_reply(command: &Command, outcome: &Outcome) -> Vec<u8> {
    let response = match outcome {
        Ok(response) => response,
        Err(e) => return server_error(e),
    };

    let line: &[u8] = match (command.opcode, response.status) {
        (_, Status::UnknownCommand) => b"ERROR",
        (op, Status::DeltaBadValue) if op.is_arithmetic() => {
            b"CLIENT_ERROR cannot increment or decrement non-numeric value"
        }
        (op, Status::Success) if op.is_arithmetic() => {
            let mut out = response.value.clone();
            out.extend_from_slice(b"\r\n");
            return out;
        }
        (Opcode::Version, Status::Success) => {
            let mut out = b"VERSION ".to_vec();
            out.extend_from_slice(&response.value);
            out.extend_from_slice(b"\r\n");
            return out;
        }
        (Opcode::Delete, Status::Success) => b"DELETED",
        (_, Status::Success) => b"STORED",
        (_, Status::KeyNotFound) => b"NOT_FOUND",
        (_, Status::KeyExists) => b"EXISTS",
        (_, Status::NotStored | Status::DeltaBadValue) => b"NOT_STORED",
    };

    let mut out = line.to_vec();
    out.extend_from_slice(b"\r\n");
    out
}

/// `CLIENT_ERROR` line sent before dropping a client we cannot frame
pub fn client_error(e: &ProtocolError) -> Vec<u8> {
    format!("CLIENT_ERROR {e}\r\n").into_bytes()
}

fn server_error(e: &BackendError) -> Vec<u8> {
    format!("SERVER_ERROR {e}\r\n").into_bytes()
}

// ============================================================================
// Client Side
// ============================================================================

/// Encode a command for a memcached backend
#[must_use]
pub fn encode_request(command: &Command) -> Vec<u8> {
    let key = String::from_utf8_lossy(&command.key);
    match command.opcode {
        Opcode::Get => format!("gets {key}\r\n").into_bytes(),
        op if op.is_storage() => {
            let mut out = if op == Opcode::Set && command.cas != 0 {
                format!(
                    "cas {key} {} {} {} {}\r\n",
                    command.flags,
                    command.expiry,
                    command.value.len(),
                    command.cas
                )
            } else {
                format!(
                    "{op} {key} {} {} {}\r\n",
                    command.flags,
                    command.expiry,
                    command.value.len()
                )
            }
            .into_bytes();
            out.extend_from_slice(&command.value);
            out.extend_from_slice(b"\r\n");
            out
        }
        Opcode::Delete => format!("delete {key}\r\n").into_bytes(),
        op if op.is_arithmetic() => format!("{op} {key} {}\r\n", command.delta).into_bytes(),
        _ => b"version\r\n".to_vec(),
    }
}

/// Read a memcached backend's reply to `command`
///
/// # Errors
///
/// - [`BackendError::Request`] for `SERVER_ERROR`/`CLIENT_ERROR` replies
/// - [`BackendError::Io`] / [`BackendError::Protocol`] when the connection
///   is unusable
pub async fn read_reply<R>(reader: &mut R, command: &Command) -> Result<Response, BackendError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_reply_line(reader).await?;

    if line == "ERROR" {
        return Ok(Response::new(Status::UnknownCommand));
    }
    if let Some(msg) = line
        .strip_prefix("SERVER_ERROR ")
        .or_else(|| line.strip_prefix("CLIENT_ERROR "))
    {
        if command.opcode.is_arithmetic() && msg.contains("non-numeric") {
            return Ok(Response::new(Status::DeltaBadValue));
        }
        return Err(BackendError::Request(msg.to_owned()));
    }

    let response = match command.opcode {
        Opcode::Get => return read_value(reader, &line).await,
        op if op.is_storage() => match line.as_str() {
            "STORED" => Response::success(),
            "NOT_STORED" => Response::new(Status::NotStored),
            "EXISTS" => Response::new(Status::KeyExists),
            "NOT_FOUND" => Response::new(Status::KeyNotFound),
            _ => return Err(unexpected(&line)),
        },
        Opcode::Delete => match line.as_str() {
            "DELETED" => Response::success(),
            "NOT_FOUND" => Response::new(Status::KeyNotFound),
            _ => return Err(unexpected(&line)),
        },
        op if op.is_arithmetic() => {
            let digits = line.trim_end();
            if line == "NOT_FOUND" {
                Response::new(Status::KeyNotFound)
            } else if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                Response::success().with_value(digits)
            } else {
                return Err(unexpected(&line));
            }
        }
        _ => match line.strip_prefix("VERSION ") {
            Some(version) => Response::success().with_value(version),
            None => return Err(unexpected(&line)),
        },
    };
    Ok(response)
}

async fn read_value<R>(reader: &mut R, line: &str) -> Result<Response, BackendError>
where
    R: AsyncBufRead + Unpin,
{
    if line == "END" {
        return Ok(Response::new(Status::KeyNotFound));
    }

    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() < 4 || fields[0] != "VALUE" {
        return Err(unexpected(line));
    }
    let flags: u32 = fields[2].parse().map_err(|_| unexpected(line))?;
    let bytes: usize = fields[3].parse().map_err(|_| unexpected(line))?;
    let cas: u64 = match fields.get(4) {
        Some(cas) => cas.parse().map_err(|_| unexpected(line))?,
        None => 0,
    };
    if bytes > MAX_VALUE_LEN {
        return Err(BackendError::Protocol(format!("value too large: {bytes} bytes")));
    }

    let mut data = vec![0u8; bytes + 2];
    reader.read_exact(&mut data).await?;
    if !data.ends_with(b"\r\n") {
        return Err(BackendError::Protocol("bad data chunk".into()));
    }
    data.truncate(bytes);

    let end = read_reply_line(reader).await?;
    if end != "END" {
        return Err(unexpected(&end));
    }
    Ok(Response::success()
        .with_value(data)
        .with_flags(flags)
        .with_cas(cas))
}

async fn read_reply_line<R>(reader: &mut R) -> Result<String, BackendError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await {
        Ok(Some(line)) => String::from_utf8(line)
            .map_err(|_| BackendError::Protocol("reply is not valid UTF-8".into())),
        Ok(None) => Err(BackendError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "backend closed the connection",
        ))),
        Err(ProtocolError::Io(e)) => Err(BackendError::Io(e)),
        Err(e) => Err(BackendError::Protocol(e.to_string())),
    }
}

fn unexpected(line: &str) -> BackendError {
    BackendError::Protocol(format!("unexpected reply: {line:?}"))
}

// ============================================================================
// Shared Helpers
// ============================================================================

async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LEN as u64 + 2;
    let mut line = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(if n as u64 >= limit {
            ProtocolError::LineTooLong
        } else {
            ProtocolError::Truncated
        });
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn check_key(key: &str) -> Result<Vec<u8>, ProtocolError> {
    if key.len() > MAX_KEY_LEN {
        return Err(ProtocolError::KeyTooLong);
    }
    Ok(key.as_bytes().to_vec())
}

fn expect_args(name: &str, args: &[&str], count: usize) -> Result<(), ProtocolError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(ProtocolError::Malformed(format!(
            "{name} expects {count} arguments, got {}",
            args.len()
        )))
    }
}

fn parse_num<T: FromStr>(token: &str, what: &str) -> Result<T, ProtocolError> {
    token
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("invalid {what}: {token:?}")))
}

fn truncated(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn decode(input: &[u8]) -> Result<Option<ClientOp>, ProtocolError> {
        let mut reader = input;
        read_op(&mut reader).await
    }

    #[tokio::test]
    async fn test_decode_set_with_data_block() {
        let op = decode(b"set greeting 5 60 5\r\nhello\r\n").await.unwrap();
        assert_eq!(
            op,
            Some(ClientOp::Command(
                Command::set("greeting", "hello").with_flags(5).with_expiry(60)
            ))
        );
    }

    #[tokio::test]
    async fn test_decode_cas() {
        let op = decode(b"cas k 0 0 1 99\r\nx\r\n").await.unwrap();
        assert_eq!(
            op,
            Some(ClientOp::Command(Command::set("k", "x").with_cas(99)))
        );
    }

    #[tokio::test]
    async fn test_decode_multi_get() {
        let op = decode(b"gets a b c\r\n").await.unwrap();
        assert_eq!(
            op,
            Some(ClientOp::Get {
                keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
                with_cas: true,
            })
        );
    }

    #[tokio::test]
    async fn test_decode_arithmetic_and_keyless() {
        assert_eq!(
            decode(b"incr counter 5\r\n").await.unwrap(),
            Some(ClientOp::Command(
                Command::new(Opcode::Incr).with_key("counter").with_delta(5)
            ))
        );
        assert_eq!(
            decode(b"version\n").await.unwrap(),
            Some(ClientOp::Command(Command::new(Opcode::Version)))
        );
        assert_eq!(decode(b"quit\r\n").await.unwrap(), Some(ClientOp::Quit));
        assert_eq!(
            decode(b"stats\r\n").await.unwrap(),
            Some(ClientOp::Unknown("stats".into()))
        );
    }

    #[tokio::test]
    async fn test_decode_clean_eof() {
        assert_eq!(decode(b"").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decode_framing_errors() {
        assert!(matches!(
            decode(b"set k 0 0 5\r\nhelloXX").await,
            Err(ProtocolError::BadDataChunk)
        ));
        assert!(matches!(
            decode(b"set k 0 0 5\r\nhel").await,
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode(b"get k").await,
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode(b"set k zero 0 5\r\nhello\r\n").await,
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(b"get\r\n").await,
            Err(ProtocolError::Malformed(_))
        ));

        let long_key = format!("get {}\r\n", "k".repeat(MAX_KEY_LEN + 1));
        assert!(matches!(
            decode(long_key.as_bytes()).await,
            Err(ProtocolError::KeyTooLong)
        ));

        let long_line = vec![b'a'; MAX_LINE_LEN + 10];
        assert!(matches!(
            decode(&long_line).await,
            Err(ProtocolError::LineTooLong)
        ));
    }

    #[test]
    fn test_encode_get_reply() {
        let hit = Ok(Response::success().with_value("v1").with_flags(3).with_cas(9));
        let miss = Ok(Response::new(Status::KeyNotFound));
        let reply = encode_get_reply([(&b"a"[..], hit), (&b"b"[..], miss)], false);
        assert_eq!(reply, b"VALUE a 3 2\r\nv1\r\nEND\r\n".to_vec());

        let hit = Ok(Response::success().with_value("v1").with_flags(3).with_cas(9));
        let reply = encode_get_reply([(&b"a"[..], hit)], true);
        assert_eq!(reply, b"VALUE a 3 2 9\r\nv1\r\nEND\r\n".to_vec());
    }

    #[test]
    fn test_encode_get_reply_with_backend_error() {
        let reply = encode_get_reply(
            [(&b"a"[..], Err(BackendError::Unavailable("reset".into())))],
            false,
        );
        assert_eq!(
            String::from_utf8(reply).unwrap(),
            "SERVER_ERROR backend unavailable: reset\r\n"
        );
    }

    #[test]
    fn test_encode_replies() {
        let set = Command::set("k", "v");
        let delete = Command::new(Opcode::Delete).with_key("k");
        let incr = Command::new(Opcode::Incr).with_key("k").with_delta(1);

        let cases: Vec<(&Command, Outcome, &[u8])> = vec![
            (&set, Ok(Response::success()), &b"STORED\r\n"[..]),
            (&set, Ok(Response::new(Status::NotStored)), &b"NOT_STORED\r\n"[..]),
            (&set, Ok(Response::new(Status::KeyExists)), &b"EXISTS\r\n"[..]),
            (&delete, Ok(Response::success()), &b"DELETED\r\n"[..]),
            (&delete, Ok(Response::new(Status::KeyNotFound)), &b"NOT_FOUND\r\n"[..]),
            (&incr, Ok(Response::success().with_value("42")), &b"42\r\n"[..]),
            (
                &incr,
                Ok(Response::new(Status::DeltaBadValue)),
                &b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"[..],
            ),
            (&set, Ok(Response::new(Status::UnknownCommand)), &b"ERROR\r\n"[..]),
        ];

        for (command, outcome, expected) in cases {
            assert_eq!(encode_reply(command, &outcome), expected.to_vec());
        }

        let version = Command::new(Opcode::Version);
        assert_eq!(
            encode_reply(&version, &Ok(Response::success().with_value("1.6.0"))),
            b"VERSION 1.6.0\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_requests() {
        assert_eq!(encode_request(&Command::get("k")), b"gets k\r\n".to_vec());
        assert_eq!(
            encode_request(&Command::set("k", "hello").with_flags(1)),
            b"set k 1 0 5\r\nhello\r\n".to_vec()
        );
        assert_eq!(
            encode_request(&Command::set("k", "x").with_cas(7)),
            b"cas k 0 0 1 7\r\nx\r\n".to_vec()
        );
        assert_eq!(
            encode_request(&Command::new(Opcode::Append).with_key("k").with_value("!")),
            b"append k 0 0 1\r\n!\r\n".to_vec()
        );
        assert_eq!(
            encode_request(&Command::new(Opcode::Decr).with_key("n").with_delta(3)),
            b"decr n 3\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_read_reply_value() {
        let mut reply: &[u8] = b"VALUE k 4 5 77\r\nhello\r\nEND\r\n";
        let response = read_reply(&mut reply, &Command::get("k")).await.unwrap();
        assert_eq!(
            response,
            Response::success().with_value("hello").with_flags(4).with_cas(77)
        );

        let mut reply: &[u8] = b"END\r\n";
        let response = read_reply(&mut reply, &Command::get("k")).await.unwrap();
        assert_eq!(response.status, Status::KeyNotFound);
    }

    #[tokio::test]
    async fn test_read_reply_statuses() {
        let incr = Command::new(Opcode::Incr).with_key("n").with_delta(1);
        let mut reply: &[u8] = b"11  \r\n";
        assert_eq!(
            read_reply(&mut reply, &incr).await.unwrap(),
            Response::success().with_value("11")
        );

        let mut reply: &[u8] =
            b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n";
        assert_eq!(
            read_reply(&mut reply, &incr).await.unwrap().status,
            Status::DeltaBadValue
        );

        let mut reply: &[u8] = b"SERVER_ERROR out of memory storing object\r\n";
        assert!(matches!(
            read_reply(&mut reply, &Command::set("k", "v")).await,
            Err(BackendError::Request(msg)) if msg == "out of memory storing object"
        ));
    }

    #[tokio::test]
    async fn test_read_reply_connection_lost() {
        let mut reply: &[u8] = b"";
        let err = read_reply(&mut reply, &Command::get("k")).await.unwrap_err();
        assert!(err.is_connection_lost());

        let mut reply: &[u8] = b"WHAT\r\n";
        let err = read_reply(&mut reply, &Command::set("k", "v")).await.unwrap_err();
        assert!(err.is_connection_lost());
    }
}
