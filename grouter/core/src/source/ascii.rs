//! Memcached Ascii Source
//!
//! Reads one command at a time, submits it as one batch (a multi-key `get`
//! becomes one request per key), waits for every response and writes the
//! reply before reading the next command. Replies therefore leave in the
//! order their commands arrived.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::{Connection, Source};
use crate::error::SourceError;
use crate::protocol::ascii::{self, ClientOp};
use crate::protocol::ProtocolError;
use crate::queue::QueueSender;
use crate::request::{Batch, Command, Request};

/// Bucket used when none is configured
pub const DEFAULT_BUCKET: &str = "default";

/// Serves memcached ascii clients
#[derive(Clone, Debug)]
pub struct AsciiSource {
    bucket: String,
}

impl Default for AsciiSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AsciiSource {
    /// Create a source routing every request to the default bucket
    #[must_use]
    pub fn new() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_owned(),
        }
    }

    /// Route requests to `bucket` instead
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Serve one client over any duplex stream
    ///
    /// # Errors
    ///
    /// - [`SourceError::Protocol`] when the client sent something that
    ///   cannot be framed (after a best-effort `CLIENT_ERROR` reply)
    /// - [`SourceError::Io`] when the stream fails
    /// - [`SourceError::QueueClosed`] when no target is left
    pub async fn serve<S>(&self, stream: S, queue: &QueueSender) -> Result<(), SourceError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        loop {
            let op = match ascii::read_op(&mut reader).await {
                Ok(Some(op)) => op,
                Ok(None) => {
                    debug!("Client closed connection");
                    return Ok(());
                }
                Err(ProtocolError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    let reply = ascii::client_error(&e);
                    if let Err(write_err) = write_reply(&mut writer, &reply).await {
                        debug!(error = %write_err, "Could not send CLIENT_ERROR");
                    }
                    return Err(e.into());
                }
            };

            let reply = match op {
                ClientOp::Quit => return Ok(()),
                ClientOp::Unknown(name) => {
                    debug!(command = %name, "Unknown command");
                    b"ERROR\r\n".to_vec()
                }
                ClientOp::Get { keys, with_cas } => self.get(keys, with_cas, queue).await?,
                ClientOp::Command(command) => {
                    let shape = Command::new(command.opcode);
                    let (request, pending) = Request::new(self.bucket.clone(), command);
                    queue.submit(vec![request]).await?;
                    ascii::encode_reply(&shape, &pending.wait().await)
                }
            };

            write_reply(&mut writer, &reply).await?;
        }
    }

    async fn get(
        &self,
        keys: Vec<Vec<u8>>,
        with_cas: bool,
        queue: &QueueSender,
    ) -> Result<Vec<u8>, SourceError> {
        let (batch, pending): (Batch, Vec<_>) = keys
            .iter()
            .map(|key| Request::new(self.bucket.clone(), Command::get(key.clone())))
            .unzip();
        queue.submit(batch).await?;

        let mut results = Vec::with_capacity(keys.len());
        for (key, pending) in keys.iter().zip(pending) {
            results.push((key.as_slice(), pending.wait().await));
        }
        Ok(ascii::encode_get_reply(results, with_cas))
    }
}

async fn write_reply<W>(writer: &mut W, reply: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply).await?;
    writer.flush().await
}

#[async_trait]
impl Source for AsciiSource {
    fn name(&self) -> &'static str {
        "memcached-ascii"
    }

    async fn run<C: Connection>(&self, conn: C, queue: QueueSender) -> Result<(), SourceError> {
        self.serve(conn, &queue).await
    }
}
