//! Memcached Targets
//!
//! Forward requests to a remote memcached server over either wire protocol.
//! Buckets have no meaning to a plain memcached server and are not sent.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use super::{Backend, Dialer};
use crate::error::BackendError;
use crate::protocol::{ascii, binary};
use crate::request::{Command, Response};

async fn dial_tcp(addr: &str) -> Result<BufStream<TcpStream>, BackendError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(BufStream::new(stream))
}

// ============================================================================
// Ascii
// ============================================================================

/// Connection speaking the ascii protocol
#[derive(Debug)]
pub struct AsciiBackend<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite> AsciiBackend<S> {
    /// Wrap an established stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }
}

#[async_trait]
impl<S> Backend for AsciiBackend<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn execute(
        &mut self,
        _bucket: &str,
        command: &Command,
    ) -> Result<Response, BackendError> {
        self.stream.write_all(&ascii::encode_request(command)).await?;
        self.stream.flush().await?;
        ascii::read_reply(&mut self.stream, command).await
    }
}

/// Dials `HOST:PORT` for [`AsciiBackend`]s
#[derive(Clone, Debug)]
pub struct AsciiDialer {
    addr: String,
}

impl AsciiDialer {
    /// Target the server at `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for AsciiDialer {
    type Backend = AsciiBackend<TcpStream>;

    fn endpoint(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Self::Backend, BackendError> {
        Ok(AsciiBackend {
            stream: dial_tcp(&self.addr).await?,
        })
    }
}

// ============================================================================
// Binary
// ============================================================================

/// Connection speaking the binary protocol
#[derive(Debug)]
pub struct BinaryBackend<S> {
    stream: BufStream<S>,
    opaque: u32,
}

impl<S: AsyncRead + AsyncWrite> BinaryBackend<S> {
    /// Wrap an established stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            opaque: 0,
        }
    }
}

#[async_trait]
impl<S> Backend for BinaryBackend<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn execute(
        &mut self,
        _bucket: &str,
        command: &Command,
    ) -> Result<Response, BackendError> {
        self.opaque = self.opaque.wrapping_add(1);
        let opaque = self.opaque;

        self.stream
            .write_all(&binary::encode_request(command, opaque))
            .await?;
        self.stream.flush().await?;
        binary::read_response(&mut self.stream, command, opaque).await
    }
}

/// Dials `HOST:PORT` for [`BinaryBackend`]s
#[derive(Clone, Debug)]
pub struct BinaryDialer {
    addr: String,
}

impl BinaryDialer {
    /// Target the server at `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for BinaryDialer {
    type Backend = BinaryBackend<TcpStream>;

    fn endpoint(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Self::Backend, BackendError> {
        Ok(BinaryBackend {
            stream: dial_tcp(&self.addr).await?,
            opaque: 0,
        })
    }
}
