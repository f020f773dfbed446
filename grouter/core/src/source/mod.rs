//! Sources
//!
//! The producing side of the routing queue. A source turns client operations
//! into [`Request`](crate::request::Request)s, submits them in batches and
//! writes each response back in the order the client asked.
//!
//! - [`AsciiSource`]: serves one memcached ascii client connection
//! - [`WorkloadSource`]: a synthetic load generator with no clients at all

pub mod ascii;
pub mod workload;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SourceError;
use crate::queue::QueueSender;

pub use ascii::AsciiSource;
pub use workload::WorkloadSource;

/// A duplex client byte stream
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A source that serves accepted client connections
///
/// One instance is shared by every connection task the admission controller
/// spawns, so per-connection state lives inside [`Source::run`].
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Serve `conn` until the client goes away or sends something unframeable
    async fn run<C: Connection>(&self, conn: C, queue: QueueSender) -> Result<(), SourceError>;
}
