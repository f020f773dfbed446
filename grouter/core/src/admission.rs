//! Connection Admission Controller
//!
//! Owns a listener and bounds the number of simultaneously active source
//! connections.
//!
//! ```text
//!   accept task ──accepted──►┐
//!                            │  admission loop        ┌──► connection task ──► Source::run
//!                            ├─ active < max: both ───┤            │
//!   connection tasks ─closed─┘  active == max: closed └────────────┘ closed (always, even on panic)
//! ```
//!
//! While every slot is taken the loop only listens for closes; new clients
//! wait in the accept backlog. A failing source never takes the controller
//! down: its slot is freed and nothing is retried.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::RouterError;
use crate::queue::QueueSender;
use crate::source::{Connection, Source};

/// Unique identifier for an accepted connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Where the admission controller takes its connections from
#[async_trait]
pub trait Listener: Send + 'static {
    /// Accepted connection
    type Io: Connection;
    /// Peer address, for logs
    type Addr: fmt::Display + Send + 'static;

    /// Wait for the next client
    ///
    /// An error means the listener is unusable; it is not called again.
    async fn accept(&mut self) -> io::Result<(Self::Io, Self::Addr)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(&*self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, %peer, "Could not set TCP_NODELAY");
        }
        Ok((stream, peer))
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Bind a TCP listener on `addr` (`HOST:PORT`; an empty host means every
/// interface)
///
/// # Errors
///
/// [`RouterError::Bind`] if the socket cannot be created.
pub async fn bind(addr: &str) -> Result<TcpListener, RouterError> {
    let resolved = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    };

    let listener = TcpListener::bind(&resolved)
        .await
        .map_err(|source| RouterError::Bind {
            addr: resolved.clone(),
            source,
        })?;
    info!(addr = %resolved, "Listening for connections");
    Ok(listener)
}

/// Accept connections on `listener`, running `source` on each, with at most
/// `max_conns` active at once
///
/// Returns `Ok(())` when `cancel` fires. Connections already admitted keep
/// being served either way.
///
/// # Errors
///
/// [`RouterError::Accept`] once the listener fails; no further connections
/// can be admitted.
pub async fn accept_conns<L, S>(
    listener: L,
    max_conns: usize,
    source: Arc<S>,
    queue: QueueSender,
    cancel: CancellationToken,
) -> Result<(), RouterError>
where
    L: Listener,
    S: Source,
{
    let max_conns = max_conns.max(1);
    info!(max_conns, source = source.name(), "Accepting connections");

    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
    let (closed_tx, mut closed_rx) = mpsc::channel::<ConnectionId>(max_conns);
    let accept_task = tokio::spawn(accept_loop(listener, accepted_tx));

    let mut active_conns: usize = 0;
    let result = loop {
        if active_conns < max_conns {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                accepted = accepted_rx.recv() => {
                    let (stream, peer) = match accepted {
                        Some(Ok(conn)) => conn,
                        Some(Err(e)) => break Err(RouterError::Accept(e)),
                        None => {
                            let ended = io::Error::other("accept task ended");
                            break Err(RouterError::Accept(ended));
                        }
                    };
                    active_conns += 1;
                    let conn_id = ConnectionId::new();
                    info!(conn_id = %conn_id, %peer, active_conns, "Connection accepted");
                    spawn_connection(
                        conn_id,
                        stream,
                        Arc::clone(&source),
                        queue.clone(),
                        closed_tx.clone(),
                    );
                }
                Some(conn_id) = closed_rx.recv() => {
                    active_conns -= 1;
                    debug!(conn_id = %conn_id, active_conns, "Connection slot freed");
                }
            }
        } else {
            info!(active_conns, "Reached max conns; waiting for a close");
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                Some(conn_id) = closed_rx.recv() => {
                    active_conns -= 1;
                    debug!(conn_id = %conn_id, active_conns, "Connection slot freed");
                }
            }
        }
    };

    accept_task.abort();
    match &result {
        Ok(()) => info!(active_conns, "Admission stopped"),
        Err(e) => error!(error = %e, active_conns, "Can't accept more connections"),
    }
    result
}

async fn accept_loop<L: Listener>(
    mut listener: L,
    accepted: mpsc::Sender<io::Result<(L::Io, L::Addr)>>,
) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                if accepted.send(Ok(conn)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                let _ = accepted.send(Err(e)).await;
                return;
            }
        }
    }
}

fn spawn_connection<C: Connection, S: Source>(
    conn_id: ConnectionId,
    stream: C,
    source: Arc<S>,
    queue: QueueSender,
    closed: mpsc::Sender<ConnectionId>,
) {
    // The inner task owns the stream; a panic there drops it and surfaces
    // here as a JoinError, so the close is published exactly once.
    let served = tokio::spawn(
        async move { source.run(stream, queue).await }
            .instrument(info_span!("connection", %conn_id)),
    );

    tokio::spawn(async move {
        match served.await {
            Ok(Ok(())) => info!(conn_id = %conn_id, "Connection closed"),
            Ok(Err(e)) => warn!(conn_id = %conn_id, error = %e, "Connection ended with error"),
            Err(e) if e.is_panic() => error!(conn_id = %conn_id, "Connection task panicked"),
            Err(e) => warn!(conn_id = %conn_id, error = %e, "Connection task cancelled"),
        }
        let _ = closed.send(conn_id).await;
    });
}
