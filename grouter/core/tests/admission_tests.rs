//! Admission Control Tests
//!
//! Verify the connection cap end to end over real TCP sockets:
//! - Never more than `max_conns` sources active at once
//! - Waiting clients are admitted as slots free up
//! - A full router answers the (N+1)th client only after a close
//! - A broken listener ends admission, not the admitted connections

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use grouter_core::{
    accept_conns, routing_queue, Connection, Dispatcher, Listener, QueueSender, Registry,
    RouterConfig, RouterError, Source, SourceError,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// How long a client waits before concluding it was not admitted
const NOT_ADMITTED: Duration = Duration::from_millis(200);

/// Tracks concurrently running sources
#[derive(Default)]
struct ResourceTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    served: AtomicUsize,
}

impl ResourceTracker {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Greets the client, then holds the slot until the client hangs up
struct HoldingSource {
    tracker: Arc<ResourceTracker>,
}

#[async_trait]
impl Source for HoldingSource {
    fn name(&self) -> &'static str {
        "holding"
    }

    async fn run<C: Connection>(
        &self,
        mut conn: C,
        _queue: QueueSender,
    ) -> Result<(), SourceError> {
        self.tracker.enter();
        let result = async {
            conn.write_all(b"ok").await?;
            let mut sink = Vec::new();
            conn.read_to_end(&mut sink).await?;
            Ok(())
        }
        .await;
        self.tracker.exit();
        result
    }
}

/// Echoes whatever the client writes until it hangs up
struct EchoSource;

#[async_trait]
impl Source for EchoSource {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run<C: Connection>(
        &self,
        mut conn: C,
        _queue: QueueSender,
    ) -> Result<(), SourceError> {
        let mut buf = [0u8; 64];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write_all(&buf[..n]).await?;
        }
    }
}

/// Hands out one in-memory connection, then fails for good
struct BrokenListener {
    first: Option<DuplexStream>,
    accepts: Arc<AtomicUsize>,
}

#[async_trait]
impl Listener for BrokenListener {
    type Io = DuplexStream;
    type Addr = &'static str;

    async fn accept(&mut self) -> io::Result<(DuplexStream, &'static str)> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        match self.first.take() {
            Some(conn) => Ok((conn, "pipe")),
            None => Err(io::Error::other("listener socket closed")),
        }
    }
}

/// Whether the server greeted `client` within [`NOT_ADMITTED`]
async fn admitted(client: &mut TcpStream) -> bool {
    let mut greeting = [0u8; 2];
    matches!(
        tokio::time::timeout(NOT_ADMITTED, client.read_exact(&mut greeting)).await,
        Ok(Ok(_))
    )
}

async fn read_reply(client: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    client.read_exact(&mut buf).await.unwrap();
    buf
}

// =============================================================================
// Admission Controller
// =============================================================================

#[tokio::test]
async fn test_max_conns_caps_active_sources() {
    let max_conns = 3;
    let extra = 2;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, _rx) = routing_queue(1).unwrap();
    let tracker = Arc::new(ResourceTracker::default());
    let cancel = CancellationToken::new();

    let controller = tokio::spawn(accept_conns(
        listener,
        max_conns,
        Arc::new(HoldingSource {
            tracker: Arc::clone(&tracker),
        }),
        tx,
        cancel.clone(),
    ));

    let mut clients = Vec::new();
    for _ in 0..max_conns + extra {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }

    let mut admitted_clients = Vec::new();
    let mut waiting_clients = Vec::new();
    for mut client in clients {
        if admitted(&mut client).await {
            admitted_clients.push(client);
        } else {
            waiting_clients.push(client);
        }
    }
    assert_eq!(admitted_clients.len(), max_conns);
    assert_eq!(waiting_clients.len(), extra);
    assert_eq!(tracker.active.load(Ordering::SeqCst), max_conns);

    // Each close admits exactly one waiting client.
    for _ in 0..extra {
        drop(admitted_clients.remove(0));
        let mut now_admitted = None;
        for (i, client) in waiting_clients.iter_mut().enumerate() {
            if admitted(client).await {
                now_admitted = Some(i);
                break;
            }
        }
        let i = now_admitted.expect("a waiting client should be admitted after a close");
        admitted_clients.push(waiting_clients.remove(i));
    }

    assert_eq!(tracker.served.load(Ordering::SeqCst), max_conns + extra);
    assert_eq!(tracker.peak.load(Ordering::SeqCst), max_conns);

    cancel.cancel();
    controller.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_stops_admission_but_not_active_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, _rx) = routing_queue(1).unwrap();
    let tracker = Arc::new(ResourceTracker::default());
    let cancel = CancellationToken::new();

    let controller = tokio::spawn(accept_conns(
        listener,
        2,
        Arc::new(HoldingSource {
            tracker: Arc::clone(&tracker),
        }),
        tx,
        cancel.clone(),
    ));

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(admitted(&mut client).await);

    cancel.cancel();
    controller.await.unwrap().unwrap();

    // The admitted source is still running and still holds its slot.
    assert_eq!(tracker.active.load(Ordering::SeqCst), 1);
    drop(client);
    for _ in 0..50 {
        if tracker.active.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(tracker.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_listener_failure_ends_admission_but_not_admitted_connections() {
    let (mut client, server) = duplex(64);
    let accepts = Arc::new(AtomicUsize::new(0));
    let listener = BrokenListener {
        first: Some(server),
        accepts: Arc::clone(&accepts),
    };
    let (tx, _rx) = routing_queue(1).unwrap();

    let cancel = CancellationToken::new();
    let result = accept_conns(listener, 2, Arc::new(EchoSource), tx, cancel).await;
    assert!(matches!(result, Err(RouterError::Accept(_))), "got {result:?}");
    assert_eq!(accepts.load(Ordering::SeqCst), 2, "listener retried after failing");

    // The connection admitted before the failure is still served.
    client.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("admitted connection stopped being served")
        .unwrap();
    assert_eq!(&echoed, b"still here");
}

// =============================================================================
// End to End
// =============================================================================

#[tokio::test]
async fn test_third_client_waits_for_a_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RouterConfig {
        source: format!("memcached-ascii:{addr}"),
        source_max_conns: 2,
        target: "memory".into(),
        ..RouterConfig::default()
    };
    let dispatcher = Dispatcher::new(config, &Registry::builtin()).unwrap();
    let cancel = CancellationToken::new();
    let router = tokio::spawn(dispatcher.run_on(listener, cancel.clone()));

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    for client in [&mut first, &mut second] {
        client.write_all(b"get k\r\n").await.unwrap();
        assert_eq!(read_reply(client, 5).await, b"END\r\n");
    }

    let mut third = TcpStream::connect(addr).await.unwrap();
    third.write_all(b"get k\r\n").await.unwrap();
    let mut byte = [0u8; 1];
    assert!(
        tokio::time::timeout(NOT_ADMITTED, third.read_exact(&mut byte))
            .await
            .is_err(),
        "third client answered while both slots were taken"
    );

    drop(first);
    let mut rest = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), third.read_exact(&mut rest))
        .await
        .expect("third client should be served after a close")
        .unwrap();
    assert_eq!(&rest, b"END\r\n");

    // The second client was never disturbed.
    second.write_all(b"version\r\n").await.unwrap();
    let mut version = [0u8; 8];
    second.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, b"VERSION ");

    cancel.cancel();
    router.await.unwrap().unwrap();
}
