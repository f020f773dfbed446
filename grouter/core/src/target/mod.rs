//! Targets
//!
//! The consuming side of the routing queue. A [`TargetWorker`] owns one
//! backend connection, takes batches off the queue and answers every request
//! in each batch exactly once.
//!
//! ```text
//!   QueueReceiver ──take()──► TargetWorker ──execute()──► Backend
//!                                 │   ▲
//!                   lost conn ────┘   └──── Backoff::connect(Dialer::dial)
//! ```
//!
//! Backends plug in through two traits:
//!
//! - [`Dialer`]: knows how to open a connection to one endpoint
//! - [`Backend`]: an open connection that executes one command at a time
//!
//! Per-request failures reach the source through the request's response
//! channel and never abort a batch. A lost connection fails the current
//! request, marks the rest of the batch unavailable, and is re-established
//! through the backoff connector before the next batch is taken.

pub mod memcached;
pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{BackendError, RouterError};
use crate::queue::QueueReceiver;
use crate::request::{Batch, Command, Response};

pub use memcached::{AsciiBackend, AsciiDialer, BinaryBackend, BinaryDialer};
pub use memory::{MemoryBackend, MemoryDialer, MemoryStore};

/// An open backend connection
#[async_trait]
pub trait Backend: Send {
    /// Execute one command against `bucket`
    ///
    /// Errors for which [`BackendError::is_connection_lost`] holds leave the
    /// connection unusable; anything else concerns this command only.
    async fn execute(&mut self, bucket: &str, command: &Command) -> Result<Response, BackendError>;
}

/// Opens [`Backend`] connections to one endpoint
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connection type produced by [`Dialer::dial`]
    type Backend: Backend + 'static;

    /// Endpoint description for logs
    fn endpoint(&self) -> &str;

    /// Open one connection
    async fn dial(&self) -> Result<Self::Backend, BackendError>;
}

/// The connection carrying a batch went away
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionLost(pub String);

/// Execute every request of `batch` in order, answering each exactly once
///
/// # Errors
///
/// Returns [`ConnectionLost`] if the backend connection broke. The failing
/// request got the underlying error; every later request of the batch got
/// [`BackendError::Unavailable`].
pub async fn execute_batch<B>(backend: &mut B, batch: Batch) -> Result<(), ConnectionLost>
where
    B: Backend + ?Sized,
{
    let mut requests = batch.into_iter();
    while let Some(request) = requests.next() {
        let outcome = backend.execute(&request.bucket, &request.command).await;

        let lost = match &outcome {
            Err(e) if e.is_connection_lost() => Some(e.to_string()),
            _ => None,
        };
        request.respond(outcome);

        if let Some(reason) = lost {
            for rest in requests {
                rest.respond(Err(BackendError::Unavailable(reason.clone())));
            }
            return Err(ConnectionLost(reason));
        }
    }
    Ok(())
}

/// One consumer of the routing queue bound to one backend connection
pub struct TargetWorker<D> {
    id: usize,
    dialer: D,
    backoff: Backoff,
}

impl<D: Dialer> TargetWorker<D> {
    /// Create worker `id` connecting through `dialer`
    pub fn new(id: usize, dialer: D) -> Self {
        Self {
            id,
            dialer,
            backoff: Backoff::default(),
        }
    }

    /// Use a custom reconnect policy
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Connect, then drain `queue` until it closes or `cancel` fires
    ///
    /// Cancellation is observed while connecting and between batches; a
    /// batch that was already taken is always answered in full.
    ///
    /// # Errors
    ///
    /// None today: the loop ends with `Ok` on queue close or cancellation.
    /// The `Result` leaves room for fatal backend failures.
    pub async fn run(
        self,
        queue: QueueReceiver,
        cancel: CancellationToken,
    ) -> Result<(), RouterError> {
        let endpoint = self.dialer.endpoint().to_owned();
        info!(worker = self.id, endpoint = %endpoint, "Target worker starting");

        let Some(mut backend) = self.connect(&cancel).await? else {
            return Ok(());
        };

        loop {
            let batch = tokio::select! {
                () = cancel.cancelled() => {
                    info!(worker = self.id, "Target worker cancelled");
                    return Ok(());
                }
                batch = queue.take() => batch,
            };
            let Some(batch) = batch else {
                info!(worker = self.id, "Routing queue closed; target worker exiting");
                return Ok(());
            };

            debug!(worker = self.id, requests = batch.len(), "Executing batch");
            if let Err(ConnectionLost(reason)) = execute_batch(&mut backend, batch).await {
                warn!(
                    worker = self.id,
                    endpoint = %endpoint,
                    error = %reason,
                    "Backend connection lost; reconnecting"
                );
                backend = match self.connect(&cancel).await? {
                    Some(backend) => backend,
                    None => return Ok(()),
                };
            }
        }
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Option<D::Backend>, RouterError> {
        let dialer = &self.dialer;
        match self
            .backoff
            .connect(dialer.endpoint(), |_| dialer.dial(), cancel)
            .await
        {
            Ok(backend) => {
                info!(worker = self.id, endpoint = %dialer.endpoint(), "Connected to backend");
                Ok(Some(backend))
            }
            Err(RouterError::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::queue::routing_queue;
    use crate::request::{Request, Status};

    /// Backend answering from a script; `None` means "connection dropped"
    struct ScriptedBackend {
        script: Arc<Mutex<VecDeque<Option<Response>>>>,
        executed: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn execute(
            &mut self,
            _bucket: &str,
            command: &Command,
        ) -> Result<Response, BackendError> {
            self.executed.lock().unwrap().push(command.key.clone());
            match self.script.lock().unwrap().pop_front() {
                Some(Some(response)) => Ok(response),
                Some(None) => Err(BackendError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "reset by peer",
                ))),
                None => Ok(Response::success()),
            }
        }
    }

    struct ScriptedDialer {
        script: Arc<Mutex<VecDeque<Option<Response>>>>,
        executed: Arc<Mutex<Vec<Vec<u8>>>>,
        failures_before_success: usize,
        dials: Arc<AtomicUsize>,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Option<Response>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                executed: Arc::new(Mutex::new(Vec::new())),
                failures_before_success: 0,
                dials: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        type Backend = ScriptedBackend;

        fn endpoint(&self) -> &str {
            "scripted"
        }

        async fn dial(&self) -> Result<ScriptedBackend, BackendError> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                return Err(BackendError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            Ok(ScriptedBackend {
                script: Arc::clone(&self.script),
                executed: Arc::clone(&self.executed),
            })
        }
    }

    fn batch(keys: &[&str]) -> (Batch, Vec<crate::request::PendingResponse>) {
        keys.iter()
            .map(|key| Request::new("default", Command::get(*key)))
            .unzip()
    }

    #[tokio::test]
    async fn test_connection_loss_answers_rest_of_batch() {
        let dialer = ScriptedDialer::new(vec![
            Some(Response::success().with_value("a")),
            None,
            Some(Response::success()),
        ]);
        let mut backend = dialer.dial().await.unwrap();
        let (requests, pending) = batch(&["a", "b", "c", "d"]);

        let result = execute_batch(&mut backend, requests).await;
        assert!(matches!(result, Err(ConnectionLost(reason)) if reason.contains("reset by peer")));

        let mut outcomes = Vec::new();
        for p in pending {
            outcomes.push(p.wait().await);
        }
        assert_eq!(outcomes[0].as_ref().unwrap().value, b"a");
        assert!(matches!(outcomes[1], Err(BackendError::Io(_))));
        assert!(matches!(outcomes[2], Err(BackendError::Unavailable(_))));
        assert!(matches!(outcomes[3], Err(BackendError::Unavailable(_))));

        // Nothing after the failure reached the backend.
        assert_eq!(dialer.executed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_request_errors_do_not_abort_batch() {
        struct Picky;

        #[async_trait]
        impl Backend for Picky {
            async fn execute(
                &mut self,
                _: &str,
                command: &Command,
            ) -> Result<Response, BackendError> {
                if command.key == b"bad" {
                    Err(BackendError::Request("out of memory".into()))
                } else {
                    Ok(Response::new(Status::KeyNotFound))
                }
            }
        }

        let (requests, pending) = batch(&["bad", "good"]);
        execute_batch(&mut Picky, requests).await.unwrap();

        let mut pending = pending.into_iter();
        assert!(matches!(
            pending.next().unwrap().wait().await,
            Err(BackendError::Request(_))
        ));
        assert_eq!(
            pending.next().unwrap().wait().await.unwrap().status,
            Status::KeyNotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reconnects_after_loss() {
        let mut dialer = ScriptedDialer::new(vec![None]);
        dialer.failures_before_success = 2;
        let dials = Arc::clone(&dialer.dials);

        let (tx, rx) = routing_queue(2).unwrap();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(TargetWorker::new(0, dialer).run(rx, cancel.clone()));

        let (first, first_pending) = batch(&["x", "y"]);
        tx.submit(first).await.unwrap();
        let mut first_pending = first_pending.into_iter();
        assert!(first_pending.next().unwrap().wait().await.is_err());
        assert!(matches!(
            first_pending.next().unwrap().wait().await,
            Err(BackendError::Unavailable(_))
        ));

        let (second, second_pending) = batch(&["z"]);
        tx.submit(second).await.unwrap();
        for p in second_pending {
            assert!(p.wait().await.unwrap().is_success());
        }

        // Two refused dials, the first connection, and the reconnect.
        assert_eq!(dials.load(Ordering::SeqCst), 4);

        drop(tx);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_on_cancel_while_dialing() {
        let mut dialer = ScriptedDialer::new(Vec::new());
        dialer.failures_before_success = usize::MAX;

        let (_tx, rx) = routing_queue(1).unwrap();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(TargetWorker::new(0, dialer).run(rx, cancel.clone()));

        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_closes() {
        let (tx, rx) = routing_queue(1).unwrap();
        drop(tx);
        TargetWorker::new(3, ScriptedDialer::new(Vec::new()))
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
    }
}
