//! Routing Queue
//!
//! The bounded FIFO of [`Batch`]es connecting sources to targets, and the
//! router's only backpressure point.
//!
//! - [`QueueSender::submit`] waits while the queue is full, so a slow target
//!   set throttles every source.
//! - [`QueueReceiver::take`] waits while the queue is empty. Any number of
//!   targets may take concurrently; each batch goes to exactly one of them.
//!
//! Both halves are cheap to clone. The queue is created once by the
//! dispatcher and lives as long as any clone of either half.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::{QueueClosed, RouterError};
use crate::request::Batch;

/// Create a routing queue holding at most `capacity` batches
///
/// # Errors
///
/// Returns [`RouterError::InvalidQueueCapacity`] if `capacity` is zero.
pub fn routing_queue(capacity: usize) -> Result<(QueueSender, QueueReceiver), RouterError> {
    if capacity == 0 {
        return Err(RouterError::InvalidQueueCapacity);
    }

    let (tx, rx) = mpsc::channel(capacity);
    Ok((
        QueueSender { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    ))
}

/// Producer half, held by sources
#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<Batch>,
}

impl QueueSender {
    /// Enqueue a batch, waiting for room if the queue is full
    ///
    /// Empty batches carry no work and are not enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] when every receiver is gone. The batch is
    /// dropped, which resolves each request's pending response to
    /// "no response".
    pub async fn submit(&self, batch: Batch) -> Result<(), QueueClosed> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx.send(batch).await.map_err(|_| QueueClosed)
    }

    /// Fixed capacity in batches
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Free slots right now
    #[must_use]
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, held by targets
#[derive(Clone, Debug)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
}

impl QueueReceiver {
    /// Take the next batch in FIFO order, waiting while the queue is empty
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    /// Cancel-safe: dropping the future never loses a batch.
    pub async fn take(&self) -> Option<Batch> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}
