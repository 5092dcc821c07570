//! The single consumer of the event queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::error::{KnockError, KnockResult};

use super::KnockEvent;

/// Counters shared between the receive loops and the worker.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    /// Datagrams read from the knock sockets or the capture stream.
    pub received: AtomicU64,
    /// Per-datagram read or parse failures that were skipped.
    pub dropped: AtomicU64,
    /// Events handed to the handler.
    pub delivered: AtomicU64,
}

impl ListenerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

/// Spawn the task that owns `handler` and feeds it every queued event, in
/// queue order. It finishes once every sender is dropped and the queue is
/// drained.
pub(crate) fn spawn_worker<H>(
    mut events: mpsc::Receiver<KnockEvent>,
    mut handler: H,
    metrics: Arc<ListenerMetrics>,
) -> JoinHandle<()>
where
    H: FnMut(KnockEvent) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handler(event);
            metrics.delivered.fetch_add(1, Ordering::Relaxed);
        }
        debug!(delivered = metrics.delivered(), "Knock worker drained");
    })
}

/// Wait for the worker, turning a panic in the handler into an error.
pub(crate) async fn join_worker(worker: JoinHandle<()>) -> KnockResult<()> {
    worker.await.map_err(worker_failure)
}

/// Error for a worker that exited while producers were still running.
pub(crate) fn worker_lost(joined: Result<(), JoinError>) -> KnockError {
    match joined {
        Err(e) => worker_failure(e),
        Ok(()) => KnockError::Listener {
            message: "Knock worker stopped while events were still expected".to_string(),
        },
    }
}

fn worker_failure(e: JoinError) -> KnockError {
    KnockError::Listener {
        message: format!("Knock worker failed: {}", e),
    }
}
