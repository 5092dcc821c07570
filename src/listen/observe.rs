//! Passive knock observation from a packet capture stream.
//!
//! Instead of binding the knock ports, the daemon can be fed datagram
//! metadata by a capture collaborator (pcap, eBPF, ...) that already filters
//! for UDP. Events go through the same single-worker queue as the socket
//! listener.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{KnockError, KnockResult};

use super::worker::{join_worker, spawn_worker, worker_lost};
use super::{CapturedDatagram, KnockEvent, ListenerMetrics, Shutdown};

/// Forwards captured datagrams to a single handler.
pub struct CaptureObserver {
    queue_depth: usize,
    metrics: Arc<ListenerMetrics>,
}

impl Default for CaptureObserver {
    fn default() -> Self {
        Self {
            queue_depth: 1,
            metrics: Arc::new(ListenerMetrics::new()),
        }
    }
}

impl CaptureObserver {
    pub fn new(queue_depth: usize) -> KnockResult<Self> {
        if queue_depth == 0 {
            return Err(KnockError::config("Capture queue_depth must be at least 1"));
        }
        Ok(Self {
            queue_depth,
            ..Self::default()
        })
    }

    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Consume `capture` until it ends or `shutdown` is triggered.
    ///
    /// Datagrams whose source does not parse as an IP address are skipped.
    /// Events already queued are delivered before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`KnockError::Listener`] if the worker dies (the handler
    /// panicked), even when no further datagram arrives.
    pub async fn run<H>(
        self,
        mut capture: mpsc::Receiver<CapturedDatagram>,
        handler: H,
        mut shutdown: Shutdown,
    ) -> KnockResult<()>
    where
        H: FnMut(KnockEvent) + Send + 'static,
    {
        let (queue, events) = mpsc::channel(self.queue_depth);
        let mut worker = spawn_worker(events, handler, Arc::clone(&self.metrics));
        info!("Observing captured knock datagrams");

        let mut failure = None;
        let mut lost = None;
        loop {
            let datagram = tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    info!("Shutdown requested, stopping capture observer");
                    break;
                }
                joined = &mut worker => {
                    let e = worker_lost(joined);
                    error!(error = %e, "Knock worker exited, stopping capture observer");
                    lost = Some(e);
                    break;
                }
                datagram = capture.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => {
                        info!("Capture stream ended");
                        break;
                    }
                },
            };
            self.metrics.received.fetch_add(1, Ordering::Relaxed);

            let event = match KnockEvent::try_from(datagram) {
                Ok(event) => event,
                Err(e) => {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Skipping captured datagram without a usable source");
                    continue;
                }
            };

            if queue.send(event).await.is_err() {
                failure = Some(KnockError::Listener {
                    message: "Event queue closed while observing capture".to_string(),
                });
                break;
            }
        }

        drop(queue);
        let drained = match lost {
            Some(e) => Err(e),
            None => join_worker(worker).await,
        };
        if let Some(e) = failure {
            return Err(e);
        }
        drained?;

        info!(
            received = self.metrics.received(),
            delivered = self.metrics.delivered(),
            "Capture observer stopped"
        );
        Ok(())
    }
}
