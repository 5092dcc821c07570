//! Multi-socket UDP knock listener.
//!
//! One socket is bound per port of the configured range. Each socket gets
//! its own receive loop; all loops push into one shallow queue drained by a
//! single worker, so the handler (and the tracker state behind it) is only
//! ever touched from one task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{KnockError, KnockResult};

use super::worker::{join_worker, spawn_worker, worker_lost};
use super::{shutdown_channel, KnockEvent, ListenerMetrics, Shutdown};

/// Payload is irrelevant; anything beyond this is truncated.
const RECV_BUFFER_SIZE: usize = 1500;

/// Where and how to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    /// First port to bind (inclusive).
    pub start_port: u16,
    /// Last port to bind (inclusive).
    pub end_port: u16,
    /// Capacity of the event queue between receive loops and the worker.
    pub queue_depth: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            start_port: 16000,
            end_port: 65534,
            queue_depth: 1,
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> KnockResult<()> {
        if self.start_port == 0 {
            return Err(KnockError::config("Listener start_port must not be 0"));
        }
        if self.start_port > self.end_port {
            return Err(KnockError::config(format!(
                "Invalid listener port range: start_port {} is above end_port {}",
                self.start_port, self.end_port
            )));
        }
        if self.queue_depth == 0 {
            return Err(KnockError::config("Listener queue_depth must be at least 1"));
        }
        Ok(())
    }

    /// Number of ports in the range.
    pub fn port_count(&self) -> usize {
        usize::from(self.end_port - self.start_port) + 1
    }
}

/// UDP knock listener over a port range.
pub struct KnockListener {
    sockets: Vec<(u16, UdpSocket)>,
    queue_depth: usize,
    metrics: Arc<ListenerMetrics>,
}

impl KnockListener {
    /// Bind every port of the range.
    ///
    /// Any single bind failure aborts the whole listener: a partial range
    /// would silently make some sequences impossible to complete.
    ///
    /// # Arguments
    ///
    /// * `config` - Address, port range and queue depth
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `config` is invalid ([`KnockError::Config`])
    /// - Any port cannot be bound ([`KnockError::Bind`], carrying the port);
    ///   ports bound before it are released again
    pub async fn bind(config: &ListenerConfig) -> KnockResult<Self> {
        config.validate()?;

        let mut sockets = Vec::with_capacity(config.port_count());
        for port in config.start_port..=config.end_port {
            let addr = SocketAddr::new(config.bind_address, port);
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| KnockError::Bind { port, source })?;
            sockets.push((port, socket));
        }

        info!(
            address = %config.bind_address,
            start_port = config.start_port,
            end_port = config.end_port,
            "Knock ports bound"
        );

        Ok(Self {
            sockets,
            queue_depth: config.queue_depth,
            metrics: Arc::new(ListenerMetrics::new()),
        })
    }

    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Receive on every bound port and feed `handler` until `shutdown`.
    ///
    /// On shutdown no new datagram is read, but events already queued are
    /// still delivered before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`KnockError::Listener`] if a receive loop fails or the worker
    /// dies (the handler panicked). Every receive loop is stopped first.
    pub async fn run<H>(self, handler: H, mut shutdown: Shutdown) -> KnockResult<()>
    where
        H: FnMut(KnockEvent) + Send + 'static,
    {
        let (queue, events) = mpsc::channel(self.queue_depth);
        let mut worker = spawn_worker(events, handler, Arc::clone(&self.metrics));
        let (stop, stopped) = shutdown_channel();

        let mut receivers = JoinSet::new();
        for (port, socket) in self.sockets {
            receivers.spawn(receive_loop(
                port,
                socket,
                queue.clone(),
                stopped.clone(),
                Arc::clone(&self.metrics),
            ));
        }
        drop(queue);
        info!(ports = receivers.len(), "Knock listener running");

        let stopped_by = supervise(&mut receivers, &mut shutdown, &mut worker).await;

        stop.trigger();
        while let Some(joined) = receivers.join_next().await {
            if let Some(e) = receiver_failure(joined) {
                debug!(error = %e, "Receive loop failed during shutdown");
            }
        }

        let (failure, drained) = match stopped_by {
            StoppedBy::Shutdown => (None, join_worker(worker).await),
            StoppedBy::Receiver(e) => (Some(e), join_worker(worker).await),
            StoppedBy::Worker(e) => (Some(e), Ok(())),
        };
        if let Some(e) = failure {
            return Err(e);
        }
        drained?;

        info!(
            received = self.metrics.received(),
            delivered = self.metrics.delivered(),
            "Knock listener stopped"
        );
        Ok(())
    }
}

/// Why the receive loops are being stopped.
enum StoppedBy {
    Shutdown,
    Receiver(KnockError),
    Worker(KnockError),
}

/// Wait for an external shutdown, the first failing receive loop, or the
/// worker exiting.
async fn supervise(
    receivers: &mut JoinSet<KnockResult<()>>,
    shutdown: &mut Shutdown,
    worker: &mut JoinHandle<()>,
) -> StoppedBy {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => {
                info!("Shutdown requested, stopping knock listener");
                return StoppedBy::Shutdown;
            }
            joined = &mut *worker => {
                let e = worker_lost(joined);
                error!(error = %e, "Knock worker exited, stopping all knock ports");
                return StoppedBy::Worker(e);
            }
            joined = receivers.join_next() => {
                let Some(joined) = joined else {
                    return StoppedBy::Shutdown;
                };
                if let Some(e) = receiver_failure(joined) {
                    error!(error = %e, "Receive loop failed, stopping all knock ports");
                    return StoppedBy::Receiver(e);
                }
            }
        }
    }
}

fn receiver_failure(joined: Result<KnockResult<()>, JoinError>) -> Option<KnockError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(KnockError::Listener {
            message: format!("Receive task failed: {}", e),
        }),
    }
}

async fn receive_loop(
    port: u16,
    socket: UdpSocket,
    queue: mpsc::Sender<KnockEvent>,
    mut stop: Shutdown,
    metrics: Arc<ListenerMetrics>,
) -> KnockResult<()> {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.triggered() => return Ok(()),
            received = socket.recv_from(&mut buffer) => received,
        };

        let peer = match received {
            Ok((_, peer)) => peer,
            Err(e) => {
                metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(port, error = %e, "Failed to read knock datagram");
                continue;
            }
        };
        metrics.received.fetch_add(1, Ordering::Relaxed);

        let event = KnockEvent::now(peer.ip(), port);
        tokio::select! {
            biased;
            _ = stop.triggered() => return Ok(()),
            sent = queue.send(event) => {
                if sent.is_err() {
                    return Err(KnockError::Listener {
                        message: format!("Event queue closed while listening on port {}", port),
                    });
                }
            }
        }
    }
}
