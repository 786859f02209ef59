//! Benchmark harness
//!
//! Runs the gRPC transport over in-memory duplex connections so dispatch
//! overhead can be measured without a network stack. A [`CallStats`] hooked
//! into the server records when each call begins and ends.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::config::RpcConfig;
use crate::error::Result;
use crate::grpc::{RpcClient, RpcTransport};
use crate::router::RouteTable;
use crate::transport::LiveTransport;

/// Buffer size of each in-memory connection
pub const MEMORY_BUFFER: usize = 256 * 1024;

/// Pending connections a [`MemoryListener`] holds before `dial` waits
const BACKLOG: usize = 16;

/// Create a connected listener/dialer pair.
pub fn memory_listener(buffer: usize) -> (MemoryListener, MemoryDialer) {
    let (tx, rx) = mpsc::channel(BACKLOG);
    (
        MemoryListener { connections: rx },
        MemoryDialer {
            connections: tx,
            buffer,
        },
    )
}

/// Server side of an in-memory connection pair
#[derive(Debug)]
pub struct MemoryListener {
    connections: mpsc::Receiver<DuplexStream>,
}

impl MemoryListener {
    pub(crate) fn into_incoming(self) -> impl Stream<Item = io::Result<DuplexStream>> {
        ReceiverStream::new(self.connections).map(Ok)
    }
}

/// Client side of an in-memory connection pair
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    connections: mpsc::Sender<DuplexStream>,
    buffer: usize,
}

impl MemoryDialer {
    /// Open a new connection to the listener.
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.buffer);
        self.connections.send(server).await.map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener closed")
        })?;
        Ok(client)
    }
}

/// Begin/end counters for served calls
#[derive(Debug, Default)]
pub struct CallStats {
    started: AtomicU64,
    finished: AtomicU64,
    busy_nanos: AtomicU64,
    finished_notify: Notify,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a call. The call ends when the timer drops.
    pub fn begin(self: &Arc<Self>) -> CallTimer {
        self.started.fetch_add(1, Ordering::Relaxed);
        CallTimer {
            stats: self.clone(),
            started_at: Instant::now(),
        }
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }

    /// Calls begun but not yet ended
    pub fn in_flight(&self) -> u64 {
        self.started().saturating_sub(self.finished())
    }

    /// Total time spent inside finished calls
    pub fn busy(&self) -> Duration {
        Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed))
    }

    /// Mean server-side latency of finished calls
    pub fn mean_latency(&self) -> Option<Duration> {
        let finished = self.finished();
        (finished > 0).then(|| Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed) / finished))
    }

    /// Wait until at least `count` calls have finished.
    pub async fn wait_for(&self, count: u64) {
        loop {
            let notified = self.finished_notify.notified();
            if self.finished() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// In-flight call marker; see [`CallStats::begin`]
#[derive(Debug)]
pub struct CallTimer {
    stats: Arc<CallStats>,
    started_at: Instant,
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed().as_nanos() as u64;
        self.stats.busy_nanos.fetch_add(elapsed, Ordering::Relaxed);
        self.stats.finished.fetch_add(1, Ordering::Release);
        self.stats.finished_notify.notify_waiters();
    }
}

/// A gRPC transport served over memory, with its dialer and stats
pub struct BenchHarness {
    transport: RpcTransport,
    dialer: MemoryDialer,
    stats: Arc<CallStats>,
}

impl BenchHarness {
    /// Start serving `routes` with the interceptors of `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(routes: Arc<RouteTable>, config: &RpcConfig) -> Self {
        let (listener, dialer) = memory_listener(MEMORY_BUFFER);
        let stats = Arc::new(CallStats::new());

        let mut transport =
            RpcTransport::with_memory_listener(config, routes, listener, Some(stats.clone()));
        transport.start();

        Self {
            transport,
            dialer,
            stats,
        }
    }

    /// Connect a new client.
    pub async fn client(&self) -> Result<RpcClient> {
        RpcClient::connect_in_memory(self.dialer.clone()).await
    }

    pub fn stats(&self) -> Arc<CallStats> {
        self.stats.clone()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.transport.stop().await
    }
}
