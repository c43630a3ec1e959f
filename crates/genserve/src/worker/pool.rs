//! Pool of identical model workers.
//!
//! This module defines the [`WorkerPool`] struct, which owns the workers of one
//! deployment. Requests are distributed round-robin and the pool supports
//! coordinated shutdown via a shared [`CancellationToken`].
//!
//! Every request gets a child of the pool's shutdown token, so cancelling the
//! pool halts all in-flight generations at their next token. Each worker
//! listens on its own bounded [`tokio::sync::mpsc::Receiver`], which keeps
//! workers independent without locking.

use super::{WorkerHandle, WorkerSettings};
use crate::{Error, GenerationConfig, Result, TokenSequence, bridge::StreamSender};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// How long each worker gets to acknowledge a shutdown request.
const WORKER_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// A pool of workers serving the same model.
pub struct WorkerPool {
    name: String,
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    accepting: AtomicBool,
    streams_inflight: Arc<AtomicUsize>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `num_workers` workers (at least one). Models load in the
    /// background; call [`Self::ping`] before serving traffic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] if a worker thread cannot be
    /// spawned.
    pub fn spawn(
        settings: &WorkerSettings,
        num_workers: usize,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let workers = (0..num_workers.max(1))
            .map(|id| WorkerHandle::spawn(id, settings))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            settings.name.clone(),
            workers,
            CancellationToken::new(),
            shutdown_timeout,
        ))
    }

    /// `workers` must not be empty.
    fn new(
        name: String,
        workers: Vec<WorkerHandle>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            name,
            workers,
            next_worker: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            streams_inflight: Arc::new(AtomicUsize::new(0)),
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the next worker to receive work (round-robin).
    ///
    /// Uses a relaxed atomic increment to minimize contention.
    fn next_worker(&self) -> &WorkerHandle {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    /// A fresh cancellation token for one request, cancelled automatically
    /// when the pool shuts down.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::Acquire) && !self.shutdown_token.is_cancelled() {
            Ok(())
        } else {
            Err(Error::ServiceShutdown)
        }
    }

    /// Blocking generation on the next worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once shutdown has begun, otherwise
    /// whatever [`WorkerHandle::generate`] returns.
    pub async fn generate(
        &self,
        tokens: TokenSequence,
        config: GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<TokenSequence> {
        self.ensure_accepting()?;
        self.next_worker().generate(tokens, config, cancel).await
    }

    /// Streaming generation on the next worker; returns once queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once shutdown has begun, otherwise
    /// whatever [`WorkerHandle::streaming_generate`] returns.
    pub async fn streaming_generate(
        &self,
        tokens: TokenSequence,
        config: GenerationConfig,
        sink: StreamSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.ensure_accepting()?;
        self.next_worker()
            .streaming_generate(tokens, config, sink, cancel)
            .await
    }

    /// Marks a stream as in flight until the returned guard is dropped.
    pub fn track_stream(&self) -> StreamGuard {
        self.streams_inflight.fetch_add(1, Ordering::AcqRel);
        StreamGuard {
            counter: Arc::clone(&self.streams_inflight),
        }
    }

    pub fn streams_inflight(&self) -> usize {
        self.streams_inflight.load(Ordering::Acquire)
    }

    /// Waits until every worker has loaded its model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] if any worker failed to load or
    /// did not answer within `wait`.
    pub async fn ping(&self, wait: Duration) -> Result<()> {
        let pings = self.workers.iter().map(|worker| async move {
            match timeout(wait, worker.ping()).await {
                Ok(result) => result,
                Err(_) => Err(Error::worker_unavailable(format!(
                    "worker {} did not become ready within {wait:?}",
                    worker.id()
                ))),
            }
        });
        futures::future::try_join_all(pings).await.map(|_| ())
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Refuses new requests.
    /// - Waits (up to the shutdown timeout) for in-flight streams to drain.
    /// - Cancels the shared [`CancellationToken`] to halt remaining work.
    /// - Sends a shutdown request to each worker and waits (up to 3 seconds
    ///   per worker) for acknowledgements.
    pub async fn shutdown(&self) {
        let name = &self.name;

        // === Phase 0: Stop accepting new requests ===
        tracing::info!("[{name}] Refusing new requests");
        self.accepting.store(false, Ordering::Release);

        // === Phase 1: Wait for in-flight streams to drain ===
        tracing::info!(
            "[{name}] Draining in-flight streams ({} active)",
            self.streams_inflight()
        );
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.streams_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => tracing::debug!("[{name}] All in-flight streams drained successfully"),
            Err(_) => tracing::warn!(
                "[{name}] Graceful drain timed out ({} streams still active)",
                self.streams_inflight()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        tracing::debug!("[{name}] Cancelling remaining work via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        tracing::debug!("[{name}] Notifying all workers to shut down");
        let mut acks = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            match worker.shutdown().await {
                Ok(rx) => acks.push((worker.id(), rx)),
                Err(e) => tracing::error!("[{name}] Failed to send shutdown to worker: {e}"),
            }
        }

        let waits = acks.into_iter().map(|(id, rx)| async move {
            match timeout(WORKER_ACK_TIMEOUT, rx).await {
                Ok(Ok(())) => tracing::trace!("[{name}] Worker {id} shutdown acknowledged"),
                Ok(Err(e)) => tracing::error!("[{name}] Worker {id} returned error: {e}"),
                Err(_) => tracing::warn!("[{name}] Worker {id} shutdown timed out"),
            }
        });
        futures::future::join_all(waits).await;

        tracing::info!("[{name}] Worker pool shutdown complete");
    }
}

/// Decrements the pool's in-flight stream count on drop.
#[derive(Debug)]
pub struct StreamGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
