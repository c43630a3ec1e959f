//! Model workers.
//!
//! A worker is a dedicated OS thread that owns exactly one loaded model and
//! executes generation requests one at a time. The dispatcher talks to it only
//! through message passing ([`WorkRequest`]) with plain-data payloads, so the
//! worker could sit behind any other transport without changing callers.
//!
//! ## Structure
//!
//! - [`WorkerHandle`] - Cloneable sender side of one worker.
//! - [`WorkerPool`] - Round-robin pool of identical workers with graceful
//!   shutdown.
//! - `thread` - The worker loop itself.
//! - `processor` - Blocking and streaming request execution.

mod pool;
mod processor;
mod request;
mod thread;

#[cfg(test)]
mod tests;

pub use pool::{StreamGuard, WorkerPool};
pub use request::WorkRequest;

use crate::{
    Error, GenerationConfig, Result, TokenSequence,
    bridge::StreamSender,
    runtime::{LoadOptions, RuntimeLoader},
    stop::StopCondition,
    tokenizer::Tokenizer,
};
use processor::Context;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Everything needed to start the workers of one deployment.
#[derive(Clone)]
pub struct WorkerSettings {
    /// Used in thread names and logs.
    pub name: String,
    pub load: LoadOptions,
    pub loader: Arc<dyn RuntimeLoader>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub stop: Arc<StopCondition>,
    /// Omit the prompt from streamed text.
    pub skip_prompt: bool,
    /// Requests that may wait in each worker's queue.
    pub queue_capacity: usize,
}

/// Sender side of one worker thread.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    id: usize,
    tx: mpsc::Sender<WorkRequest>,
}

impl WorkerHandle {
    /// Spawns a worker thread. The model is loaded on that thread; use
    /// [`Self::ping`] to wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] if the thread cannot be spawned.
    pub fn spawn(id: usize, settings: &WorkerSettings) -> Result<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let loader = Arc::clone(&settings.loader);
        let options = settings.load.clone();
        let context = Context {
            tokenizer: Arc::clone(&settings.tokenizer),
            stop: Arc::clone(&settings.stop),
            skip_prompt: settings.skip_prompt,
        };

        std::thread::Builder::new()
            .name(format!("{}-worker-{id}", settings.name))
            .spawn(move || thread::worker_loop(id, rx, loader, options, context))
            .map_err(|e| Error::worker_unavailable(format!("failed to spawn worker {id}: {e}")))?;

        Ok(Self { id, tx })
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    /// Runs generation to completion and returns the full token sequence
    /// (prompt prefix included).
    ///
    /// # Errors
    ///
    /// - [`Error::Generation`] if the runtime fails; no partial output.
    /// - [`Error::RequestCancelled`] if `cancel` fired first.
    /// - [`Error::WorkerUnavailable`] if the worker is not serving.
    pub async fn generate(
        &self,
        tokens: TokenSequence,
        config: GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<TokenSequence> {
        let (response, rx) = oneshot::channel();
        self.send(WorkRequest::Generate {
            tokens,
            config,
            cancel,
            response,
        })
        .await?;
        rx.await.map_err(|_| self.dropped())?
    }

    /// Queues a streaming generation and returns immediately.
    ///
    /// Completion is observed only through the receiver paired with `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] if the worker is not running.
    pub async fn streaming_generate(
        &self,
        tokens: TokenSequence,
        config: GenerationConfig,
        sink: StreamSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.send(WorkRequest::Stream {
            tokens,
            config,
            cancel,
            sink,
        })
        .await
    }

    /// Resolves once the worker has loaded its model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] carrying the load failure.
    pub async fn ping(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(WorkRequest::Ping { response }).await?;
        rx.await.map_err(|_| self.dropped())?
    }

    /// Asks the worker to exit after its current request.
    pub async fn shutdown(&self) -> Result<oneshot::Receiver<()>> {
        let (response, rx) = oneshot::channel();
        self.send(WorkRequest::Shutdown { response }).await?;
        Ok(rx)
    }

    async fn send(&self, request: WorkRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::worker_unavailable(format!("worker {} has stopped", self.id)))
    }

    fn dropped(&self) -> Error {
        Error::worker_unavailable(format!("worker {} dropped the request", self.id))
    }
}
