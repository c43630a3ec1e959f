use crate::{GenerationConfig, Result, TokenSequence, bridge::StreamSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Messages accepted by a worker thread.
///
/// Every payload is owned data so a request can cross the thread boundary
/// without sharing mutable state with the dispatcher.
#[derive(Debug)]
pub enum WorkRequest {
    /// Run to completion and reply with the full token sequence.
    Generate {
        tokens: TokenSequence,
        config: GenerationConfig,
        cancel: CancellationToken,
        response: oneshot::Sender<Result<TokenSequence>>,
    },
    /// Stream decoded text into `sink`, ending with an end marker on success.
    Stream {
        tokens: TokenSequence,
        config: GenerationConfig,
        cancel: CancellationToken,
        sink: StreamSender,
    },
    /// Reply once the model has loaded (or with the load failure).
    Ping {
        response: oneshot::Sender<Result<()>>,
    },
    /// Acknowledge and exit the worker loop.
    Shutdown { response: oneshot::Sender<()> },
}
