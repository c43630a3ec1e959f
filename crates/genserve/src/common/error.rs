//! Error types for the generation pipeline.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure between an inbound request and the model
//! runtime. The enum is `Clone` so a single failure can be forwarded through a
//! streaming channel and still be logged by the producer.
//!
//! ## Error Cases
//! - `BadRequest`: The inbound request was malformed or missing fields.
//! - `Tokenization`: The tokenizer rejected the input or output tokens.
//! - `Generation`: The model runtime failed (resource exhaustion, invalid
//!   config value, internal error).
//! - `ChannelTimeout`: A producer or consumer waited longer than the configured
//!   bound on a stream channel.
//! - `ChannelError`: An internal communication failure between tasks or
//!   workers.
//! - `WorkerUnavailable`: A worker failed to load its model or has stopped.
//! - `RequestCancelled`: The request was cancelled (client gone or shutdown)
//!   before it completed.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the generation pipeline.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The inbound request body was malformed or violated a constraint.
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    /// The tokenizer could not encode or decode.
    #[error("Tokenization failed: {reason}")]
    Tokenization { reason: String },

    /// The model runtime failed while generating.
    #[error("Generation failed: {reason}")]
    Generation { reason: String },

    /// A stream channel operation exceeded its wait bound.
    #[error("Stream channel timed out after {0:?}")]
    ChannelTimeout(Duration),

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The worker could not load its model or is no longer running.
    #[error("Worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    /// The request was cancelled before it completed.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn tokenization(reason: impl Into<String>) -> Self {
        Self::Tokenization {
            reason: reason.into(),
        }
    }

    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }

    pub fn channel(context: impl Into<String>) -> Self {
        Self::ChannelError {
            context: context.into(),
        }
    }

    pub fn worker_unavailable(reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::Tokenization { .. } => "tokenization_failure",
            Self::Generation { .. } => "generation_failure",
            Self::ChannelTimeout(_) => "channel_timeout",
            Self::ChannelError { .. } => "channel_error",
            Self::WorkerUnavailable { .. } => "worker_unavailable",
            Self::RequestCancelled => "request_cancelled",
            Self::ServiceShutdown => "service_shutdown",
        }
    }
}
