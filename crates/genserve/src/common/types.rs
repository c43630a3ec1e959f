//! # Shared Token Types and Defaults
//!
//! This module defines the plain-data types that cross the boundary between a
//! request dispatcher and a model worker. Everything here is owned data (no
//! shared mutable objects) so a request can be moved onto a worker thread.
//!
//! ## Type Aliases
//!
//! - [`TokenId`] - A single vocabulary id
//! - [`TokenSequence`] - An ordered sequence of token ids
//! - [`StopSequence`] - A token sequence whose appearance at the tail of the
//!   output halts generation
//! - [`GenerationConfig`] - Opaque, string-keyed generation options forwarded
//!   verbatim to the model runtime
//!
//! ## Constants
//!
//! - [`DEFAULT_STREAM_BUFFER_SIZE`] - Default capacity of a per-request stream
//!   channel
//! - [`DEFAULT_QUEUE_CAPACITY`] - Default number of requests queued per worker

/// A single vocabulary id.
pub type TokenId = u32;

/// An ordered sequence of token ids, produced by tokenization.
pub type TokenSequence = Vec<TokenId>;

/// One configured stop phrase in token form.
pub type StopSequence = Vec<TokenId>;

/// Generation options taken from the request body.
///
/// The dispatcher never interprets these values; only the model runtime does.
pub type GenerationConfig = serde_json::Map<String, serde_json::Value>;

/// Number of text fragments buffered between a worker and its consumer before
/// the worker must wait.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 64;

/// Number of requests that may wait in a worker's queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
