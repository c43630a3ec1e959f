//! Streaming response plumbing.
//!
//! - [`coordinator`] - Turns a worker's stream channel into the cumulative
//!   text chunks of an HTTP response body.

pub mod coordinator;
