//! HTTP service implementation for model deployments.
//!
//! This module contains the logic that turns client requests into work for a
//! deployment's worker pool, and pipeline errors into HTTP responses.
//!
//! ## Structure
//!
//! - [`handler`] - Request dispatcher (`ModelService`).
//! - [`request`] - Request body parsing and validation.
//! - [`error`] - Error to HTTP status mapping.

pub mod error;
pub mod handler;
pub mod request;
