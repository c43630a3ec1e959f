//! Server-side components of `genserve-server`.
//!
//! ## Submodules
//!
//! - [`config`] - Command line options and the deployment model table.
//! - [`deployment`] - Starts deployments, gates them on readiness and binds
//!   them to their ports.
//! - [`service`] - HTTP request dispatcher for one deployment.
//! - [`streaming`] - Forwarding of streamed text into response bodies.
//! - [`telemetry`] - Logging initialization and optional OpenTelemetry export.
//!
//! These components are wired together in the server's `main.rs`.

pub mod config;
pub mod deployment;
pub mod service;
pub mod streaming;
pub mod telemetry;
