//! # APM Extension Core
//!
//! Core components of the Elastic APM extension for AWS Lambda. The
//! extension runs as a sidecar process inside the function's sandbox,
//! receives intake payloads from the in-function APM agent over loopback
//! HTTP, and forwards them to the APM server without stretching the
//! function's observable latency.
//!
//! ## Architecture
//!
//! - [`lifecycle`]: client of the Lambda Extensions API (register / next /
//!   error reports)
//! - [`receiver`]: loopback HTTP server accepting agent intake payloads
//! - [`transport`]: buffered, health-tracked client of the APM server
//! - [`logsapi`]: Lambda Logs API subscription, receiver, and platform
//!   metrics synthesis
//! - [`coordinator`]: the per-invocation state machine tying it together
//! - [`metadata`]: process-lifetime cache of the agent's metadata line

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod logsapi;
pub mod metadata;
pub mod receiver;
pub mod transport;

/// Version reported in the extension's own telemetry and logs.
pub const EXTENSION_VERSION: &str = env!("CARGO_PKG_VERSION");
