//! Server-side components of `callstream-server`.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration.
//! - [`service`] - HTTP routes, handlers and error mapping over the
//!   [`callstream::Orchestrator`].
//! - [`telemetry`] - `tracing-subscriber` initialization.

pub mod config;
pub mod service;
pub mod telemetry;
