#![doc = include_str!("../README.md")]
//!
//! ## Module Overview
//!
//! - [`server`] - Configuration, telemetry and the HTTP routes over the
//!   [`callstream::Orchestrator`].
//! - [`client`] - Async client for a running server, used by the
//!   `callstream-client` binary.

pub mod client;
pub mod server;
