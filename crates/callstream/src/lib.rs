#![doc = include_str!("../README.md")]

mod cancel;
mod channel;
mod config;
mod error;
mod generator;
mod idempotency;
mod orchestrator;
mod session;
mod store;
mod types;

pub use crate::cancel::*;
pub use crate::channel::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::generator::*;
pub use crate::idempotency::*;
pub use crate::orchestrator::*;
pub use crate::session::*;
pub use crate::store::*;
pub use crate::types::*;
