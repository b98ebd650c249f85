#![forbid(unsafe_code)]

//! `kernel-gateway`: run code in persistent interpreter sessions.
//!
//! A [`SessionRegistry`](orchestrator::registry::SessionRegistry) owns one
//! kernel subprocess per session and serialises execute calls against it;
//! the [`api`] module puts an HTTP surface over the registry.

pub mod api;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod models;
pub mod orchestrator;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
