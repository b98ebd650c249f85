//! HTTP API: the outer surface over the session registry.
//!
//! - `handlers`: request handlers and the shared [`handlers::AppState`].
//! - `error`: mapping from [`AppError`](crate::AppError) to HTTP responses.
//! - `server`: router construction and the axum serve loop.

pub mod error;
pub mod handlers;
pub mod server;
