//! Domain model module declarations.

pub mod api;
pub mod execution;
pub mod session;
