//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Errors raised by the user's code inside a kernel are **not** represented
/// here; they are folded into a successful
/// [`ExecutionResult`](crate::models::execution::ExecutionResult) with
/// `success = false`.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed or empty request input, rejected before any session work.
    Validation(String),
    /// Requested kernel session does not exist.
    NotFound(String),
    /// Kernel session is already executing another request.
    Busy(String),
    /// The session limit has been reached.
    Capacity(String),
    /// A bounded wait on the kernel expired.
    Timeout(String),
    /// The caller abandoned the request while the kernel was executing.
    Cancelled(String),
    /// The kernel process died or its channel closed unexpectedly.
    Transport(String),
    /// A kernel message could not be framed or decoded.
    Protocol(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Capacity(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Busy(msg) => write!(f, "busy: {msg}"),
            Self::Capacity(msg) => write!(f, "capacity: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
