//! Kernel session lifecycle model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a kernel session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process spawned, waiting for the readiness signal.
    Starting,
    /// Ready to accept an execute call.
    Idle,
    /// An execute call is in flight.
    Busy,
    /// Shutdown requested; the process is being stopped.
    ShuttingDown,
    /// Process gone; the session can never run code again.
    Dead,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Any live state may drop straight to `Dead` when the transport fails.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Idle)
                | (Self::Idle, Self::Busy)
                | (Self::Busy, Self::Idle)
                | (
                    Self::Starting | Self::Idle | Self::Busy,
                    Self::ShuttingDown | Self::Dead
                )
                | (Self::ShuttingDown, Self::Dead)
        )
    }

    /// Whether the session still owns a usable kernel.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Idle | Self::Busy)
    }
}

/// Point-in-time snapshot of a session, as reported by listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub kernel_id: String,
    /// Kernel spec the session was started from.
    pub kernel_name: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session last started or finished an execute call.
    pub last_activity: DateTime<Utc>,
    /// Number of execute calls submitted to the kernel.
    pub execution_count: u64,
}
