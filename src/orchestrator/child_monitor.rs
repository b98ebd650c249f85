//! Kernel crash monitor: detects kernels that exit on their own.
//!
//! Periodically asks the registry to reap sessions whose process has exited
//! or whose channel has closed while idle. Busy sessions notice a dead
//! kernel on their own (the execution stream reports the closed transport),
//! so this loop covers the sessions nobody is currently talking to.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::orchestrator::registry::SessionRegistry;

/// Spawn a background task that reaps exited kernels every `interval`
/// until `cancel` fires.
#[must_use]
pub fn spawn_child_monitor(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("kernel crash monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            let reaped = registry.reap_exited().await;
            if reaped.is_empty() {
                debug!("kernel crash monitor: all kernels alive");
            } else {
                info!(count = reaped.len(), sessions = ?reaped, "reaped exited kernel sessions");
            }
        }
    })
}
