//! Kernel session registry.
//!
//! The one piece of shared mutable state across requests: a map from session
//! id to [`KernelSession`]. The map lock is only held for lookups and
//! inserts, never across a kernel start or an execution. Fresh ids are
//! minted per call (UUID v4), so two concurrent anonymous requests always
//! get two distinct sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{GlobalConfig, SessionTimeouts};
use crate::kernel::launcher::KernelLauncher;
use crate::models::execution::ExecutionResult;
use crate::models::session::{SessionInfo, SessionState};
use crate::orchestrator::session::KernelSession;
use crate::{AppError, Result};

/// Shown to callers who send a run request without code.
pub const EMPTY_CODE_HINT: &str = "The request did not include any code to run. \
Send a JSON body such as {\"kernel_id\": \"<id from a previous response>\", \"code\": \"print('hello world')\"}; \
omit kernel_id to start a new kernel.";

/// Tunables for a [`SessionRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Kernel spec used when a request does not name one.
    pub default_kernel: String,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Bounded waits applied to every session.
    pub timeouts: SessionTimeouts,
}

impl RegistryConfig {
    /// Derive registry settings from the global configuration.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            default_kernel: config.default_kernel.clone(),
            max_sessions: usize::try_from(config.max_sessions).unwrap_or(usize::MAX),
            timeouts: config.timeouts.session_timeouts(),
        }
    }
}

/// Process-wide mapping from session id to running kernel.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<KernelSession>>>,
    launcher: Arc<dyn KernelLauncher>,
    capacity: Arc<Semaphore>,
    config: RegistryConfig,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("available_slots", &self.capacity.available_permits())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: Arc::new(Semaphore::new(config.max_sessions)),
            launcher,
            config,
        }
    }

    /// Start a new session from `kernel_name` (or the default kernel spec).
    ///
    /// # Errors
    ///
    /// - [`AppError::Validation`] if the kernel spec is unknown.
    /// - [`AppError::Capacity`] if the session limit is reached.
    /// - [`AppError::Transport`] if the kernel cannot be started.
    pub async fn start(&self, kernel_name: Option<&str>) -> Result<Arc<KernelSession>> {
        let kernel_name = kernel_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.config.default_kernel)
            .to_owned();

        if !self.launcher.has_kernel(&kernel_name) {
            return Err(AppError::Validation(format!(
                "unknown kernel spec '{kernel_name}'"
            )));
        }

        let permit = Arc::clone(&self.capacity).try_acquire_owned().map_err(|_| {
            AppError::Capacity(format!(
                "session limit of {} reached; shut down an existing kernel first",
                self.config.max_sessions
            ))
        })?;

        let session_id = Uuid::new_v4().to_string();
        let connection = self.launcher.launch(&kernel_name, &session_id).await?;
        let session = Arc::new(
            KernelSession::start(
                session_id.clone(),
                kernel_name,
                connection,
                self.config.timeouts,
                Some(permit),
            )
            .await?,
        );

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            drop(sessions);
            session.shutdown().await;
            return Err(AppError::Transport(format!(
                "session id collision for {session_id}"
            )));
        }
        sessions.insert(session_id.clone(), Arc::clone(&session));
        let live = sessions.len();
        drop(sessions);

        info!(session_id = %session_id, kernel_name = session.kernel_name(), live, "kernel session registered");
        Ok(session)
    }

    /// Look up a session by id.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if no session has that id.
    pub async fn get(&self, session_id: &str) -> Result<Arc<KernelSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("kernel {session_id} not found")))
    }

    /// Return the session for `session_id`, or start one when no id is given.
    ///
    /// An empty id counts as absent. A non-empty id that the registry never
    /// issued (or has since removed) is an error; it never silently starts a
    /// new session under that name.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for unknown ids; see [`SessionRegistry::start`]
    /// for creation failures.
    pub async fn get_or_create(&self, session_id: Option<&str>) -> Result<Arc<KernelSession>> {
        match session_id.filter(|id| !id.is_empty()) {
            Some(id) => self.get(id).await,
            None => self.start(None).await,
        }
    }

    /// Validate, resolve the session, and run `code` in it.
    ///
    /// A session whose transport failed during the call is evicted, so the
    /// next request for it fails with [`AppError::NotFound`].
    ///
    /// # Errors
    ///
    /// - [`AppError::Validation`] for empty code, before any session work.
    /// - Lookup/creation errors from [`SessionRegistry::get_or_create`].
    /// - Execution errors from [`KernelSession::execute`].
    pub async fn execute(
        &self,
        session_id: Option<&str>,
        code: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        if code.is_empty() {
            return Err(AppError::Validation(EMPTY_CODE_HINT.into()));
        }

        let session = self.get_or_create(session_id).await?;
        let outcome = session.execute(code, cancel).await;

        if session.state() == SessionState::Dead {
            warn!(session_id = session.id(), "evicting dead kernel session");
            self.evict(session.id()).await;
        }

        outcome
    }

    /// Shut a session down and forget it.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if no session has that id.
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("kernel {session_id} not found")))?;

        session.shutdown().await;
        info!(session_id, "kernel session removed");
        Ok(())
    }

    /// Interrupt whatever a session is running.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for unknown ids, [`AppError::Transport`] if the
    /// interrupt cannot be delivered.
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.get(session_id).await?.interrupt().await
    }

    /// Snapshots of every registered session, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Evict every session whose kernel has exited on its own.
    ///
    /// Returns the ids that were evicted.
    pub async fn reap_exited(&self) -> Vec<String> {
        let snapshot: Vec<Arc<KernelSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut reaped = Vec::new();
        for session in snapshot {
            if let Some(reason) = session.has_exited().await {
                warn!(session_id = session.id(), reason = %reason, "kernel exited unexpectedly");
                self.evict(session.id()).await;
                reaped.push(session.id().to_owned());
            }
        }
        reaped
    }

    /// Shut down every session (server shutdown).
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<KernelSession>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        let count = drained.len();
        for session in drained {
            session.shutdown().await;
        }
        info!(count, "all kernel sessions shut down");
    }

    /// Remove and shut down a session if it is still registered.
    async fn evict(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            session.shutdown().await;
        }
    }
}
