//! Kernel session: one interpreter process plus its message channel.
//!
//! Lifecycle: `Starting → Idle ⇄ Busy → ShuttingDown → Dead`. Execute calls
//! are mutually exclusive per session; a second call while one is in flight
//! is rejected with [`AppError::Busy`] rather than queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{InterruptMode, SessionTimeouts};
use crate::kernel::channel::{ChannelWriter, ExecutionStream, MessageChannel, ReaderStatus};
use crate::kernel::spawner::{KernelConnection, KernelProcess};
use crate::models::execution::ExecutionResult;
use crate::models::session::{SessionInfo, SessionState};
use crate::orchestrator::aggregator::aggregate;
use crate::{AppError, Result};

/// A running kernel and everything needed to drive it.
#[derive(Debug)]
pub struct KernelSession {
    id: String,
    kernel_name: String,
    created_at: DateTime<Utc>,
    timeouts: SessionTimeouts,
    interrupt_mode: InterruptMode,
    state: StdMutex<SessionState>,
    last_activity: StdMutex<DateTime<Utc>>,
    execution_count: AtomicU64,
    /// Held for the whole of an execute call; `try_lock` failure means busy.
    channel: Mutex<MessageChannel>,
    writer: ChannelWriter,
    reader_status: ReaderStatus,
    close_token: CancellationToken,
    process: Mutex<Option<KernelProcess>>,
    shut_down: AtomicBool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl KernelSession {
    /// Connect to a freshly launched kernel and wait for it to become ready.
    ///
    /// The readiness wait is bounded by `timeouts.startup`; a kernel that
    /// stays silent for that long is still considered usable. `permit` is
    /// released when the session is dropped.
    ///
    /// # Errors
    ///
    /// [`AppError::Transport`] if the kernel's output closes before it
    /// signals readiness. The kernel process is stopped in that case.
    pub async fn start(
        id: String,
        kernel_name: String,
        connection: KernelConnection,
        timeouts: SessionTimeouts,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self> {
        let span = info_span!("start_session", session_id = %id, kernel_name = %kernel_name);

        async move {
            let KernelConnection {
                reader,
                writer,
                process,
                interrupt_mode,
            } = connection;

            let channel = MessageChannel::open(&id, reader, writer);
            let now = Utc::now();
            let session = Self {
                writer: channel.writer(),
                reader_status: channel.reader_status(),
                close_token: channel.close_token(),
                channel: Mutex::new(channel),
                id,
                kernel_name,
                created_at: now,
                timeouts,
                interrupt_mode,
                state: StdMutex::new(SessionState::Starting),
                last_activity: StdMutex::new(now),
                execution_count: AtomicU64::new(0),
                process: Mutex::new(process),
                shut_down: AtomicBool::new(false),
                _permit: permit,
            };

            let ready = session
                .channel
                .lock()
                .await
                .wait_ready(session.timeouts.startup)
                .await;

            if let Err(err) = ready {
                warn!(%err, "kernel failed to start");
                session.shutdown().await;
                return Err(err);
            }

            session.transition(SessionState::Idle);
            info!("kernel session ready");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kernel spec the session was started from.
    #[must_use]
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot for listings.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            kernel_id: self.id.clone(),
            kernel_name: self.kernel_name.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_activity: *self
                .last_activity
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            execution_count: self.execution_count.load(Ordering::Relaxed),
        }
    }

    /// Run `code` in the kernel and collect its result.
    ///
    /// Only valid from `Idle`. The session returns to `Idle` afterwards,
    /// including when the code raised (that is reported inside the result).
    /// If `cancel` fires or the execute deadline passes, the kernel is
    /// interrupted and drained; the session stays usable if it recovers.
    ///
    /// # Errors
    ///
    /// - [`AppError::Busy`] if another execute call is in flight.
    /// - [`AppError::Timeout`] / [`AppError::Cancelled`] after a successful
    ///   interrupt.
    /// - [`AppError::Transport`] if the kernel died, the session is not
    ///   running, or the kernel did not recover from an interrupt. The
    ///   session is `Dead` afterwards.
    pub async fn execute(&self, code: &str, cancel: CancellationToken) -> Result<ExecutionResult> {
        let mut channel = self.channel.try_lock().map_err(|_| {
            AppError::Busy(format!("kernel {} is busy executing another request", self.id))
        })?;

        if !self.transition(SessionState::Busy) {
            let state = self.state();
            return Err(if state.is_live() {
                AppError::Busy(format!("kernel {} is busy executing another request", self.id))
            } else {
                AppError::Transport(format!("kernel {} is not running", self.id))
            });
        }

        let execution = self.execution_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.touch();

        let span = info_span!("execute", session_id = %self.id, execution);
        let outcome = self
            .run_cell(&mut channel, code, &cancel)
            .instrument(span)
            .await;

        match &outcome {
            Err(AppError::Transport(reason)) => {
                warn!(session_id = %self.id, reason = %reason, "kernel transport failed, marking session dead");
                self.force_state(SessionState::Dead);
            }
            _ => {
                self.transition(SessionState::Idle);
            }
        }
        self.touch();
        drop(channel);

        outcome
    }

    /// Ask the kernel to abandon the code it is running.
    ///
    /// Uses `SIGINT` when the kernel spec asks for signals and a pid is known;
    /// otherwise sends an `interrupt_request` message.
    ///
    /// # Errors
    ///
    /// [`AppError::Transport`] if neither delivery path works.
    pub async fn interrupt(&self) -> Result<()> {
        if self.interrupt_mode == InterruptMode::Signal {
            let process = self.process.lock().await;
            if let Some(process) = process.as_ref().filter(|p| p.pid().is_some()) {
                debug!(session_id = %self.id, "delivering SIGINT to kernel");
                return process.signal_interrupt();
            }
        }

        debug!(session_id = %self.id, "sending interrupt_request to kernel");
        self.writer.interrupt().await
    }

    /// Stop the kernel. Valid from any state and idempotent.
    ///
    /// Sends `shutdown_request`, waits `shutdown_grace` for the process to
    /// exit, kills it otherwise, and stops the reader task.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let span = info_span!("shutdown_session", session_id = %self.id);
        async {
            if !self.transition(SessionState::ShuttingDown) {
                debug!(state = ?self.state(), "session already stopped");
            }

            let grace = self.timeouts.shutdown_grace;
            match tokio::time::timeout(grace, self.writer.request_shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(%err, "shutdown_request not delivered"),
                Err(_) => debug!("shutdown_request write timed out"),
            }

            let process = self.process.lock().await.take();
            if let Some(mut process) = process {
                process.terminate(&self.id, grace).await;
            }

            self.close_token.cancel();
            self.force_state(SessionState::Dead);
            info!("kernel session shut down");
        }
        .instrument(span)
        .await;
    }

    /// Non-blocking crash check.
    ///
    /// Returns a reason when the kernel is gone: the session is `Dead`, its
    /// process exited, or (for idle sessions) its output channel closed.
    /// Never touches the execution lock, so it cannot make a concurrent
    /// execute call look busy.
    pub async fn has_exited(&self) -> Option<String> {
        if self.state() == SessionState::Dead {
            return Some("session is dead".into());
        }

        if let Some(process) = self.process.lock().await.as_mut() {
            if let Some(reason) = process.try_exited() {
                return Some(reason);
            }
        }

        (self.state() == SessionState::Idle && self.reader_status.is_closed())
            .then(|| "kernel output closed".into())
    }

    async fn run_cell(
        &self,
        channel: &mut MessageChannel,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let deadline = Instant::now() + self.timeouts.execute;
        let mut stream = channel.send(code, deadline).await?;

        let folded = tokio::select! {
            result = aggregate(&mut stream, &self.id) => result,
            () = cancel.cancelled() => Err(AppError::Cancelled(format!(
                "caller abandoned execution on kernel {}",
                self.id
            ))),
        };

        match folded {
            Err(err @ (AppError::Timeout(_) | AppError::Cancelled(_))) => {
                warn!(error = %err, "interrupting kernel");
                self.recover(&mut stream).await?;
                Err(err)
            }
            other => other,
        }
    }

    /// Interrupt the kernel and wait for it to report idle.
    async fn recover(&self, stream: &mut ExecutionStream<'_>) -> Result<()> {
        self.interrupt()
            .await
            .map_err(|err| AppError::Transport(format!("interrupt failed: {err}")))?;

        stream
            .drain(self.timeouts.interrupt_grace)
            .await
            .map_err(|err| {
                AppError::Transport(format!("kernel did not recover after interrupt: {err}"))
            })?;

        info!("kernel recovered after interrupt");
        Ok(())
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition_to(next) {
            debug!(session_id = %self.id, from = ?*state, to = ?next, "session state change");
            *state = next;
            true
        } else {
            false
        }
    }

    fn force_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }
}
