//! Message channel adapter for one kernel.
//!
//! A background reader task decodes the kernel's stdout with
//! [`KernelCodec`], parses each line into a [`KernelMessage`], and forwards
//! it over a bounded [`mpsc`] channel. When the kernel's stdout closes (or
//! the reader is cancelled) the sender is dropped, so every pending receive
//! observes the closed channel instead of blocking forever.
//!
//! [`MessageChannel::send`] writes one `execute_request` and hands back an
//! [`ExecutionStream`]: an explicit pull loop bounded by a deadline that
//! yields only the messages whose parent id matches the request, and ends at
//! the matching `status: idle`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kernel::codec::KernelCodec;
use crate::kernel::message::{
    parse_inbound_line, ExecutionMessage, ExecutionState, KernelMessage, OutboundMessage,
};
use crate::{AppError, Result};

/// Capacity of the reader → consumer message queue.
const INBOX_CAPACITY: usize = 256;

/// Boxed write half of a kernel transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of a kernel transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ── Writer ────────────────────────────────────────────────────────────────────

/// Cloneable handle for writing messages to a kernel.
///
/// Shared between the execute path and out-of-band control messages
/// (interrupt, shutdown) so those can be sent while an execution holds the
/// channel's inbox.
#[derive(Clone)]
pub struct ChannelWriter {
    session_id: Arc<str>,
    inner: Arc<Mutex<BoxedWriter>>,
}

impl fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ChannelWriter {
    fn new(session_id: &str, writer: BoxedWriter) -> Self {
        Self {
            session_id: Arc::from(session_id),
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Serialize `message` as one NDJSON line and write it to the kernel.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] if serialization fails.
    /// - [`AppError::Transport`]`("write failed: …")` if the kernel's input
    ///   is closed.
    pub async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let mut bytes = serde_json::to_vec(&message.body)
            .map_err(|e| AppError::Protocol(format!("failed to serialise outbound message: {e}")))?;
        bytes.push(b'\n');

        let mut writer = self.inner.lock().await;
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            warn!(session_id = %self.session_id, error = %e, "kernel channel: write failed");
            AppError::Transport(format!("write failed: {e}"))
        })
    }

    /// Send an `interrupt_request` on the control channel.
    ///
    /// # Errors
    ///
    /// Propagates [`ChannelWriter::send`] failures.
    pub async fn interrupt(&self) -> Result<()> {
        self.send(&OutboundMessage::interrupt_request(&self.session_id))
            .await
    }

    /// Send a `shutdown_request` on the control channel.
    ///
    /// # Errors
    ///
    /// Propagates [`ChannelWriter::send`] failures.
    pub async fn request_shutdown(&self) -> Result<()> {
        self.send(&OutboundMessage::shutdown_request(&self.session_id))
            .await
    }
}

// ── Reader status ─────────────────────────────────────────────────────────────

/// Shared flag set once a channel's reader task has stopped.
///
/// Lets observers such as the crash monitor see that the kernel's output
/// closed without locking the channel itself.
#[derive(Debug, Clone, Default)]
pub struct ReaderStatus(Arc<AtomicBool>);

impl ReaderStatus {
    /// Whether the reader has stopped (EOF, read error, or cancellation).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.0.store(true, Ordering::Release);
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Bidirectional message channel to one kernel.
pub struct MessageChannel {
    session_id: String,
    writer: ChannelWriter,
    inbox: mpsc::Receiver<KernelMessage>,
    cancel: CancellationToken,
    status: ReaderStatus,
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("session_id", &self.session_id)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MessageChannel {
    /// Wrap a kernel's stdio and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<R, W>(session_id: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let cancel = CancellationToken::new();
        let status = ReaderStatus::default();
        tokio::spawn(run_reader(
            session_id.to_owned(),
            reader,
            tx,
            cancel.clone(),
            status.clone(),
        ));

        Self {
            session_id: session_id.to_owned(),
            writer: ChannelWriter::new(session_id, Box::new(writer)),
            inbox,
            cancel,
            status,
        }
    }

    /// Handle for out-of-band writes.
    #[must_use]
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Token that stops the reader task when cancelled.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle for observing reader shutdown without holding the channel.
    #[must_use]
    pub fn reader_status(&self) -> ReaderStatus {
        self.status.clone()
    }

    /// Wait for the kernel's first message, whatever it is.
    ///
    /// Returns `Ok(true)` when a message arrived and `Ok(false)` when the
    /// wait timed out; kernels that are slow to announce themselves are still
    /// treated as ready.
    ///
    /// # Errors
    ///
    /// [`AppError::Transport`] if the kernel's output closes first.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(first)) => {
                debug!(
                    session_id = %self.session_id,
                    message = ?first.message,
                    "kernel emitted ready signal"
                );
                Ok(true)
            }
            Ok(None) => Err(AppError::Transport(
                "kernel exited before signalling readiness".into(),
            )),
            Err(_elapsed) => {
                warn!(
                    session_id = %self.session_id,
                    ?timeout,
                    "kernel did not signal readiness in time, assuming ready"
                );
                Ok(false)
            }
        }
    }

    /// Submit `code` and return the stream of messages it produces.
    ///
    /// # Errors
    ///
    /// [`AppError::Transport`] if the request cannot be written.
    pub async fn send(&mut self, code: &str, deadline: Instant) -> Result<ExecutionStream<'_>> {
        let request = OutboundMessage::execute_request(&self.session_id, code);
        self.writer.send(&request).await?;
        debug!(session_id = %self.session_id, msg_id = %request.msg_id, "execute_request sent");

        Ok(ExecutionStream {
            session_id: &self.session_id,
            inbox: &mut self.inbox,
            request_id: request.msg_id,
            deadline,
            finished: false,
        })
    }

}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// Lazy, finite, non-restartable sequence of messages for one request.
#[derive(Debug)]
pub struct ExecutionStream<'a> {
    session_id: &'a str,
    inbox: &'a mut mpsc::Receiver<KernelMessage>,
    request_id: String,
    deadline: Instant,
    finished: bool,
}

impl ExecutionStream<'_> {
    /// `msg_id` of the request this stream belongs to.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Pull the next message for this request.
    ///
    /// Returns `Ok(None)` once the matching `status: idle` has been seen.
    /// `status: idle` itself is never yielded. Messages for other requests
    /// are discarded.
    ///
    /// Cancel-safe: dropping the returned future loses no message.
    ///
    /// # Errors
    ///
    /// - [`AppError::Timeout`] when the deadline passes first; the stream
    ///   may be drained afterwards.
    /// - [`AppError::Transport`]`("kernel died during execution")` when the
    ///   kernel's output closes before idle.
    pub async fn next(&mut self) -> Result<Option<ExecutionMessage>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let received = tokio::time::timeout_at(self.deadline, self.inbox.recv())
                .await
                .map_err(|_| {
                    AppError::Timeout("kernel did not finish before the execution deadline".into())
                })?;

            let Some(msg) = received else {
                self.finished = true;
                return Err(AppError::Transport("kernel died during execution".into()));
            };

            if msg.parent_msg_id.as_deref() != Some(self.request_id.as_str()) {
                debug!(
                    session_id = self.session_id,
                    parent = ?msg.parent_msg_id,
                    message = ?msg.message,
                    "kernel channel: discarding message for another request"
                );
                continue;
            }

            if msg.message == ExecutionMessage::Status(ExecutionState::Idle) {
                self.finished = true;
                return Ok(None);
            }

            return Ok(Some(msg.message));
        }
    }

    /// Discard the rest of the stream until idle, allowing `grace` from now.
    ///
    /// # Errors
    ///
    /// Same as [`ExecutionStream::next`].
    pub async fn drain(&mut self, grace: Duration) -> Result<()> {
        self.deadline = Instant::now() + grace;
        while self.next().await?.is_some() {}
        Ok(())
    }
}

// ── Reader task ───────────────────────────────────────────────────────────────

/// Read NDJSON lines from a kernel and forward decoded messages.
///
/// Malformed lines and oversize frames are logged and skipped. EOF, a read
/// error, or cancellation ends the task; dropping `tx` then signals the
/// closed transport to the consumer.
async fn run_reader<R>(
    session_id: String,
    stdout: R,
    tx: mpsc::Sender<KernelMessage>,
    cancel: CancellationToken,
    status: ReaderStatus,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, KernelCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "kernel reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                let skipped = framed.decoder_mut().take_skipped();
                if skipped > 0 {
                    warn!(session_id, skipped, "kernel reader: dropped oversize or non-UTF-8 lines");
                }

                match item {
                    None => {
                        debug!(session_id, "kernel reader: EOF detected");
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "kernel reader: IO error, stopping");
                        break;
                    }

                    Some(Ok(line)) => match parse_inbound_line(&line) {
                        Ok(Some(msg)) => {
                            if tx.send(msg).await.is_err() {
                                debug!(session_id, "kernel reader: consumer gone, stopping");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(session_id, error = %e, raw_line = %line, "kernel reader: parse error, skipping line");
                        }
                    },
                }
            }
        }
    }

    status.mark_closed();
}
