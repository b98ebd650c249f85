//! Execution result aggregation.
//!
//! Folds the unordered message stream of one execute call into a single
//! bounded [`ExecutionResult`].

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::kernel::channel::ExecutionStream;
use crate::kernel::message::{ExecutionMessage, StreamName};
use crate::models::execution::{DisplayData, ExecutionResult};
use crate::Result;

/// Accumulates messages for one execute call.
#[derive(Debug)]
pub struct ResultBuilder {
    session_id: String,
    execute_result: Option<DisplayData>,
    error: Option<String>,
    stdout: String,
    stderr: String,
    displays: Vec<DisplayData>,
}

impl ResultBuilder {
    /// Start an empty result for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            execute_result: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            displays: Vec::new(),
        }
    }

    /// Fold one message into the result.
    pub fn apply(&mut self, message: ExecutionMessage) {
        match message {
            ExecutionMessage::Stream { name, text } => match name {
                StreamName::Stdout => self.stdout.push_str(&text),
                StreamName::Stderr => self.stderr.push_str(&text),
            },
            ExecutionMessage::DisplayData(display) => self.displays.push(display),
            ExecutionMessage::ExecuteResult(display) => {
                if self.execute_result.is_some() {
                    warn!(
                        session_id = %self.session_id,
                        "kernel sent more than one execute_result, keeping the last"
                    );
                }
                self.execute_result = Some(display);
            }
            ExecutionMessage::Error {
                name,
                value,
                traceback,
            } => {
                self.error = Some(format_error(&name, &value, &traceback));
            }
            ExecutionMessage::Status(_) => {}
            ExecutionMessage::Other { msg_type } => {
                debug!(session_id = %self.session_id, msg_type = %msg_type, "ignoring kernel message");
            }
        }
    }

    /// Produce the final result.
    #[must_use]
    pub fn finish(self) -> ExecutionResult {
        ExecutionResult {
            success: self.error.is_none(),
            execute_result: self.execute_result,
            error: self.error,
            stdout: self.stdout,
            stderr: self.stderr,
            displays: self.displays,
            session_id: self.session_id,
        }
    }
}

/// Consume `stream` to completion and fold it into an [`ExecutionResult`].
///
/// # Errors
///
/// Propagates stream failures: [`AppError::Transport`](crate::AppError::Transport)
/// when the kernel died before reporting idle, and
/// [`AppError::Timeout`](crate::AppError::Timeout) when the deadline passed.
pub async fn aggregate(stream: &mut ExecutionStream<'_>, session_id: &str) -> Result<ExecutionResult> {
    let mut builder = ResultBuilder::new(session_id);
    while let Some(message) = stream.next().await? {
        builder.apply(message);
    }
    Ok(builder.finish())
}

/// Render an interpreter error as `name: value` followed by the traceback
/// with terminal colour codes removed.
#[must_use]
pub fn format_error(name: &str, value: &str, traceback: &[String]) -> String {
    let mut formatted = format!("{name}: {value}");
    for line in traceback {
        formatted.push('\n');
        formatted.push_str(&strip_ansi(line));
    }
    formatted
}

fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    match ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok()) {
        Some(pattern) => pattern.replace_all(text, ""),
        None => std::borrow::Cow::Borrowed(text),
    }
}
