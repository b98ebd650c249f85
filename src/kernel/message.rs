//! Kernel wire messages.
//!
//! Kernels speak Jupyter-shaped messages framed as one JSON object per line:
//!
//! ```json
//! {
//!   "channel": "iopub",
//!   "header": { "msg_id": "…", "msg_type": "stream", "session": "…", "date": "…", "version": "5.3" },
//!   "parent_header": { "msg_id": "<execute_request id>" },
//!   "metadata": {},
//!   "content": { "name": "stdout", "text": "hi\n" }
//! }
//! ```
//!
//! # Known inbound message types
//!
//! | `msg_type`       | Maps to                                  |
//! |------------------|------------------------------------------|
//! | `status`         | [`ExecutionMessage::Status`]             |
//! | `stream`         | [`ExecutionMessage::Stream`]             |
//! | `display_data`   | [`ExecutionMessage::DisplayData`]        |
//! | `execute_result` | [`ExecutionMessage::ExecuteResult`]      |
//! | `error`          | [`ExecutionMessage::Error`]              |
//! | *(any other)*    | [`ExecutionMessage::Other`]              |

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::execution::DisplayData;
use crate::{AppError, Result};

/// Protocol version stamped on outbound headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username stamped on outbound headers.
const USERNAME: &str = "kernel-gateway";

/// Kernel execution state reported by `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Kernel process is starting up.
    Starting,
    /// Kernel is working on a request.
    Busy,
    /// Kernel finished all work for the parent request.
    Idle,
}

/// Which output stream a `stream` message belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One message emitted by a kernel while it executes a request.
///
/// Closed set: every consumer matches exhaustively, and anything the gateway
/// does not understand lands in [`ExecutionMessage::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMessage {
    /// Kernel state change.
    Status(ExecutionState),
    /// Text written to stdout or stderr.
    Stream {
        /// Target stream.
        name: StreamName,
        /// Text chunk.
        text: String,
    },
    /// Rich display artifact produced mid-execution.
    DisplayData(DisplayData),
    /// Value of the final expression.
    ExecuteResult(DisplayData),
    /// The code raised an error.
    Error {
        /// Exception class name.
        name: String,
        /// Exception message.
        value: String,
        /// Formatted traceback lines, possibly with ANSI colour codes.
        traceback: Vec<String>,
    },
    /// Any message kind the gateway does not interpret.
    Other {
        /// Original `msg_type` (with detail for unknown status values).
        msg_type: String,
    },
}

/// A decoded inbound message with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    /// `msg_id` of the request this message answers, when present.
    pub parent_msg_id: Option<String>,
    /// Decoded payload.
    pub message: ExecutionMessage,
}

/// Message header shared by every wire message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /// Unique id of this message.
    pub msg_id: String,
    /// Message kind.
    pub msg_type: String,
    /// Session the message belongs to.
    #[serde(default)]
    pub session: String,
    /// Sender name.
    #[serde(default)]
    pub username: String,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub date: String,
    /// Protocol version.
    #[serde(default)]
    pub version: String,
}

impl Header {
    fn outbound(session_id: &str, msg_type: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_owned(),
            session: session_id.to_owned(),
            username: USERNAME.to_owned(),
            date: Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.to_owned(),
        }
    }
}

/// A message ready to be written to the kernel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Id the kernel will echo in `parent_header.msg_id`.
    pub msg_id: String,
    /// Serialized wire form.
    pub body: Value,
}

impl OutboundMessage {
    /// Build an `execute_request` on the shell channel.
    #[must_use]
    pub fn execute_request(session_id: &str, code: &str) -> Self {
        Self::build(
            "shell",
            session_id,
            "execute_request",
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    /// Build an `interrupt_request` on the control channel.
    #[must_use]
    pub fn interrupt_request(session_id: &str) -> Self {
        Self::build("control", session_id, "interrupt_request", json!({}))
    }

    /// Build a `shutdown_request` on the control channel.
    #[must_use]
    pub fn shutdown_request(session_id: &str) -> Self {
        Self::build(
            "control",
            session_id,
            "shutdown_request",
            json!({ "restart": false }),
        )
    }

    fn build(channel: &str, session_id: &str, msg_type: &str, content: Value) -> Self {
        let header = Header::outbound(session_id, msg_type);
        let msg_id = header.msg_id.clone();
        let body = json!({
            "channel": channel,
            "header": header,
            "parent_header": {},
            "metadata": {},
            "content": content,
        });
        Self { msg_id, body }
    }
}

// ── Inbound parsing ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    parent_header: Value,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct StatusContent {
    execution_state: String,
}

#[derive(Debug, Deserialize)]
struct StreamContent {
    name: StreamName,
    text: String,
}

#[derive(Debug, Deserialize)]
struct DisplayContent {
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorContent {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

/// Parse a single NDJSON line from a kernel.
///
/// # Return value
///
/// - `Ok(Some(msg))`: a well-formed message (unknown kinds become
///   [`ExecutionMessage::Other`]).
/// - `Ok(None)`: the line is empty or whitespace.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("malformed json: …")`: not a JSON envelope.
/// - [`AppError::Protocol`]`("invalid <type> content: …")`: a known message
///   kind with a content body of the wrong shape.
pub fn parse_inbound_line(line: &str) -> Result<Option<KernelMessage>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

    let parent_msg_id = envelope
        .parent_header
        .get("msg_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned);

    let message = decode_content(&envelope.header.msg_type, envelope.content)?;

    Ok(Some(KernelMessage {
        parent_msg_id,
        message,
    }))
}

fn decode_content(msg_type: &str, content: Value) -> Result<ExecutionMessage> {
    let message = match msg_type {
        "status" => {
            let status: StatusContent = from_content(msg_type, content)?;
            match status.execution_state.as_str() {
                "starting" => ExecutionMessage::Status(ExecutionState::Starting),
                "busy" => ExecutionMessage::Status(ExecutionState::Busy),
                "idle" => ExecutionMessage::Status(ExecutionState::Idle),
                other => ExecutionMessage::Other {
                    msg_type: format!("status:{other}"),
                },
            }
        }
        "stream" => {
            let stream: StreamContent = from_content(msg_type, content)?;
            ExecutionMessage::Stream {
                name: stream.name,
                text: stream.text,
            }
        }
        "display_data" => {
            let display: DisplayContent = from_content(msg_type, content)?;
            ExecutionMessage::DisplayData(DisplayData {
                data: display.data,
                metadata: display.metadata,
            })
        }
        "execute_result" => {
            let display: DisplayContent = from_content(msg_type, content)?;
            ExecutionMessage::ExecuteResult(DisplayData {
                data: display.data,
                metadata: display.metadata,
            })
        }
        "error" => {
            let error: ErrorContent = from_content(msg_type, content)?;
            ExecutionMessage::Error {
                name: error.ename,
                value: error.evalue,
                traceback: error.traceback,
            }
        }
        other => ExecutionMessage::Other {
            msg_type: other.to_owned(),
        },
    };
    Ok(message)
}

fn from_content<T: serde::de::DeserializeOwned>(msg_type: &str, content: Value) -> Result<T> {
    serde_json::from_value(content)
        .map_err(|e| AppError::Protocol(format!("invalid {msg_type} content: {e}")))
}
