//! Execution output types returned to API callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A mimetype-keyed bundle produced by a kernel.
///
/// Both `display_data` and `execute_result` messages use this shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DisplayData {
    /// Mimetype → content (e.g. `text/plain`, `image/png` as base64).
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Per-mimetype metadata supplied by the kernel.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DisplayData {
    /// The `text/plain` representation, if the kernel provided one.
    #[must_use]
    pub fn plain_text(&self) -> Option<&str> {
        self.data.get("text/plain").and_then(Value::as_str)
    }
}

/// Everything one execute call produced, folded into a single record.
///
/// Constructed fresh per call and never mutated after it is returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// `false` iff the kernel reported an error.
    pub success: bool,
    /// Value of the final expression, if any.
    pub execute_result: Option<DisplayData>,
    /// Formatted error (`name: value` plus traceback) when `success` is false.
    pub error: Option<String>,
    /// Concatenated stdout stream text in arrival order.
    pub stdout: String,
    /// Concatenated stderr stream text in arrival order.
    pub stderr: String,
    /// Intermediate display artifacts in arrival order.
    pub displays: Vec<DisplayData>,
    /// Session the code ran in.
    #[serde(rename = "kernel_id", alias = "session_id")]
    pub session_id: String,
}
