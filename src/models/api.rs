//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

/// Body of `POST /run-cell`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCellRequest {
    /// A previously created kernel id. When absent, a new kernel is started.
    #[serde(default, alias = "session_id")]
    pub kernel_id: Option<String>,
    /// The code to execute.
    #[serde(default)]
    pub code: String,
}

/// Body of `POST /kernels`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateKernelRequest {
    /// Kernel spec name; the configured default is used when absent.
    #[serde(default)]
    pub kernel_name: Option<String>,
}

/// Response of `POST /kernels`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateKernelResponse {
    /// Id to pass as `kernel_id` in later requests.
    pub kernel_id: String,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Human-readable explanation.
    pub detail: String,
}
