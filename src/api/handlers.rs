//! Request handlers and shared application state.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::config::GlobalConfig;
use crate::models::api::{CreateKernelRequest, CreateKernelResponse, RunCellRequest};
use crate::models::execution::ExecutionResult;
use crate::models::session::SessionInfo;
use crate::orchestrator::registry::{SessionRegistry, EMPTY_CODE_HINT};
use crate::{AppError, Result};

/// Shared application state accessible by all request handlers.
#[derive(Debug)]
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Registry of running kernel sessions.
    pub registry: Arc<SessionRegistry>,
}

/// `GET /health`: liveness probe.
pub async fn health() -> &'static str {
    "ok"
}

/// `POST /kernels`: start a kernel and return its id.
///
/// The body is optional; an empty body starts the default kernel spec.
///
/// # Errors
///
/// Validation, capacity, and start-up failures from the registry.
pub async fn create_kernel(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateKernelResponse>)> {
    let request: CreateKernelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateKernelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::Validation(format!("invalid request body: {err}")))?
    };

    let session = state
        .registry
        .start(request.kernel_name.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateKernelResponse {
            kernel_id: session.id().to_owned(),
        }),
    ))
}

/// `GET /kernels`: snapshots of every running session.
pub async fn list_kernels(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

/// `DELETE /kernels/{id}`: shut a kernel down.
///
/// # Errors
///
/// [`AppError::NotFound`] for unknown ids.
pub async fn shutdown_kernel(
    State(state): State<Arc<AppState>>,
    Path(kernel_id): Path<String>,
) -> Result<StatusCode> {
    state.registry.remove(&kernel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /kernels/{id}/interrupt`: interrupt whatever the kernel is running.
///
/// # Errors
///
/// [`AppError::NotFound`] for unknown ids, [`AppError::Transport`] if the
/// interrupt cannot be delivered.
pub async fn interrupt_kernel(
    State(state): State<Arc<AppState>>,
    Path(kernel_id): Path<String>,
) -> Result<StatusCode> {
    state.registry.interrupt(&kernel_id).await?;
    info!(session_id = %kernel_id, "kernel interrupted on request");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /run-cell`: execute code, starting a kernel when no id is given.
///
/// The execution runs on its own task. If the client disconnects, this
/// handler's future is dropped, which cancels the task's token and makes the
/// session interrupt the kernel instead of leaving it running unattended.
///
/// # Errors
///
/// Every [`AppError`] from [`SessionRegistry::execute`]; malformed bodies
/// are reported as [`AppError::Validation`].
pub async fn run_cell(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<RunCellRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>> {
    let Json(request) = body.map_err(|rejection| {
        AppError::Validation(format!(
            "invalid request body: {}. {EMPTY_CODE_HINT}",
            rejection.body_text()
        ))
    })?;

    let span = info_span!(
        "run_cell",
        kernel_id = request.kernel_id.as_deref().unwrap_or("<new>"),
        code_bytes = request.code.len()
    );

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let registry = Arc::clone(&state.registry);

    let task = tokio::spawn(
        async move {
            registry
                .execute(request.kernel_id.as_deref(), &request.code, cancel)
                .await
        }
        .instrument(span),
    );

    let outcome = task
        .await
        .map_err(|err| AppError::Transport(format!("execution task failed: {err}")))?;
    drop(guard.disarm());

    Ok(Json(outcome?))
}
