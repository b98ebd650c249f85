//! Unit tests for `AppError` display, retry classification, and HTTP
//! mapping.

use axum::http::StatusCode;
use axum::response::IntoResponse;

use kernel_gateway::AppError;

#[test]
fn display_is_kind_prefixed() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Validation("x".into()), "validation: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::Busy("x".into()), "busy: x"),
        (AppError::Capacity("x".into()), "capacity: x"),
        (AppError::Timeout("x".into()), "timeout: x"),
        (AppError::Cancelled("x".into()), "cancelled: x"),
        (AppError::Transport("x".into()), "transport: x"),
        (AppError::Protocol("x".into()), "protocol: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn only_busy_and_capacity_are_retryable() {
    assert!(AppError::Busy(String::new()).is_retryable());
    assert!(AppError::Capacity(String::new()).is_retryable());
    assert!(!AppError::Timeout(String::new()).is_retryable());
    assert!(!AppError::Transport(String::new()).is_retryable());
    assert!(!AppError::NotFound(String::new()).is_retryable());
}

#[test]
fn io_errors_convert() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("pipe closed")));
}

#[test]
fn status_codes_follow_error_kind() {
    let cases = [
        (AppError::Validation(String::new()), StatusCode::BAD_REQUEST),
        (AppError::NotFound(String::new()), StatusCode::NOT_FOUND),
        (AppError::Busy(String::new()), StatusCode::CONFLICT),
        (AppError::Capacity(String::new()), StatusCode::SERVICE_UNAVAILABLE),
        (AppError::Timeout(String::new()), StatusCode::GATEWAY_TIMEOUT),
        (AppError::Transport(String::new()), StatusCode::INTERNAL_SERVER_ERROR),
        (AppError::Io(String::new()), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, status) in cases {
        assert_eq!(err.status_code(), status, "{err}");
    }
}

#[test]
fn detail_drops_kind_prefix() {
    assert_eq!(AppError::NotFound("kernel k not found".into()).detail(), "kernel k not found");
    assert_eq!(
        AppError::Transport("kernel died during execution".into()).detail(),
        "Error executing code: kernel died during execution"
    );
}

#[test]
fn busy_response_carries_retry_after() {
    let response = AppError::Busy("kernel k is busy".into()).into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let response = AppError::NotFound("k".into()).into_response();
    assert!(response.headers().get("retry-after").is_none());
}
