use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::Level;

use ollamabro_observability::{emit_event, ObservabilityEvent, ProcessKind};
use ollamabro_providers::ProviderError;
use ollamabro_runtime::BackendProcessError;

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Every failure a handler can return, mapped to one status and code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Process(#[from] BackendProcessError),

    #[error("origin `{0}` is not allowed")]
    OriginNotAllowed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Provider(err) => match err {
                ProviderError::PathNotAllowed(_) => StatusCode::FORBIDDEN,
                ProviderError::BackendNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
                ProviderError::Timeout(_) | ProviderError::StreamIdle(_) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                ProviderError::Unreachable(_)
                | ProviderError::Stream(_)
                | ProviderError::Upstream { .. } => StatusCode::BAD_GATEWAY,
                ProviderError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            },
            GatewayError::Process(err) => match err {
                BackendProcessError::ModelNotFound(_) => StatusCode::NOT_FOUND,
                BackendProcessError::OutsideModelDirs(_) => StatusCode::FORBIDDEN,
                BackendProcessError::ModelInUse(_) | BackendProcessError::LoadCancelled => {
                    StatusCode::CONFLICT
                }
                BackendProcessError::InvalidConfig(_) | BackendProcessError::NotAModelFile(_) => {
                    StatusCode::BAD_REQUEST
                }
                BackendProcessError::ReadyTimeout(_) | BackendProcessError::LlmfitTimeout(_) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                BackendProcessError::Io(_)
                | BackendProcessError::Spawn(_)
                | BackendProcessError::ExitedEarly { .. }
                | BackendProcessError::LlmfitUnavailable(_)
                | BackendProcessError::LlmfitFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Provider(err) => err.code(),
            GatewayError::Process(err) => err.code(),
            GatewayError::OriginNotAllowed(_) => "ORIGIN_NOT_ALLOWED",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();
        let level = if status.is_server_error() {
            Level::ERROR
        } else {
            Level::WARN
        };
        emit_event(
            level,
            ProcessKind::Gateway,
            ObservabilityEvent {
                status: Some(status.as_str()),
                error_code: Some(code),
                detail: Some(&message),
                ..ObservabilityEvent::new("gateway.request.failed", "http")
            },
        );
        (
            status,
            Json(ErrorEnvelope {
                error: message,
                code: Some(code.to_string()),
            }),
        )
            .into_response()
    }
}
