use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::api::error::ErrorKind;
use crate::pipeline::coordinator::CoordinatorError;
use crate::pipeline::service::ServiceError;
use crate::pipeline::RunId;

pub type ApiObject<T> = (StatusCode, Json<T>);

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
}

pub fn error_response(
    status: StatusCode,
    kind: ErrorKind,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ApiObject<Value> {
    (
        status,
        into_json(ErrorResponse {
            ok: false,
            error: message.into(),
            error_kind: Some(kind),
            error_code: Some(code.into()),
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiObject<Value> {
    error_response(
        StatusCode::BAD_REQUEST,
        ErrorKind::Validation,
        "validation_error",
        message,
    )
}

pub fn internal_error(message: impl Into<String>) -> ApiObject<Value> {
    let detail = message.into();
    error!(detail = %detail, "internal api error");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Infra,
        "internal_error",
        "Internal server error",
    )
}

pub fn map_service_error(error: ServiceError) -> ApiObject<Value> {
    match error {
        ServiceError::Coordinator(error) => map_coordinator_error(error),
        ServiceError::Join(message) => internal_error(format!("coordinator task failed: {message}")),
    }
}

pub fn map_coordinator_error(error: CoordinatorError) -> ApiObject<Value> {
    match error {
        CoordinatorError::UnknownRunType(_) | CoordinatorError::UnknownStage { .. } => {
            error_response(
                StatusCode::NOT_FOUND,
                ErrorKind::Validation,
                "not_found",
                error.to_string(),
            )
        }
        CoordinatorError::OperatorRejected { .. } => error_response(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            "illegal_transition",
            error.to_string(),
        ),
        CoordinatorError::Store(source) => {
            error!(error = %source, "checklist store unavailable");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Infra,
                "store_unavailable",
                "Checklist store unavailable; retry the request",
            )
        }
        CoordinatorError::InvariantViolation { .. } | CoordinatorError::LockPoisoned(_) => {
            internal_error(error.to_string())
        }
    }
}

pub fn parse_run_path(run_type: &str, date: &str) -> Result<RunId, ApiObject<Value>> {
    RunId::parse(run_type, date).map_err(|error| validation_error(error.to_string()))
}

pub fn into_json(payload: impl Serialize) -> Json<Value> {
    match serde_json::to_value(payload) {
        Ok(value) => Json(value),
        Err(error) => {
            error!(error = %error, "failed to serialize api payload");
            Json(json!({
                "ok": false,
                "error": "Internal server error",
                "error_kind": ErrorKind::Infra.as_str(),
                "error_code": "internal_error",
            }))
        }
    }
}
