use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uplift_core::PipelineError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::Invalid(_) | PipelineError::Serialization(_) => {
                Self::bad_request(message)
            }
            PipelineError::InvalidSignature
            | PipelineError::UploadExpired(_)
            | PipelineError::PermissionDenied(_) => Self::forbidden(message),
            PipelineError::UploadRedeemed(_)
            | PipelineError::RecordConflict(_)
            | PipelineError::AllocationConflict(_) => Self::conflict(message),
            PipelineError::RecordNotFound(_)
            | PipelineError::ObjectNotFound(_)
            | PipelineError::ScriptMissing(_) => Self::not_found(message),
            PipelineError::TransientIo(_) => Self::unavailable(message),
            PipelineError::ProvisionTimeout { .. }
            | PipelineError::AllocatorTimeout { .. }
            | PipelineError::WorkerLeaked { .. }
            | PipelineError::LaunchFailed(_)
            | PipelineError::Internal(_) => {
                tracing::error!("internal pipeline error: {message}");
                Self::internal("Internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_http_statuses() {
        let cases = [
            (PipelineError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::InvalidSignature, StatusCode::FORBIDDEN),
            (PipelineError::UploadExpired("x".into()), StatusCode::FORBIDDEN),
            (PipelineError::UploadRedeemed("x".into()), StatusCode::CONFLICT),
            (PipelineError::RecordConflict("x".into()), StatusCode::CONFLICT),
            (PipelineError::ObjectNotFound("x".into()), StatusCode::NOT_FOUND),
            (PipelineError::ScriptMissing("x".into()), StatusCode::NOT_FOUND),
            (PipelineError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = AppError::from(PipelineError::Internal("db password".into()));
        assert!(!err.message.contains("password"));
    }
}
