use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use quota_common::{QuotaError, QuotaSnapshot};
use serde::Serialize;
use tracing::error;

/// Error body returned by every route.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

#[derive(Debug)]
pub enum AppError {
    Quota(QuotaError),
    BadRequest(String),
    Unauthorized(String),
    Forbidden { code: &'static str, message: String },
    Unavailable { code: &'static str, message: String },
}

impl From<QuotaError> for AppError {
    fn from(err: QuotaError) -> Self {
        AppError::Quota(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl AppError {
    fn parts(self) -> (StatusCode, ApiError) {
        let body = |code: &str, message: String| ApiError {
            error: message,
            code: code.to_string(),
            quota: None,
        };

        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, body("BAD_REQUEST", msg)),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, body("UNAUTHORIZED", msg)),
            AppError::Forbidden { code, message } => (StatusCode::FORBIDDEN, body(code, message)),
            AppError::Unavailable { code, message } => {
                (StatusCode::SERVICE_UNAVAILABLE, body(code, message))
            }
            AppError::Quota(err) => {
                let message = err.to_string();
                match err {
                    QuotaError::QuotaExceeded { snapshot } => (
                        StatusCode::TOO_MANY_REQUESTS,
                        ApiError {
                            error: message,
                            code: "QUOTA_EXCEEDED".to_string(),
                            quota: Some(*snapshot),
                        },
                    ),
                    QuotaError::SubscriptionLookupFailed(_) => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        body("BILLING_UNAVAILABLE", message),
                    ),
                    QuotaError::UserNotFound(_) => {
                        (StatusCode::NOT_FOUND, body("USER_NOT_FOUND", message))
                    }
                    QuotaError::DuplicateUser { .. } => {
                        (StatusCode::CONFLICT, body("DUPLICATE_USER", message))
                    }
                    QuotaError::TenantMismatch { .. } => {
                        (StatusCode::FORBIDDEN, body("TENANT_MISMATCH", message))
                    }
                    QuotaError::UserBlocked(_) => {
                        (StatusCode::FORBIDDEN, body("USER_BLOCKED", message))
                    }
                    QuotaError::InvalidAmount => {
                        (StatusCode::BAD_REQUEST, body("INVALID_AMOUNT", message))
                    }
                    QuotaError::Catalog(_) | QuotaError::Store(_) | QuotaError::Config(_) => {
                        error!("Internal error: {}", message);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            body("INTERNAL", "Internal server error".to_string()),
                        )
                    }
                }
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        (status, Json(body)).into_response()
    }
}
