// src/errors.rs
use axum::{
    extract::rejection::JsonRejection,
    extract::FromRequest,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Json extractor whose rejections surface as the structured failure
/// envelope instead of axum's plain-text response.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("M-Pesa authentication failed: {0}")]
    Auth(String),

    #[error("Push submission failed: {0}")]
    Submission(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("MongoDB error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("QR code not found: {0}")]
    QrCodeNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed"),
            AppError::Auth(_) => (StatusCode::BAD_GATEWAY, "Payment provider authentication failed"),
            AppError::Submission(_) => (StatusCode::BAD_GATEWAY, "Payment push failed"),
            AppError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage error"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            AppError::QrCodeNotFound(_) => (StatusCode::NOT_FOUND, "QR code not found"),
            AppError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error"),
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Submission(format!("HTTP request failed: {}", err))
    }
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn submission(msg: impl Into<String>) -> Self {
        AppError::Submission(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
