use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::models::StyleError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation backend returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("{0}")]
    EmptyOutput(String),
    #[error("failed to parse output: {0}")]
    OutputParse(String),
    #[error("missing API key for the generation backend")]
    MissingApiKey,
}

/// Batch-level outcome of an image fan-out that produced nothing usable.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("No valid styles selected")]
    NoValidStyles,
    #[error("Too many images in one request ({requested}). Max is {max}.")]
    TooManyImages { requested: u32, max: u32 },
    #[error("Failed to generate any images")]
    AllFailed { style_errors: Vec<StyleError> },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid storage path '{0}'")]
    InvalidPath(String),
    #[error("invalid image data: {0}")]
    InvalidImage(String),
    #[error("failed to download image: {0}")]
    Download(#[from] reqwest::Error),
    #[error("invalid or expired signature")]
    BadSignature,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("copy batch '{0}' not found for this ad")]
    BatchNotFound(String),
    #[error("copy index {index} out of range (batch has {len} copies)")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("stored copies are corrupt: {0}")]
    CorruptCopies(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by the HTTP API as `{"error": ...}` bodies.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Generation { message: String, style_errors: Vec<StyleError> },
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Generation { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match self {
            ApiError::Generation { message, style_errors } => {
                json!({ "error": message, "style_errors": style_errors })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<FanoutError> for ApiError {
    fn from(err: FanoutError) -> Self {
        match err {
            FanoutError::AllFailed { style_errors } => ApiError::Generation {
                message: "Failed to generate any images".to_string(),
                style_errors,
            },
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::BatchNotFound(_) => ApiError::NotFound(err.to_string()),
            ApprovalError::IndexOutOfRange { .. } => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}
