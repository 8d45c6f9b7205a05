use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use config::ConfigError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Store(StoreError),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("internal server error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_)
            | AppError::Upstream(_)
            | AppError::Internal(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(reference) => AppError::ModelNotFound(reference),
            other => AppError::Store(other),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
