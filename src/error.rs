use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Opaque data-source failure; retried by the scheduler.
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("all {attempts} fetch attempts failed: {last}")]
    RetriesExhausted { attempts: u32, last: Box<AppError> },

    #[error("polling is disabled")]
    PollingDisabled,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid preferences: {0}")]
    InvalidPreferences(String),

    #[error("invalid push subscription: {0}")]
    InvalidSubscription(String),

    /// Optional feature not configured on this instance.
    #[error("{0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::InvalidTopic(_)
            | AppError::InvalidPreferences(_)
            | AppError::InvalidSubscription(_) => StatusCode::BAD_REQUEST,
            AppError::PollingDisabled => StatusCode::CONFLICT,
            AppError::Fetch(_) | AppError::RetriesExhausted { .. } | AppError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
