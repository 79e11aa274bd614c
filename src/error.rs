use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Order already paid")]
    AlreadyPaid,

    #[error("Order already refunded")]
    AlreadyRefunded,

    #[error("Account locked, try again later")]
    AccountLocked,

    #[error("Database error")]
    DbError(#[from] sqlx::Error),

    #[error("ORM error")]
    OrmError(#[from] sea_orm::DbErr),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

/// Error body shape: `{ message, error? }`. The `error` detail is omitted
/// for 5xx responses so internals never leak to clients.
#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_)
            | AppError::Conflict(_)
            | AppError::InsufficientStock(_)
            | AppError::InvalidTransition(_)
            | AppError::AlreadyPaid
            | AppError::AlreadyRefunded => StatusCode::BAD_REQUEST,
            AppError::Forbidden | AppError::AccountLocked => StatusCode::FORBIDDEN,
            AppError::DbError(_) | AppError::OrmError(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let detail = match &self {
            AppError::Validation(d)
            | AppError::Conflict(d)
            | AppError::InsufficientStock(d)
            | AppError::InvalidTransition(d) => Some(d.clone()),
            _ => None,
        };

        let body = ErrorBody {
            message: self.to_string(),
            error: detail,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
