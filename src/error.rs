use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::billing::models::Metric;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("limit exceeded for {metric}: {used} of {limit} used, upgrade required")]
    LimitExceeded { metric: Metric, limit: i64, used: i64 },
    #[error("billing event signature rejected: {0}")]
    ForgedEvent(String),
    #[error("billing event {0} is still being processed by another delivery")]
    EventInFlight(String),
    #[error("billing event {event_id} failed: {detail}")]
    BillingEvent { event_id: String, detail: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::ForgedEvent(_) => StatusCode::BAD_REQUEST,
            AppError::LimitExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::EventInFlight(_) => StatusCode::CONFLICT,
            AppError::Db(_) | AppError::BillingEvent { .. } | AppError::Internal(_) => {
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
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let code = match &self {
            AppError::LimitExceeded { .. } => "upgrade_required",
            AppError::Unauthorized => "unauthorized",
            AppError::Validation(_) => "invalid_request",
            AppError::ForgedEvent(_) => "invalid_signature",
            AppError::NotFound => "not_found",
            AppError::EventInFlight(_) => "event_in_flight",
            _ => "internal_error",
        };
        // Internal details stay in the logs.
        let message = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// A counter increment that failed after the metered action already ran.
#[derive(Debug, Error)]
#[error("usage accounting failed for workspace {workspace_id} ({metric} x{amount}): {source}")]
pub struct AccountingFailure {
    pub workspace_id: Uuid,
    pub metric: Metric,
    pub amount: i64,
    #[source]
    pub source: anyhow::Error,
}

pub fn parse_workspace_id(value: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| AppError::Validation(format!("`{value}` is not a workspace id")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_exceeded_maps_to_payment_required() {
        let err = AppError::LimitExceeded {
            metric: Metric::Runs,
            limit: 5,
            used: 5,
        };
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(err.to_string().contains("upgrade required"));
    }

    #[test]
    fn in_flight_event_is_retryable_conflict() {
        let err = AppError::EventInFlight("evt_1".into());
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(!err.status().is_success());
    }

    #[test]
    fn malformed_workspace_id_is_validation_error() {
        assert!(matches!(
            parse_workspace_id("not-a-uuid"),
            Err(AppError::Validation(_))
        ));
        assert!(parse_workspace_id("6f1c2e8a-3b3d-4a4c-9f1e-2d2b6a7c8e90").is_ok());
    }
}
