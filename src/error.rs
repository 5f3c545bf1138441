use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::OrderStatus;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("courier {courier_id} is not assigned to order {order_id}")]
    CourierMismatch { order_id: Uuid, courier_id: Uuid },

    #[error("order {0} already has a courier")]
    AlreadyAssigned(Uuid),

    #[error("{to} is not allowed on order {order_id} in status {from}")]
    InvalidTransition {
        order_id: Uuid,
        from: OrderStatus,
        to: String,
    },

    #[error("external service error: {0}")]
    External(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn order_not_found(id: Uuid) -> Self {
        AppError::NotFound(format!("order {id} not found"))
    }

    /// Conditional-write failures: the order exists but was not in the expected state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AppError::CourierMismatch { .. }
                | AppError::AlreadyAssigned(_)
                | AppError::InvalidTransition { .. }
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::CourierMismatch { .. }
            | AppError::AlreadyAssigned(_)
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::External(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
