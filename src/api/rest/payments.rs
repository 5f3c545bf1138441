use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tracing::error;

use crate::error::AppError;
use crate::payments::{CallbackOutcome, DepositCallback, NewPayment, RefundCallback};
use crate::state::AppState;
use crate::store::PaymentRecord;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments", post(record_payment))
        .route("/webhooks/payments/deposit", post(deposit_callback))
        .route("/webhooks/payments/refund", post(refund_callback))
}

/// Webhooks always acknowledge a well-formed body; processing failures stay on our side.
#[derive(Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CallbackOutcome>,
}

impl WebhookAck {
    fn from_result(kind: &str, result: Result<CallbackOutcome, AppError>) -> Self {
        let outcome = match result {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(kind, error = %err, "payment callback processing failed");
                None
            }
        };
        Self {
            status: "success",
            outcome,
        }
    }
}

async fn record_payment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewPayment>,
) -> Result<Json<PaymentRecord>, AppError> {
    Ok(Json(state.payments.record_payment(payload).await?))
}

async fn deposit_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DepositCallback>,
) -> Json<WebhookAck> {
    let result = state.payments.handle_deposit_callback(payload).await;
    Json(WebhookAck::from_result("deposit", result))
}

async fn refund_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RefundCallback>,
) -> Json<WebhookAck> {
    let result = state.payments.handle_refund_callback(payload).await;
    Json(WebhookAck::from_result("refund", result))
}
