//! Payment gateway callbacks.
//!
//! The gateway reports deposits and refunds asynchronously and may deliver the same
//! callback more than once. Callbacks carry the deposit id we stored as the payment's
//! transaction reference; that reference is the only link back to an order.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::bounded;
use crate::engine::queue::DispatchQueue;
use crate::error::AppError;
use crate::models::order::PaymentStatus;
use crate::observability::metrics::Metrics;
use crate::store::{OrderStore, PaymentRecord, PaymentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Completed,
    Failed,
    /// SUBMITTED, ACCEPTED and anything the gateway may add later.
    Pending,
}

impl GatewayStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "COMPLETED" => GatewayStatus::Completed,
            "FAILED" => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Completed => "completed",
            GatewayStatus::Failed => "failed",
            GatewayStatus::Pending => "pending",
        }
    }

    pub fn order_payment_status(&self) -> PaymentStatus {
        match self {
            GatewayStatus::Completed => PaymentStatus::Paid,
            GatewayStatus::Failed => PaymentStatus::Failed,
            GatewayStatus::Pending => PaymentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub failure_code: String,
    #[serde(default)]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositCallback {
    pub deposit_id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundCallback {
    pub refund_id: String,
    #[serde(default)]
    pub deposit_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub transaction_ref: String,
    pub order_id: Uuid,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied {
        order_id: Uuid,
        gateway_status: String,
        auto_assign_queued: bool,
    },
    /// No payment carries this reference. Acknowledged so the gateway stops retrying.
    UnknownTransaction { transaction_ref: String },
}

pub struct PaymentEvents {
    orders: Arc<dyn OrderStore>,
    payments: Arc<dyn PaymentStore>,
    queue: DispatchQueue,
    db_timeout: Duration,
    metrics: Metrics,
}

impl PaymentEvents {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        payments: Arc<dyn PaymentStore>,
        queue: DispatchQueue,
        db_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            orders,
            payments,
            queue,
            db_timeout,
            metrics,
        }
    }

    /// Stores the link between a gateway deposit and an order, before the gateway calls
    /// back.
    pub async fn record_payment(&self, payment: NewPayment) -> Result<PaymentRecord, AppError> {
        if payment.transaction_ref.trim().is_empty() {
            return Err(AppError::Validation("transaction_ref is required".to_string()));
        }
        if !payment.amount.is_finite() || payment.amount <= 0.0 {
            return Err(AppError::Validation("amount must be greater than 0".to_string()));
        }

        bounded(self.db_timeout, "get_order", self.orders.get_order(payment.order_id))
            .await?
            .ok_or_else(|| AppError::order_not_found(payment.order_id))?;

        let record = PaymentRecord {
            transaction_ref: payment.transaction_ref,
            order_id: payment.order_id,
            amount: payment.amount,
            status: GatewayStatus::Pending.as_str().to_string(),
        };
        bounded(
            self.db_timeout,
            "record_payment",
            self.payments.record_payment(record.clone()),
        )
        .await?;

        info!(
            transaction_ref = %record.transaction_ref,
            order_id = %record.order_id,
            amount = record.amount,
            "payment recorded"
        );
        Ok(record)
    }

    pub async fn handle_deposit_callback(
        &self,
        callback: DepositCallback,
    ) -> Result<CallbackOutcome, AppError> {
        let status = GatewayStatus::parse(&callback.status);
        self.metrics
            .payment_events_total
            .with_label_values(&["deposit", status.as_str()])
            .inc();
        info!(
            deposit_id = %callback.deposit_id,
            status = %callback.status,
            amount = ?callback.amount,
            currency = ?callback.currency,
            "processing deposit callback"
        );

        let Some(order_id) = self.resolve(&callback.deposit_id).await? else {
            return Ok(CallbackOutcome::UnknownTransaction {
                transaction_ref: callback.deposit_id,
            });
        };

        if let Some(reason) = &callback.failure_reason {
            warn!(
                deposit_id = %callback.deposit_id,
                order_id = %order_id,
                failure_code = %reason.failure_code,
                failure_message = ?reason.failure_message,
                "deposit reported a failure reason"
            );
        }

        bounded(
            self.db_timeout,
            "set_gateway_status",
            self.payments
                .set_gateway_status(&callback.deposit_id, status.as_str()),
        )
        .await?;
        let found = bounded(
            self.db_timeout,
            "set_payment_status",
            self.orders
                .set_payment_status(order_id, status.order_payment_status()),
        )
        .await?;
        if !found {
            return Err(AppError::order_not_found(order_id));
        }

        let auto_assign_queued = status == GatewayStatus::Completed
            && match self.queue.submit(order_id) {
                Ok(()) => true,
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "auto-assignment not queued");
                    false
                }
            };

        info!(
            deposit_id = %callback.deposit_id,
            order_id = %order_id,
            payment_status = status.order_payment_status().as_str(),
            auto_assign_queued,
            "deposit callback applied"
        );
        Ok(CallbackOutcome::Applied {
            order_id,
            gateway_status: status.as_str().to_string(),
            auto_assign_queued,
        })
    }

    pub async fn handle_refund_callback(
        &self,
        callback: RefundCallback,
    ) -> Result<CallbackOutcome, AppError> {
        let status = GatewayStatus::parse(&callback.status);
        self.metrics
            .payment_events_total
            .with_label_values(&["refund", status.as_str()])
            .inc();
        info!(
            refund_id = %callback.refund_id,
            deposit_id = ?callback.deposit_id,
            status = %callback.status,
            "processing refund callback"
        );

        let Some(deposit_id) = callback.deposit_id.filter(|id| !id.trim().is_empty()) else {
            warn!(refund_id = %callback.refund_id, "refund callback without deposit id");
            return Ok(CallbackOutcome::UnknownTransaction {
                transaction_ref: callback.refund_id,
            });
        };
        let Some(order_id) = self.resolve(&deposit_id).await? else {
            return Ok(CallbackOutcome::UnknownTransaction {
                transaction_ref: deposit_id,
            });
        };

        if let Some(reason) = &callback.failure_reason {
            warn!(
                refund_id = %callback.refund_id,
                failure_code = %reason.failure_code,
                "refund reported a failure reason"
            );
        }

        let gateway_status = format!("refund_{}", status.as_str());
        bounded(
            self.db_timeout,
            "set_gateway_status",
            self.payments.set_gateway_status(&deposit_id, &gateway_status),
        )
        .await?;

        if status == GatewayStatus::Completed {
            let found = bounded(
                self.db_timeout,
                "set_payment_status",
                self.orders.set_payment_status(order_id, PaymentStatus::Refunded),
            )
            .await?;
            if !found {
                return Err(AppError::order_not_found(order_id));
            }
            info!(order_id = %order_id, refund_id = %callback.refund_id, "order refunded");
        }

        Ok(CallbackOutcome::Applied {
            order_id,
            gateway_status,
            auto_assign_queued: false,
        })
    }

    async fn resolve(&self, transaction_ref: &str) -> Result<Option<Uuid>, AppError> {
        let order_id = bounded(
            self.db_timeout,
            "order_for_transaction",
            self.payments.order_for_transaction(transaction_ref),
        )
        .await?;
        if order_id.is_none() {
            warn!(transaction_ref = %transaction_ref, "no payment found for transaction; ignoring");
        }
        Ok(order_id)
    }
}
