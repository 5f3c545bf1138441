//! Repository traits the dispatcher is built on, plus their two backends.
//!
//! Every state change on an order goes through [`OrderStore::try_transition`], a
//! conditional write that reports whether the row matched the transition's guard. No
//! backend takes locks spanning more than one row.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::courier::{CourierSnapshot, GeoPoint, User};
use crate::models::order::{Order, OrderStatus, PaymentStatus, TrackingLocation};
use crate::models::transition::Transition;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Driver(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("duplicate key: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub provider_id: Option<Uuid>,
    pub courier_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// Only orders with no courier attached.
    pub unassigned: bool,
}

impl OrderFilter {
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.unassigned = true;
        self
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.status.is_none_or(|status| order.status == status)
            && self.provider_id.is_none_or(|id| order.provider_id == Some(id))
            && self.courier_id.is_none_or(|id| order.courier_id == Some(id))
            && self.user_id.is_none_or(|id| order.user_id == id)
            && (!self.unassigned || order.courier_id.is_none())
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: Order) -> Result<(), StoreError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Orders matching `filter`, oldest first.
    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;

    /// Applies `transition` only if the stored row satisfies its guard. Returns `false`
    /// when no row changed, either because the order is absent or the guard failed.
    async fn try_transition(&self, id: Uuid, transition: Transition) -> Result<bool, StoreError>;

    /// Moves the payment status unless it is already `status`. Returns whether the order
    /// exists.
    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus) -> Result<bool, StoreError>;

    async fn set_tracking(&self, id: Uuid, location: TrackingLocation) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CourierStore: Send + Sync {
    async fn upsert_user(&self, user: User) -> Result<(), StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn list_couriers(&self) -> Result<Vec<User>, StoreError>;

    async fn set_location(&self, id: Uuid, location: GeoPoint) -> Result<bool, StoreError>;

    /// Couriers with a known location, each with its count of accepted or in-transit
    /// orders.
    async fn courier_pool(&self) -> Result<Vec<CourierSnapshot>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PaymentRecord {
    pub transaction_ref: String,
    pub order_id: Uuid,
    pub amount: f64,
    pub status: String,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn record_payment(&self, payment: PaymentRecord) -> Result<(), StoreError>;

    async fn order_for_transaction(&self, transaction_ref: &str) -> Result<Option<Uuid>, StoreError>;

    async fn set_gateway_status(&self, transaction_ref: &str, status: &str) -> Result<bool, StoreError>;
}
