//! `SqliteStore` keeps orders, users and payments in SQLite through `sqlx`.
//!
//! Transitions become a single `UPDATE … WHERE <guard>`; the number of affected rows is
//! the only signal used to decide whether the write applied.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{CourierStore, OrderFilter, OrderStore, PaymentRecord, PaymentStore, StoreError};
use crate::models::courier::{CourierSnapshot, GeoPoint, User, UserRole};
use crate::models::order::{
    CourierStatus, CylinderType, Order, OrderStatus, PaymentStatus, TrackingLocation,
};
use crate::models::transition::Transition;

const ORDER_COLUMNS: &str = "id, user_id, provider_id, courier_id, status, courier_status, \
    payment_status, cylinder_type, quantity, price_per_unit, total_price, delivery_fee, \
    service_charge, grand_total, delivery_address, delivery_method, payment_method, \
    current_latitude, current_longitude, current_address, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SqliteStore ({:?})", self.pool)
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and runs the embedded migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        info!(url, "connected to sqlite");
        Self::from_pool(pool).await
    }

    /// A private in-memory database. Pinned to one connection that never idles out,
    /// since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("sqlite migrations applied");
        Ok(Self { pool })
    }
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Corrupt(format!("{column}: {err}")))
}

fn parse_optional_uuid(raw: Option<String>, column: &str) -> Result<Option<Uuid>, StoreError> {
    raw.map(|value| parse_uuid(&value, column)).transpose()
}

fn order_from_row(row: &SqliteRow) -> Result<Order, StoreError> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let status: String = row.try_get("status")?;
    let courier_status: String = row.try_get("courier_status")?;
    let payment_status: String = row.try_get("payment_status")?;
    let cylinder_type: String = row.try_get("cylinder_type")?;
    let quantity: i64 = row.try_get("quantity")?;
    let current_latitude: Option<f64> = row.try_get("current_latitude")?;
    let current_longitude: Option<f64> = row.try_get("current_longitude")?;
    let current_address: Option<String> = row.try_get("current_address")?;

    let tracking = match (current_latitude, current_longitude) {
        (Some(lat), Some(lng)) => Some(TrackingLocation {
            lat,
            lng,
            address: current_address,
        }),
        _ => None,
    };

    Ok(Order {
        id: parse_uuid(&id, "orders.id")?,
        user_id: parse_uuid(&user_id, "orders.user_id")?,
        provider_id: parse_optional_uuid(row.try_get("provider_id")?, "orders.provider_id")?,
        courier_id: parse_optional_uuid(row.try_get("courier_id")?, "orders.courier_id")?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("orders.status: {status}")))?,
        courier_status: CourierStatus::parse(&courier_status).ok_or_else(|| {
            StoreError::Corrupt(format!("orders.courier_status: {courier_status}"))
        })?,
        payment_status: PaymentStatus::parse(&payment_status).ok_or_else(|| {
            StoreError::Corrupt(format!("orders.payment_status: {payment_status}"))
        })?,
        cylinder_type: CylinderType::parse(&cylinder_type)
            .ok_or_else(|| StoreError::Corrupt(format!("orders.cylinder_type: {cylinder_type}")))?,
        quantity: u32::try_from(quantity)
            .map_err(|_| StoreError::Corrupt(format!("orders.quantity: {quantity}")))?,
        price_per_unit: row.try_get("price_per_unit")?,
        total_price: row.try_get("total_price")?,
        delivery_fee: row.try_get("delivery_fee")?,
        service_charge: row.try_get("service_charge")?,
        grand_total: row.try_get("grand_total")?,
        delivery_address: row.try_get("delivery_address")?,
        delivery_method: row.try_get("delivery_method")?,
        payment_method: row.try_get("payment_method")?,
        tracking,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    let id: String = row.try_get("id")?;
    let role: String = row.try_get("user_type")?;
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;

    Ok(User {
        id: parse_uuid(&id, "users.id")?,
        role: UserRole::parse(&role)
            .ok_or_else(|| StoreError::Corrupt(format!("users.user_type: {role}")))?,
        name: row.try_get("name")?,
        location: latitude
            .zip(longitude)
            .map(|(lat, lng)| GeoPoint { lat, lng }),
        rating: row.try_get("rating")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<CourierSnapshot, StoreError> {
    let id: String = row.try_get("id")?;
    let active_orders: i64 = row.try_get("active_orders")?;
    Ok(CourierSnapshot {
        id: parse_uuid(&id, "users.id")?,
        location: GeoPoint {
            lat: row.try_get("latitude")?,
            lng: row.try_get("longitude")?,
        },
        rating: row.try_get("rating")?,
        active_orders: u32::try_from(active_orders).unwrap_or(u32::MAX),
    })
}

fn map_duplicate(err: sqlx::Error, key: String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate(key);
        }
    }
    StoreError::Driver(err)
}

/// Builds the guarded `UPDATE` for a transition. The `SET` list mirrors
/// [`Transition::apply`] and the `WHERE` list mirrors [`Transition::permits`].
fn transition_query(
    id: Uuid,
    transition: Transition,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new("UPDATE orders SET updated_at = ");
    builder.push_bind(now);

    match transition {
        Transition::ProviderAccept { provider_id } => {
            builder.push(", status = ");
            builder.push_bind(OrderStatus::Accepted.as_str());
            builder.push(", provider_id = ");
            builder.push_bind(provider_id.to_string());
        }
        Transition::Reject => {
            builder.push(", status = ");
            builder.push_bind(OrderStatus::Rejected.as_str());
            builder.push(", courier_id = NULL, courier_status = ");
            builder.push_bind(CourierStatus::None.as_str());
        }
        Transition::Assign { courier_id } | Transition::ForceAssign { courier_id } => {
            builder.push(", courier_status = ");
            builder.push_bind(CourierStatus::Pending.as_str());
            builder.push(", courier_id = ");
            builder.push_bind(courier_id.to_string());
        }
        Transition::CourierAccept { .. } | Transition::MarkInTransit => {
            builder.push(", status = ");
            builder.push_bind(OrderStatus::InTransit.as_str());
            builder.push(", courier_status = ");
            builder.push_bind(CourierStatus::Accepted.as_str());
        }
        Transition::CourierDecline { .. } => {
            builder.push(", status = ");
            builder.push_bind(OrderStatus::Accepted.as_str());
            builder.push(", courier_id = NULL, courier_status = ");
            builder.push_bind(CourierStatus::None.as_str());
        }
        Transition::Deliver => {
            builder.push(", status = ");
            builder.push_bind(OrderStatus::Delivered.as_str());
            builder.push(", courier_status = ");
            builder.push_bind(CourierStatus::Completed.as_str());
        }
    }

    builder.push(" WHERE id = ");
    builder.push_bind(id.to_string());
    builder.push(" AND status IN (");
    {
        let mut statuses = builder.separated(", ");
        for status in transition.expected_statuses() {
            statuses.push_bind(status.as_str());
        }
    }
    builder.push(")");

    match transition {
        Transition::Assign { .. } => {
            builder.push(" AND courier_id IS NULL");
        }
        Transition::CourierAccept { courier_id } | Transition::CourierDecline { courier_id } => {
            builder.push(" AND courier_id = ");
            builder.push_bind(courier_id.to_string());
            builder.push(" AND courier_status = ");
            builder.push_bind(CourierStatus::Pending.as_str());
        }
        Transition::MarkInTransit | Transition::Deliver => {
            builder.push(" AND courier_id IS NOT NULL");
        }
        _ => {}
    }

    builder
}

#[async_trait]
impl OrderStore for SqliteStore {
    async fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        let (lat, lng, address) = match &order.tracking {
            Some(t) => (Some(t.lat), Some(t.lng), t.address.clone()),
            None => (None, None, None),
        };
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(order.id.to_string())
        .bind(order.user_id.to_string())
        .bind(order.provider_id.map(|id| id.to_string()))
        .bind(order.courier_id.map(|id| id.to_string()))
        .bind(order.status.as_str())
        .bind(order.courier_status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.cylinder_type.as_str())
        .bind(i64::from(order.quantity))
        .bind(order.price_per_unit)
        .bind(order.total_price)
        .bind(order.delivery_fee)
        .bind(order.service_charge)
        .bind(order.grand_total)
        .bind(&order.delivery_address)
        .bind(&order.delivery_method)
        .bind(&order.payment_method)
        .bind(lat)
        .bind(lng)
        .bind(address)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| map_duplicate(err, format!("order {}", order.id)))?;
        debug!(order_id = %order.id, "order saved");
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {ORDER_COLUMNS} FROM orders WHERE 1 = 1"));
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(provider_id) = filter.provider_id {
            builder.push(" AND provider_id = ");
            builder.push_bind(provider_id.to_string());
        }
        if let Some(courier_id) = filter.courier_id {
            builder.push(" AND courier_id = ");
            builder.push_bind(courier_id.to_string());
        }
        if let Some(user_id) = filter.user_id {
            builder.push(" AND user_id = ");
            builder.push_bind(user_id.to_string());
        }
        if filter.unassigned {
            builder.push(" AND courier_id IS NULL");
        }
        builder.push(" ORDER BY created_at ASC, id ASC");

        trace!(sql = builder.sql(), "listing orders");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn try_transition(&self, id: Uuid, transition: Transition) -> Result<bool, StoreError> {
        let mut builder = transition_query(id, transition, Utc::now());
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE orders SET payment_status = ?, updated_at = ? \
             WHERE id = ? AND payment_status != ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE id = ?)")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn set_tracking(&self, id: Uuid, location: TrackingLocation) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE orders SET current_latitude = ?, current_longitude = ?, current_address = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(location.lat)
        .bind(location.lng)
        .bind(location.address)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CourierStore for SqliteStore {
    async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id, user_type, name, latitude, longitude, rating, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET user_type = excluded.user_type, name = excluded.name, \
             latitude = excluded.latitude, longitude = excluded.longitude, \
             rating = excluded.rating, updated_at = excluded.updated_at",
        )
        .bind(user.id.to_string())
        .bind(user.role.as_str())
        .bind(&user.name)
        .bind(user.location.map(|p| p.lat))
        .bind(user.location.map(|p| p.lng))
        .bind(user.rating)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_type, name, latitude, longitude, rating, updated_at \
             FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_couriers(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_type, name, latitude, longitude, rating, updated_at \
             FROM users WHERE user_type = ? ORDER BY id ASC",
        )
        .bind(UserRole::Courier.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn set_location(&self, id: Uuid, location: GeoPoint) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE users SET latitude = ?, longitude = ?, updated_at = ? WHERE id = ?")
                .bind(location.lat)
                .bind(location.lng)
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn courier_pool(&self) -> Result<Vec<CourierSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                u.id,
                u.latitude,
                u.longitude,
                u.rating,
                (SELECT COUNT(*)
                 FROM orders o
                 WHERE o.courier_id = u.id
                   AND o.status IN ('accepted', 'in-transit')) AS active_orders
            FROM users u
            WHERE u.user_type = 'courier'
              AND u.latitude IS NOT NULL
              AND u.longitude IS NOT NULL
            ORDER BY u.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }
}

#[async_trait]
impl PaymentStore for SqliteStore {
    async fn record_payment(&self, payment: PaymentRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO payments (transaction_ref, order_id, amount, status) VALUES (?, ?, ?, ?)",
        )
        .bind(&payment.transaction_ref)
        .bind(payment.order_id.to_string())
        .bind(payment.amount)
        .bind(&payment.status)
        .execute(&self.pool)
        .await
        .map_err(|err| map_duplicate(err, format!("transaction {}", payment.transaction_ref)))?;
        Ok(())
    }

    async fn order_for_transaction(&self, transaction_ref: &str) -> Result<Option<Uuid>, StoreError> {
        let order_id: Option<String> =
            sqlx::query_scalar("SELECT order_id FROM payments WHERE transaction_ref = ?")
                .bind(transaction_ref)
                .fetch_optional(&self.pool)
                .await?;
        order_id
            .map(|id| parse_uuid(&id, "payments.order_id"))
            .transpose()
    }

    async fn set_gateway_status(&self, transaction_ref: &str, status: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE payments SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE transaction_ref = ?",
        )
        .bind(status)
        .bind(transaction_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
