use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{CourierStore, OrderFilter, OrderStore, PaymentRecord, PaymentStore, StoreError};
use crate::models::courier::{CourierSnapshot, GeoPoint, User, UserRole};
use crate::models::order::{Order, OrderStatus, PaymentStatus, TrackingLocation};
use crate::models::transition::Transition;

/// Process-local backend. Conditional writes run under the row's shard lock, which
/// gives the same one-winner guarantee as a guarded `UPDATE`.
#[derive(Default)]
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    users: DashMap<Uuid, User>,
    payments: DashMap<String, PaymentRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_orders_by_courier(&self) -> HashMap<Uuid, u32> {
        let mut counts = HashMap::new();
        for entry in self.orders.iter() {
            let order = entry.value();
            let active = matches!(order.status, OrderStatus::Accepted | OrderStatus::InTransit);
            if let (true, Some(courier_id)) = (active, order.courier_id) {
                *counts.entry(courier_id).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("order {}", order.id))),
            Entry::Vacant(slot) => {
                slot.insert(order);
                Ok(())
            }
        }
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn try_transition(&self, id: Uuid, transition: Transition) -> Result<bool, StoreError> {
        match self.orders.get_mut(&id) {
            Some(mut order) => Ok(transition.try_apply(&mut order, Utc::now())),
            None => Ok(false),
        }
    }

    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus) -> Result<bool, StoreError> {
        match self.orders.get_mut(&id) {
            Some(mut order) => {
                if order.payment_status != status {
                    order.payment_status = status;
                    order.updated_at = Utc::now();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_tracking(&self, id: Uuid, location: TrackingLocation) -> Result<bool, StoreError> {
        match self.orders.get_mut(&id) {
            Some(mut order) => {
                order.tracking = Some(location);
                order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CourierStore for MemoryStore {
    async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_couriers(&self) -> Result<Vec<User>, StoreError> {
        let mut couriers: Vec<User> = self
            .users
            .iter()
            .filter(|entry| entry.value().role == UserRole::Courier)
            .map(|entry| entry.value().clone())
            .collect();
        couriers.sort_by_key(|user| user.id);
        Ok(couriers)
    }

    async fn set_location(&self, id: Uuid, location: GeoPoint) -> Result<bool, StoreError> {
        match self.users.get_mut(&id) {
            Some(mut user) => {
                user.location = Some(location);
                user.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn courier_pool(&self) -> Result<Vec<CourierSnapshot>, StoreError> {
        let active = self.active_orders_by_courier();
        let mut pool: Vec<CourierSnapshot> = self
            .users
            .iter()
            .filter_map(|entry| {
                let user = entry.value();
                match (user.role, user.location) {
                    (UserRole::Courier, Some(location)) => Some(CourierSnapshot {
                        id: user.id,
                        location,
                        rating: user.rating,
                        active_orders: active.get(&user.id).copied().unwrap_or(0),
                    }),
                    _ => None,
                }
            })
            .collect();
        pool.sort_by_key(|courier| courier.id);
        Ok(pool)
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn record_payment(&self, payment: PaymentRecord) -> Result<(), StoreError> {
        match self.payments.entry(payment.transaction_ref.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!(
                "transaction {}",
                payment.transaction_ref
            ))),
            Entry::Vacant(slot) => {
                slot.insert(payment);
                Ok(())
            }
        }
    }

    async fn order_for_transaction(&self, transaction_ref: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .payments
            .get(transaction_ref)
            .map(|entry| entry.value().order_id))
    }

    async fn set_gateway_status(&self, transaction_ref: &str, status: &str) -> Result<bool, StoreError> {
        match self.payments.get_mut(transaction_ref) {
            Some(mut payment) => {
                payment.status = status.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::MemoryStore;
    use crate::models::courier::{GeoPoint, User, UserRole};
    use crate::models::order::{
        CourierStatus, CylinderType, Order, OrderStatus, PaymentStatus,
    };
    use crate::models::transition::Transition;
    use crate::store::{CourierStore, OrderFilter, OrderStore};

    fn order(id: u128, status: OrderStatus, courier: Option<u128>) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::from_u128(id),
            user_id: Uuid::from_u128(1000),
            provider_id: Some(Uuid::from_u128(2000)),
            courier_id: courier.map(Uuid::from_u128),
            status,
            courier_status: if courier.is_some() {
                CourierStatus::Pending
            } else {
                CourierStatus::None
            },
            payment_status: PaymentStatus::Pending,
            cylinder_type: CylinderType::Kg12,
            quantity: 1,
            price_per_unit: 300.0,
            total_price: 300.0,
            delivery_fee: 0.0,
            service_charge: 0.0,
            grand_total: 300.0,
            delivery_address: "Rhodes Park".to_string(),
            delivery_method: None,
            payment_method: None,
            tracking: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn courier(id: u128, location: Option<GeoPoint>) -> User {
        User {
            id: Uuid::from_u128(id),
            role: UserRole::Courier,
            name: format!("courier-{id}"),
            location,
            rating: 4.0,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_order_ids_are_refused() {
        let store = MemoryStore::new();
        store.insert_order(order(1, OrderStatus::Pending, None)).await.unwrap();
        assert!(store.insert_order(order(1, OrderStatus::Pending, None)).await.is_err());
    }

    #[tokio::test]
    async fn transition_on_missing_order_changes_nothing() {
        let store = MemoryStore::new();
        let applied = store
            .try_transition(Uuid::from_u128(404), Transition::Reject)
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn only_one_racing_courier_accept_wins() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_order(order(1, OrderStatus::Accepted, Some(10)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_transition(
                        Uuid::from_u128(1),
                        Transition::CourierAccept {
                            courier_id: Uuid::from_u128(10),
                        },
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn pool_counts_only_active_orders_and_skips_unlocated_couriers() {
        let store = MemoryStore::new();
        store
            .upsert_user(courier(10, Some(GeoPoint::new(-15.41, 28.28))))
            .await
            .unwrap();
        store.upsert_user(courier(11, None)).await.unwrap();

        store.insert_order(order(1, OrderStatus::Accepted, Some(10))).await.unwrap();
        store.insert_order(order(2, OrderStatus::InTransit, Some(10))).await.unwrap();
        store.insert_order(order(3, OrderStatus::Delivered, Some(10))).await.unwrap();
        store.insert_order(order(4, OrderStatus::Pending, Some(10))).await.unwrap();

        let pool = store.courier_pool().await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].id, Uuid::from_u128(10));
        assert_eq!(pool[0].active_orders, 2);
    }

    #[tokio::test]
    async fn unassigned_filter_hides_orders_with_a_courier() {
        let store = MemoryStore::new();
        store.insert_order(order(1, OrderStatus::Accepted, Some(10))).await.unwrap();
        store.insert_order(order(2, OrderStatus::Accepted, None)).await.unwrap();

        let open = store
            .list_orders(&OrderFilter::default().with_status(OrderStatus::Accepted).unassigned())
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, Uuid::from_u128(2));
    }
}
