use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::bounded;
use crate::engine::scoring::{find_best_courier, MatcherConfig};
use crate::error::AppError;
use crate::models::assignment::{DispatchEvent, DispatchOutcome, DispatchTrigger, MatchOutcome};
use crate::models::courier::{GeoPoint, User, UserRole};
use crate::models::order::{NewOrder, Order, OrderStatus, TrackingLocation};
use crate::models::transition::Transition;
use crate::observability::metrics::Metrics;
use crate::store::{CourierStore, OrderFilter, OrderStore};

/// Owns the order lifecycle: every status or courier change goes through here and lands
/// as a single conditional write on the order row.
pub struct Dispatcher {
    orders: Arc<dyn OrderStore>,
    users: Arc<dyn CourierStore>,
    matcher: MatcherConfig,
    db_timeout: Duration,
    default_reference: GeoPoint,
    decline_cooldown: Duration,
    /// (order, courier) -> instant the courier becomes eligible again for that order.
    declined: DashMap<(Uuid, Uuid), Instant>,
    events_tx: broadcast::Sender<DispatchEvent>,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        users: Arc<dyn CourierStore>,
        config: &Config,
        events_tx: broadcast::Sender<DispatchEvent>,
        metrics: Metrics,
    ) -> Self {
        Self {
            orders,
            users,
            matcher: config.matcher,
            db_timeout: config.db_timeout,
            default_reference: config.default_reference,
            decline_cooldown: config.decline_cooldown,
            declined: DashMap::new(),
            events_tx,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events_tx.subscribe()
    }

    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order, AppError> {
        let order = new_order.into_order(Utc::now())?;
        bounded(
            self.db_timeout,
            "insert_order",
            self.orders.insert_order(order.clone()),
        )
        .await?;

        info!(
            order_id = %order.id,
            user_id = %order.user_id,
            cylinder_type = order.cylinder_type.as_str(),
            grand_total = order.grand_total,
            "order created"
        );
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        bounded(self.db_timeout, "get_order", self.orders.get_order(order_id))
            .await?
            .ok_or_else(|| AppError::order_not_found(order_id))
    }

    pub async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, AppError> {
        bounded(self.db_timeout, "list_orders", self.orders.list_orders(filter)).await
    }

    pub async fn register_user(&self, user: User) -> Result<User, AppError> {
        if user.name.trim().is_empty() {
            return Err(AppError::Validation("name cannot be empty".to_string()));
        }
        if user.location.is_some_and(|location| !location.is_valid()) {
            return Err(AppError::Validation("location is out of range".to_string()));
        }
        if user.rating.is_nan() {
            return Err(AppError::Validation("rating must be a number".to_string()));
        }

        let user = User {
            rating: user.rating.clamp(0.0, 5.0),
            ..user
        };
        bounded(self.db_timeout, "upsert_user", self.users.upsert_user(user.clone())).await?;
        info!(user_id = %user.id, role = user.role.as_str(), "user registered");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid, role: UserRole) -> Result<User, AppError> {
        match bounded(self.db_timeout, "get_user", self.users.get_user(user_id)).await? {
            Some(user) if user.role == role => Ok(user),
            _ => Err(AppError::NotFound(format!(
                "{} {user_id} not found",
                role.as_str()
            ))),
        }
    }

    pub async fn list_couriers(&self) -> Result<Vec<User>, AppError> {
        bounded(self.db_timeout, "list_couriers", self.users.list_couriers()).await
    }

    pub async fn update_user_location(
        &self,
        user_id: Uuid,
        role: UserRole,
        location: GeoPoint,
    ) -> Result<User, AppError> {
        if !location.is_valid() {
            return Err(AppError::Validation("location is out of range".to_string()));
        }
        self.get_user(user_id, role).await?;
        bounded(
            self.db_timeout,
            "set_location",
            self.users.set_location(user_id, location),
        )
        .await?;
        self.get_user(user_id, role).await
    }

    /// Moves a pending order to accepted and tries to hand it to a courier near the
    /// provider. Matching problems are logged and never undo the acceptance.
    pub async fn accept_order(&self, provider_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let provider = self.get_user(provider_id, UserRole::Provider).await?;
        let accepted = self
            .transition(order_id, Transition::ProviderAccept { provider_id })
            .await?;
        info!(order_id = %order_id, provider_id = %provider_id, "order accepted by provider");

        match self
            .attempt(order_id, DispatchTrigger::ProviderAccepted, provider.location)
            .await
        {
            Ok(DispatchOutcome::Assigned { .. }) => {
                Ok(self.get_order(order_id).await.unwrap_or(accepted))
            }
            Ok(_) => Ok(accepted),
            Err(err) => {
                warn!(
                    order_id = %order_id,
                    error = %err,
                    "dispatch after provider acceptance failed; order stays accepted"
                );
                Ok(accepted)
            }
        }
    }

    pub async fn reject_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.transition(order_id, Transition::Reject).await?;
        info!(order_id = %order_id, "order rejected");
        Ok(order)
    }

    /// Puts `courier_id` on an accepted order that has no courier yet.
    pub async fn assign_courier(&self, order_id: Uuid, courier_id: Uuid) -> Result<Order, AppError> {
        self.get_user(courier_id, UserRole::Courier).await?;
        let order = self
            .transition(order_id, Transition::Assign { courier_id })
            .await?;
        self.publish_attempt(
            order_id,
            DispatchTrigger::Manual,
            None,
            &DispatchOutcome::Assigned {
                courier_id,
                score: None,
            },
        );
        Ok(order)
    }

    /// Admin override: replaces whatever courier a non-terminal order has.
    pub async fn admin_assign_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Order, AppError> {
        self.get_user(courier_id, UserRole::Courier).await?;
        let previous = self.get_order(order_id).await?.courier_id;
        let order = self
            .transition(order_id, Transition::ForceAssign { courier_id })
            .await?;

        warn!(
            order_id = %order_id,
            courier_id = %courier_id,
            previous_courier_id = ?previous,
            "courier force-assigned by admin"
        );
        self.publish_attempt(
            order_id,
            DispatchTrigger::Admin,
            None,
            &DispatchOutcome::Assigned {
                courier_id,
                score: None,
            },
        );
        Ok(order)
    }

    pub async fn accept_courier_assignment(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Order, AppError> {
        let order = self
            .transition(order_id, Transition::CourierAccept { courier_id })
            .await?;
        info!(order_id = %order_id, courier_id = %courier_id, "courier accepted assignment");
        let _ = self.events_tx.send(DispatchEvent::CourierAccepted {
            order_id,
            courier_id,
            at: order.updated_at,
        });
        Ok(order)
    }

    /// Clears the courier and returns the order to accepted so it can be matched again.
    pub async fn decline_courier_assignment(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Order, AppError> {
        let order = self
            .transition(order_id, Transition::CourierDecline { courier_id })
            .await?;

        if !self.decline_cooldown.is_zero() {
            self.declined
                .insert((order_id, courier_id), Instant::now() + self.decline_cooldown);
        }

        info!(order_id = %order_id, courier_id = %courier_id, "courier declined assignment");
        let _ = self.events_tx.send(DispatchEvent::CourierDeclined {
            order_id,
            courier_id,
            at: order.updated_at,
        });
        Ok(order)
    }

    /// Read-only lookup of the courier the matcher would pick at `reference`.
    pub async fn find_best_courier(&self, reference: GeoPoint) -> Result<MatchOutcome, AppError> {
        if !reference.is_valid() {
            return Err(AppError::Validation("reference is out of range".to_string()));
        }

        let started = Instant::now();
        let pool = bounded(self.db_timeout, "courier_pool", self.users.courier_pool()).await?;
        let outcome = find_best_courier(&self.matcher, &reference, &pool, &HashSet::new());
        self.metrics
            .match_latency_seconds
            .with_label_values(&["lookup"])
            .observe(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<Order, AppError> {
        let transition = match status {
            OrderStatus::Rejected => Transition::Reject,
            OrderStatus::InTransit => Transition::MarkInTransit,
            OrderStatus::Delivered => Transition::Deliver,
            OrderStatus::Accepted => {
                return Err(AppError::Validation(
                    "orders become accepted only through provider acceptance".to_string(),
                ));
            }
            OrderStatus::Pending => {
                let order = self.get_order(order_id).await?;
                return Err(AppError::InvalidTransition {
                    order_id,
                    from: order.status,
                    to: status.as_str().to_string(),
                });
            }
        };

        let order = self.transition(order_id, transition).await?;
        info!(order_id = %order_id, status = %order.status, "order status updated");
        if order.status == OrderStatus::Delivered {
            let _ = self.events_tx.send(DispatchEvent::Delivered {
                order_id,
                at: order.updated_at,
            });
        }
        Ok(order)
    }

    pub async fn update_order_location(
        &self,
        order_id: Uuid,
        location: TrackingLocation,
    ) -> Result<Order, AppError> {
        if !GeoPoint::new(location.lat, location.lng).is_valid() {
            return Err(AppError::Validation("location is out of range".to_string()));
        }

        let found = bounded(
            self.db_timeout,
            "set_tracking",
            self.orders.set_tracking(order_id, location),
        )
        .await?;
        if !found {
            return Err(AppError::order_not_found(order_id));
        }
        debug!(order_id = %order_id, "tracking location updated");
        self.get_order(order_id).await
    }

    /// Re-runs matching for an accepted order that has no courier.
    pub async fn dispatch(&self, order_id: Uuid) -> Result<DispatchOutcome, AppError> {
        let order = self.get_order(order_id).await?;
        if order.courier_id.is_some() {
            return Err(AppError::AlreadyAssigned(order_id));
        }
        if !is_open_for_assignment(&order) {
            return Err(AppError::InvalidTransition {
                order_id,
                from: order.status,
                to: "dispatch".to_string(),
            });
        }

        let reference = self.reference_for(&order).await?;
        self.attempt(order_id, DispatchTrigger::Manual, Some(reference))
            .await
    }

    /// Reaction to a completed payment. An order that already has a courier, or that
    /// no provider has accepted yet, is left untouched.
    pub async fn auto_assign_after_payment(
        &self,
        order_id: Uuid,
    ) -> Result<DispatchOutcome, AppError> {
        let order = self.get_order(order_id).await?;
        if let Some(courier_id) = order.courier_id {
            debug!(order_id = %order_id, courier_id = %courier_id, "order already has a courier");
            return Ok(DispatchOutcome::Skipped {
                reason: "courier already assigned".to_string(),
            });
        }
        if order.provider_id.is_none() || !is_open_for_assignment(&order) {
            debug!(order_id = %order_id, status = %order.status, "order not yet accepted by a provider");
            return Ok(DispatchOutcome::Skipped {
                reason: format!("order is {}", order.status),
            });
        }

        let reference = self.reference_for(&order).await?;
        self.attempt(order_id, DispatchTrigger::PaymentCompleted, Some(reference))
            .await
    }

    /// Applies `transition` and returns the row as written. When the guard does not
    /// hold, the row is read once more to report which condition failed.
    async fn transition(&self, order_id: Uuid, transition: Transition) -> Result<Order, AppError> {
        let applied = bounded(
            self.db_timeout,
            transition.name(),
            self.orders.try_transition(order_id, transition),
        )
        .await?;
        self.metrics
            .transitions_total
            .with_label_values(&[transition.name(), if applied { "applied" } else { "refused" }])
            .inc();

        if !applied {
            return Err(self.explain_refusal(order_id, transition).await);
        }
        self.get_order(order_id).await
    }

    async fn explain_refusal(&self, order_id: Uuid, transition: Transition) -> AppError {
        let order = match self.get_order(order_id).await {
            Ok(order) => order,
            Err(err) => return err,
        };

        if let Some(courier_id) = transition.acting_courier() {
            if order.courier_id != Some(courier_id) {
                return AppError::CourierMismatch {
                    order_id,
                    courier_id,
                };
            }
        }
        if matches!(transition, Transition::Assign { .. })
            && order.courier_id.is_some()
            && !order.status.is_terminal()
        {
            return AppError::AlreadyAssigned(order_id);
        }

        AppError::InvalidTransition {
            order_id,
            from: order.status,
            to: transition.name().to_string(),
        }
    }

    async fn reference_for(&self, order: &Order) -> Result<GeoPoint, AppError> {
        let provider = match order.provider_id {
            Some(provider_id) => {
                bounded(self.db_timeout, "get_user", self.users.get_user(provider_id)).await?
            }
            None => None,
        };

        match provider.and_then(|provider| provider.location) {
            Some(location) => Ok(location),
            None => {
                warn!(order_id = %order.id, "provider has no location; using default reference");
                Ok(self.default_reference)
            }
        }
    }

    async fn attempt(
        &self,
        order_id: Uuid,
        trigger: DispatchTrigger,
        reference: Option<GeoPoint>,
    ) -> Result<DispatchOutcome, AppError> {
        let outcome = match reference {
            Some(reference) => match self.match_and_assign(order_id, trigger, &reference).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.metrics
                        .dispatch_attempts_total
                        .with_label_values(&[trigger.as_str(), "error"])
                        .inc();
                    return Err(err);
                }
            },
            None => DispatchOutcome::Skipped {
                reason: "no reference location".to_string(),
            },
        };

        self.publish_attempt(order_id, trigger, reference, &outcome);
        Ok(outcome)
    }

    async fn match_and_assign(
        &self,
        order_id: Uuid,
        trigger: DispatchTrigger,
        reference: &GeoPoint,
    ) -> Result<DispatchOutcome, AppError> {
        let started = Instant::now();
        let pool = bounded(self.db_timeout, "courier_pool", self.users.courier_pool()).await?;
        let excluded = self.excluded_couriers(order_id);
        let outcome = find_best_courier(&self.matcher, reference, &pool, &excluded);
        self.metrics
            .match_latency_seconds
            .with_label_values(&[trigger.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let scored = match outcome {
            MatchOutcome::Matched(scored) => scored,
            MatchOutcome::Unavailable => return Ok(DispatchOutcome::Unavailable),
        };

        let assign = Transition::Assign {
            courier_id: scored.courier_id,
        };
        let applied = bounded(
            self.db_timeout,
            assign.name(),
            self.orders.try_transition(order_id, assign),
        )
        .await?;
        self.metrics
            .transitions_total
            .with_label_values(&[assign.name(), if applied { "applied" } else { "refused" }])
            .inc();

        if !applied {
            return Ok(DispatchOutcome::Skipped {
                reason: "order no longer open for assignment".to_string(),
            });
        }

        let utilization =
            f64::from(scored.active_orders + 1) / f64::from(self.matcher.max_active_orders);
        self.metrics
            .courier_utilization
            .with_label_values(&[&scored.courier_id.to_string()])
            .set(utilization.min(1.0));

        Ok(DispatchOutcome::Assigned {
            courier_id: scored.courier_id,
            score: Some(scored.score),
        })
    }

    fn excluded_couriers(&self, order_id: Uuid) -> HashSet<Uuid> {
        if self.decline_cooldown.is_zero() {
            return HashSet::new();
        }

        let now = Instant::now();
        self.declined.retain(|_, until| *until > now);
        self.declined
            .iter()
            .filter(|entry| entry.key().0 == order_id)
            .map(|entry| entry.key().1)
            .collect()
    }

    fn publish_attempt(
        &self,
        order_id: Uuid,
        trigger: DispatchTrigger,
        reference: Option<GeoPoint>,
        outcome: &DispatchOutcome,
    ) {
        self.metrics
            .dispatch_attempts_total
            .with_label_values(&[trigger.as_str(), outcome.label()])
            .inc();

        match outcome {
            DispatchOutcome::Assigned { courier_id, score } => info!(
                order_id = %order_id,
                courier_id = %courier_id,
                trigger = trigger.as_str(),
                score = ?score,
                "courier assigned"
            ),
            DispatchOutcome::Unavailable => warn!(
                order_id = %order_id,
                trigger = trigger.as_str(),
                "no courier within radius and under load cap"
            ),
            DispatchOutcome::Skipped { reason } => info!(
                order_id = %order_id,
                trigger = trigger.as_str(),
                reason = %reason,
                "dispatch skipped"
            ),
        }

        let _ = self.events_tx.send(DispatchEvent::DispatchAttempted {
            order_id,
            trigger,
            reference,
            outcome: outcome.clone(),
            at: Utc::now(),
        });
    }
}

fn is_open_for_assignment(order: &Order) -> bool {
    matches!(order.status, OrderStatus::Accepted | OrderStatus::InTransit)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::Dispatcher;
    use crate::config::Config;
    use crate::error::AppError;
    use crate::models::assignment::{DispatchEvent, DispatchOutcome, MatchOutcome};
    use crate::models::courier::{GeoPoint, User, UserRole};
    use crate::models::order::{
        CourierStatus, CylinderType, NewOrder, Order, OrderStatus, PaymentStatus,
        TrackingLocation,
    };
    use crate::models::transition::Transition;
    use crate::observability::metrics::Metrics;
    use crate::store::{MemoryStore, OrderFilter, OrderStore, StoreError};

    const PROVIDER: u128 = 0xA;
    const COURIER_A: u128 = 0xC1;
    const COURIER_B: u128 = 0xC2;

    fn setup(config: Config) -> (Dispatcher, Arc<MemoryStore>, broadcast::Receiver<DispatchEvent>) {
        let store = Arc::new(MemoryStore::new());
        let (events_tx, events_rx) = broadcast::channel(64);
        let dispatcher =
            Dispatcher::new(store.clone(), store.clone(), &config, events_tx, Metrics::new());
        (dispatcher, store, events_rx)
    }

    fn user(id: u128, role: UserRole, location: Option<GeoPoint>, rating: f64) -> User {
        User {
            id: Uuid::from_u128(id),
            role,
            name: format!("{}-{id}", role.as_str()),
            location,
            rating,
            updated_at: Utc::now(),
        }
    }

    fn new_order(quantity: i64) -> NewOrder {
        NewOrder {
            user_id: Uuid::from_u128(0xCAFE),
            cylinder_type: Some(CylinderType::Kg12),
            quantity,
            price_per_unit: 350.0,
            delivery_fee: 25.0,
            service_charge: 5.0,
            delivery_address: "Plot 12, Kabulonga".to_string(),
            delivery_method: Some("delivery".to_string()),
            payment_method: Some("mobile_money".to_string()),
        }
    }

    fn busy_order(courier: u128) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::from_u128(0xBEEF),
            provider_id: Some(Uuid::from_u128(PROVIDER)),
            courier_id: Some(Uuid::from_u128(courier)),
            status: OrderStatus::InTransit,
            courier_status: CourierStatus::Accepted,
            payment_status: PaymentStatus::Paid,
            cylinder_type: CylinderType::Kg6,
            quantity: 1,
            price_per_unit: 150.0,
            total_price: 150.0,
            delivery_fee: 0.0,
            service_charge: 0.0,
            grand_total: 150.0,
            delivery_address: "Chelston".to_string(),
            delivery_method: None,
            payment_method: None,
            tracking: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seeded(config: Config) -> (Dispatcher, Arc<MemoryStore>, broadcast::Receiver<DispatchEvent>) {
        let (dispatcher, store, events) = setup(config);
        dispatcher
            .register_user(user(
                PROVIDER,
                UserRole::Provider,
                Some(GeoPoint::new(-12.9165, 28.2949)),
                4.0,
            ))
            .await
            .unwrap();
        dispatcher
            .register_user(user(
                COURIER_A,
                UserRole::Courier,
                Some(GeoPoint::new(-12.92, 28.30)),
                5.0,
            ))
            .await
            .unwrap();
        (dispatcher, store, events)
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected_before_any_write() {
        let (dispatcher, store, _events) = setup(Config::default());

        let err = dispatcher.create_order(new_order(0)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let stored = store.list_orders(&OrderFilter::default()).await.unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn provider_acceptance_assigns_the_better_scored_courier() {
        let (dispatcher, store, _events) = seeded(Config::default()).await;
        dispatcher
            .register_user(user(
                COURIER_B,
                UserRole::Courier,
                Some(GeoPoint::new(-12.92, 28.30)),
                3.0,
            ))
            .await
            .unwrap();
        store.insert_order(busy_order(COURIER_B)).await.unwrap();
        store.insert_order(busy_order(COURIER_B)).await.unwrap();

        let order = dispatcher.create_order(new_order(2)).await.unwrap();
        let accepted = dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        assert_eq!(accepted.status, OrderStatus::Accepted);
        assert_eq!(accepted.courier_id, Some(Uuid::from_u128(COURIER_A)));
        assert_eq!(accepted.courier_status, CourierStatus::Pending);
        assert_eq!(accepted.provider_id, Some(Uuid::from_u128(PROVIDER)));
    }

    #[tokio::test]
    async fn accepting_twice_fails_and_does_not_dispatch_again() {
        let (dispatcher, _store, mut events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();

        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();
        let err = dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let mut attempts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DispatchEvent::DispatchAttempted { .. }) {
                attempts += 1;
            }
        }
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn acceptance_without_courier_in_range_leaves_order_accepted() {
        let (dispatcher, _store, _events) = setup(Config::default());
        dispatcher
            .register_user(user(
                PROVIDER,
                UserRole::Provider,
                Some(GeoPoint::new(-15.4167, 28.2833)),
                4.0,
            ))
            .await
            .unwrap();
        dispatcher
            .register_user(user(
                COURIER_A,
                UserRole::Courier,
                Some(GeoPoint::new(-12.9165, 28.2949)),
                5.0,
            ))
            .await
            .unwrap();

        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        let accepted = dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        assert_eq!(accepted.status, OrderStatus::Accepted);
        assert_eq!(accepted.courier_id, None);
        assert_eq!(accepted.courier_status, CourierStatus::None);
    }

    #[tokio::test]
    async fn decline_clears_courier_and_rematch_may_pick_it_again() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        let declined = dispatcher
            .decline_courier_assignment(order.id, Uuid::from_u128(COURIER_A))
            .await
            .unwrap();
        assert_eq!(declined.courier_id, None);
        assert_eq!(declined.courier_status, CourierStatus::None);
        assert_eq!(declined.status, OrderStatus::Accepted);

        let outcome = dispatcher.dispatch(order.id).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Assigned { courier_id, .. } if courier_id == Uuid::from_u128(COURIER_A)
        ));
    }

    #[tokio::test]
    async fn decline_cooldown_keeps_courier_out_of_rematch() {
        let config = Config {
            decline_cooldown: Duration::from_secs(60),
            ..Config::default()
        };
        let (dispatcher, _store, _events) = seeded(config).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();
        dispatcher
            .decline_courier_assignment(order.id, Uuid::from_u128(COURIER_A))
            .await
            .unwrap();

        let outcome = dispatcher.dispatch(order.id).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Unavailable);
    }

    #[tokio::test]
    async fn another_courier_cannot_respond_to_the_assignment() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        let intruder = Uuid::from_u128(COURIER_B);
        let err = dispatcher
            .accept_courier_assignment(order.id, intruder)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CourierMismatch { courier_id, .. } if courier_id == intruder));

        let err = dispatcher
            .decline_courier_assignment(order.id, intruder)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CourierMismatch { .. }));

        let unchanged = dispatcher.get_order(order.id).await.unwrap();
        assert_eq!(unchanged.courier_id, Some(Uuid::from_u128(COURIER_A)));
        assert_eq!(unchanged.courier_status, CourierStatus::Pending);
    }

    #[tokio::test]
    async fn delivery_forces_courier_status_completed() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        let in_transit = dispatcher
            .accept_courier_assignment(order.id, Uuid::from_u128(COURIER_A))
            .await
            .unwrap();
        assert_eq!(in_transit.status, OrderStatus::InTransit);
        assert_eq!(in_transit.courier_status, CourierStatus::Accepted);

        let delivered = dispatcher
            .update_order_status(order.id, OrderStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(delivered.status, OrderStatus::Delivered);
        assert_eq!(delivered.courier_status, CourierStatus::Completed);

        let err = dispatcher
            .update_order_status(order.id, OrderStatus::Rejected)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { from: OrderStatus::Delivered, .. }));
    }

    #[tokio::test]
    async fn status_update_cannot_accept_on_behalf_of_a_provider() {
        let (dispatcher, _store, _events) = setup(Config::default());
        let order = dispatcher.create_order(new_order(1)).await.unwrap();

        let err = dispatcher
            .update_order_status(order.id, OrderStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn payment_completion_on_assigned_order_changes_nothing() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        let before = dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        let outcome = dispatcher.auto_assign_after_payment(order.id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Skipped { .. }));

        let after = dispatcher.get_order(order.id).await.unwrap();
        assert_eq!(after.courier_id, before.courier_id);
        assert_eq!(after.courier_status, before.courier_status);
    }

    #[tokio::test]
    async fn payment_completion_falls_back_to_default_reference() {
        let (dispatcher, _store, _events) = setup(Config::default());
        dispatcher
            .register_user(user(PROVIDER, UserRole::Provider, None, 4.0))
            .await
            .unwrap();
        dispatcher
            .register_user(user(
                COURIER_A,
                UserRole::Courier,
                Some(GeoPoint::new(-15.42, 28.29)),
                4.5,
            ))
            .await
            .unwrap();

        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        let accepted = dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();
        assert_eq!(accepted.courier_id, None);

        let outcome = dispatcher.auto_assign_after_payment(order.id).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Assigned { courier_id, score: Some(_) } if courier_id == Uuid::from_u128(COURIER_A)
        ));
    }

    #[tokio::test]
    async fn payment_completion_before_provider_acceptance_is_skipped() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();

        let outcome = dispatcher.auto_assign_after_payment(order.id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Skipped { .. }));
        assert_eq!(dispatcher.get_order(order.id).await.unwrap().courier_id, None);
    }

    #[tokio::test]
    async fn admin_override_replaces_current_courier() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        dispatcher
            .register_user(user(COURIER_B, UserRole::Courier, None, 2.0))
            .await
            .unwrap();
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();

        let err = dispatcher
            .assign_courier(order.id, Uuid::from_u128(COURIER_B))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyAssigned(_)));

        let forced = dispatcher
            .admin_assign_courier(order.id, Uuid::from_u128(COURIER_B))
            .await
            .unwrap();
        assert_eq!(forced.courier_id, Some(Uuid::from_u128(COURIER_B)));
        assert_eq!(forced.courier_status, CourierStatus::Pending);
    }

    #[tokio::test]
    async fn declined_reassignment_returns_order_to_pool_and_blocks_delivery() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        dispatcher
            .register_user(user(COURIER_B, UserRole::Courier, None, 2.0))
            .await
            .unwrap();
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        dispatcher
            .accept_order(Uuid::from_u128(PROVIDER), order.id)
            .await
            .unwrap();
        dispatcher
            .accept_courier_assignment(order.id, Uuid::from_u128(COURIER_A))
            .await
            .unwrap();

        let forced = dispatcher
            .admin_assign_courier(order.id, Uuid::from_u128(COURIER_B))
            .await
            .unwrap();
        assert_eq!(forced.status, OrderStatus::InTransit);
        assert_eq!(forced.courier_status, CourierStatus::Pending);

        let declined = dispatcher
            .decline_courier_assignment(order.id, Uuid::from_u128(COURIER_B))
            .await
            .unwrap();
        assert_eq!(declined.status, OrderStatus::Accepted);
        assert_eq!(declined.courier_id, None);
        assert_eq!(declined.courier_status, CourierStatus::None);

        let err = dispatcher
            .update_order_status(order.id, OrderStatus::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { from: OrderStatus::Accepted, .. }));

        let outcome = dispatcher.dispatch(order.id).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Assigned { courier_id, .. } if courier_id == Uuid::from_u128(COURIER_A)
        ));
    }

    #[tokio::test]
    async fn rejecting_a_pending_order_detaches_an_admin_assigned_courier() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;
        let order = dispatcher.create_order(new_order(1)).await.unwrap();

        let forced = dispatcher
            .admin_assign_courier(order.id, Uuid::from_u128(COURIER_A))
            .await
            .unwrap();
        assert_eq!(forced.status, OrderStatus::Pending);
        assert_eq!(forced.courier_id, Some(Uuid::from_u128(COURIER_A)));

        let rejected = dispatcher.reject_order(order.id).await.unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(rejected.courier_id, None);
        assert_eq!(rejected.courier_status, CourierStatus::None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_provider_acceptance_has_one_winner() {
        let (dispatcher, _store, mut events) = seeded(Config::default()).await;
        let dispatcher = Arc::new(dispatcher);
        let order = dispatcher.create_order(new_order(1)).await.unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                dispatcher
                    .accept_order(Uuid::from_u128(PROVIDER), order.id)
                    .await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(
            dispatcher
                .metrics
                .transitions_total
                .with_label_values(&["provider_accept", "applied"])
                .get(),
            1
        );

        let mut attempts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DispatchEvent::DispatchAttempted { .. }) {
                attempts += 1;
            }
        }
        assert_eq!(attempts, 1);

        let stored = dispatcher.get_order(order.id).await.unwrap();
        assert_eq!(stored.courier_id, Some(Uuid::from_u128(COURIER_A)));
    }

    #[tokio::test]
    async fn lookup_never_returns_a_courier_beyond_the_radius() {
        let (dispatcher, _store, _events) = seeded(Config::default()).await;

        let outcome = dispatcher
            .find_best_courier(GeoPoint::new(-15.4167, 28.2833))
            .await
            .unwrap();
        assert_eq!(outcome, MatchOutcome::Unavailable);

        let near = dispatcher
            .find_best_courier(GeoPoint::new(-12.9165, 28.2949))
            .await
            .unwrap();
        assert_eq!(near.courier_id(), Some(Uuid::from_u128(COURIER_A)));
    }

    #[tokio::test]
    async fn tracking_update_on_unknown_order_is_not_found() {
        let (dispatcher, _store, _events) = setup(Config::default());
        let err = dispatcher
            .update_order_location(
                Uuid::from_u128(404),
                TrackingLocation {
                    lat: -15.4,
                    lng: 28.3,
                    address: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    struct StalledStore;

    #[async_trait]
    impl OrderStore for StalledStore {
        async fn insert_order(&self, _order: Order) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_order(&self, _id: Uuid) -> Result<Option<Order>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn list_orders(&self, _filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
            Ok(Vec::new())
        }

        async fn try_transition(&self, _id: Uuid, _transition: Transition) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn set_payment_status(&self, _id: Uuid, _status: PaymentStatus) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn set_tracking(&self, _id: Uuid, _location: TrackingLocation) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn slow_store_calls_surface_as_timeouts() {
        let config = Config {
            db_timeout: Duration::from_millis(20),
            ..Config::default()
        };
        let (events_tx, _events_rx) = broadcast::channel(4);
        let dispatcher = Dispatcher::new(
            Arc::new(StalledStore),
            Arc::new(MemoryStore::new()),
            &config,
            events_tx,
            Metrics::new(),
        );

        let err = dispatcher.get_order(Uuid::from_u128(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
    }
}
