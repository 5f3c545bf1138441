//! Conditional writes over an [`Order`].
//!
//! A [`Transition`] pairs the predicate a row must satisfy with the effect applied when
//! it does. Stores evaluate `permits` and `apply` as one atomic step, so a transition
//! either lands on the state it expected or reports that nothing changed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::order::{CourierStatus, Order, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// pending -> accepted, recording the accepting provider.
    ProviderAccept { provider_id: Uuid },
    /// pending -> rejected; a courier put there by an admin override is detached.
    Reject,
    /// Automatic or requested assignment; only onto an unassigned, accepted order.
    Assign { courier_id: Uuid },
    /// Admin override; replaces any current courier on a non-terminal order.
    ForceAssign { courier_id: Uuid },
    /// Courier sub-state pending -> accepted; order moves to in-transit.
    CourierAccept { courier_id: Uuid },
    /// Courier sub-state pending -> none with the courier cleared; the order reverts to
    /// accepted.
    CourierDecline { courier_id: Uuid },
    /// accepted -> in-transit driven by an operator rather than the courier.
    MarkInTransit,
    /// in-transit -> delivered for an order with a courier; courier sub-state is forced
    /// to completed.
    Deliver,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::ProviderAccept { .. } => "provider_accept",
            Transition::Reject => "reject",
            Transition::Assign { .. } => "assign",
            Transition::ForceAssign { .. } => "force_assign",
            Transition::CourierAccept { .. } => "courier_accept",
            Transition::CourierDecline { .. } => "courier_decline",
            Transition::MarkInTransit => "mark_in_transit",
            Transition::Deliver => "deliver",
        }
    }

    /// Courier the transition acts for, when the write is keyed on one.
    pub fn acting_courier(&self) -> Option<Uuid> {
        match self {
            Transition::CourierAccept { courier_id }
            | Transition::CourierDecline { courier_id } => Some(*courier_id),
            _ => None,
        }
    }

    /// Order statuses from which this transition may fire.
    pub fn expected_statuses(&self) -> &'static [OrderStatus] {
        match self {
            Transition::ProviderAccept { .. } | Transition::Reject => &[OrderStatus::Pending],
            Transition::Assign { .. }
            | Transition::CourierAccept { .. }
            | Transition::CourierDecline { .. } => &[OrderStatus::Accepted, OrderStatus::InTransit],
            Transition::ForceAssign { .. } => &[
                OrderStatus::Pending,
                OrderStatus::Accepted,
                OrderStatus::InTransit,
            ],
            Transition::MarkInTransit => &[OrderStatus::Accepted],
            Transition::Deliver => &[OrderStatus::InTransit],
        }
    }

    pub fn permits(&self, order: &Order) -> bool {
        if !self.expected_statuses().contains(&order.status) {
            return false;
        }

        match self {
            Transition::ProviderAccept { .. } | Transition::Reject | Transition::ForceAssign { .. } => {
                true
            }
            Transition::Assign { .. } => order.courier_id.is_none(),
            Transition::CourierAccept { courier_id } | Transition::CourierDecline { courier_id } => {
                order.courier_id == Some(*courier_id)
                    && order.courier_status == CourierStatus::Pending
            }
            Transition::MarkInTransit | Transition::Deliver => order.courier_id.is_some(),
        }
    }

    pub fn apply(&self, order: &mut Order, now: DateTime<Utc>) {
        match self {
            Transition::ProviderAccept { provider_id } => {
                order.status = OrderStatus::Accepted;
                order.provider_id = Some(*provider_id);
            }
            Transition::Reject => {
                order.status = OrderStatus::Rejected;
                order.courier_id = None;
                order.courier_status = CourierStatus::None;
            }
            Transition::Assign { courier_id } | Transition::ForceAssign { courier_id } => {
                order.courier_id = Some(*courier_id);
                order.courier_status = CourierStatus::Pending;
            }
            Transition::CourierAccept { .. } | Transition::MarkInTransit => {
                order.status = OrderStatus::InTransit;
                order.courier_status = CourierStatus::Accepted;
            }
            Transition::CourierDecline { .. } => {
                order.status = OrderStatus::Accepted;
                order.courier_id = None;
                order.courier_status = CourierStatus::None;
            }
            Transition::Deliver => {
                order.status = OrderStatus::Delivered;
                order.courier_status = CourierStatus::Completed;
            }
        }
        order.updated_at = now;
    }

    /// Evaluates the guard and applies the effect in one step. Returns whether the row
    /// changed.
    pub fn try_apply(&self, order: &mut Order, now: DateTime<Utc>) -> bool {
        if !self.permits(order) {
            return false;
        }
        self.apply(order, now);
        true
    }
}
