use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "in-transit")]
    InTransit,
    #[serde(rename = "delivered")]
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Rejected => "rejected",
            OrderStatus::InTransit => "in-transit",
            OrderStatus::Delivered => "delivered",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OrderStatus::Pending),
            "accepted" => Some(OrderStatus::Accepted),
            "rejected" => Some(OrderStatus::Rejected),
            "in-transit" => Some(OrderStatus::InTransit),
            "delivered" => Some(OrderStatus::Delivered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Delivered)
    }

    /// The only edges of the order lifecycle. in-transit -> accepted is taken only when
    /// a courier declines a reassignment, which returns the order to the pool.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Accepted)
                | (OrderStatus::Pending, OrderStatus::Rejected)
                | (OrderStatus::Accepted, OrderStatus::InTransit)
                | (OrderStatus::InTransit, OrderStatus::Accepted)
                | (OrderStatus::InTransit, OrderStatus::Delivered)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assignment sub-state of an order, independent from [`OrderStatus`].
///
/// `Declined` is transient: a decline clears the courier and lands back on `None` in
/// the same write, so it is only ever observed in events, never on a stored row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CourierStatus {
    None,
    Pending,
    Accepted,
    Declined,
    Completed,
}

impl CourierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourierStatus::None => "none",
            CourierStatus::Pending => "pending",
            CourierStatus::Accepted => "accepted",
            CourierStatus::Declined => "declined",
            CourierStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(CourierStatus::None),
            "pending" => Some(CourierStatus::Pending),
            "accepted" => Some(CourierStatus::Accepted),
            "declined" => Some(CourierStatus::Declined),
            "completed" => Some(CourierStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for CourierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CylinderType {
    #[serde(rename = "3KG")]
    Kg3,
    #[serde(rename = "5KG")]
    Kg5,
    #[serde(rename = "6KG")]
    Kg6,
    #[serde(rename = "9KG")]
    Kg9,
    #[serde(rename = "12KG")]
    Kg12,
    #[serde(rename = "13KG")]
    Kg13,
    #[serde(rename = "14KG")]
    Kg14,
    #[serde(rename = "15KG")]
    Kg15,
    #[serde(rename = "18KG")]
    Kg18,
    #[serde(rename = "19KG")]
    Kg19,
    #[serde(rename = "20KG")]
    Kg20,
    #[serde(rename = "45KG")]
    Kg45,
    #[serde(rename = "48KG")]
    Kg48,
}

impl CylinderType {
    const ALL: [CylinderType; 13] = [
        CylinderType::Kg3,
        CylinderType::Kg5,
        CylinderType::Kg6,
        CylinderType::Kg9,
        CylinderType::Kg12,
        CylinderType::Kg13,
        CylinderType::Kg14,
        CylinderType::Kg15,
        CylinderType::Kg18,
        CylinderType::Kg19,
        CylinderType::Kg20,
        CylinderType::Kg45,
        CylinderType::Kg48,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CylinderType::Kg3 => "3KG",
            CylinderType::Kg5 => "5KG",
            CylinderType::Kg6 => "6KG",
            CylinderType::Kg9 => "9KG",
            CylinderType::Kg12 => "12KG",
            CylinderType::Kg13 => "13KG",
            CylinderType::Kg14 => "14KG",
            CylinderType::Kg15 => "15KG",
            CylinderType::Kg18 => "18KG",
            CylinderType::Kg19 => "19KG",
            CylinderType::Kg20 => "20KG",
            CylinderType::Kg45 => "45KG",
            CylinderType::Kg48 => "48KG",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingLocation {
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub courier_id: Option<Uuid>,
    pub status: OrderStatus,
    pub courier_status: CourierStatus,
    pub payment_status: PaymentStatus,
    pub cylinder_type: CylinderType,
    pub quantity: u32,
    pub price_per_unit: f64,
    pub total_price: f64,
    pub delivery_fee: f64,
    pub service_charge: f64,
    pub grand_total: f64,
    pub delivery_address: String,
    pub delivery_method: Option<String>,
    pub payment_method: Option<String>,
    pub tracking: Option<TrackingLocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Customer-supplied fields for a new order. Totals are derived, never trusted.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub cylinder_type: Option<CylinderType>,
    pub quantity: i64,
    pub price_per_unit: f64,
    #[serde(default)]
    pub delivery_fee: f64,
    #[serde(default)]
    pub service_charge: f64,
    pub delivery_address: String,
    #[serde(default)]
    pub delivery_method: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.user_id.is_nil() {
            return Err(AppError::Validation("user id is required".to_string()));
        }
        if self.cylinder_type.is_none() {
            return Err(AppError::Validation("cylinder type is required".to_string()));
        }
        if self.quantity <= 0 {
            return Err(AppError::Validation(
                "quantity must be greater than 0".to_string(),
            ));
        }
        if u32::try_from(self.quantity).is_err() {
            return Err(AppError::Validation("quantity is too large".to_string()));
        }
        if self.price_per_unit.is_nan() || self.price_per_unit <= 0.0 {
            return Err(AppError::Validation(
                "price per unit must be greater than 0".to_string(),
            ));
        }
        if self.delivery_fee < 0.0 || self.service_charge < 0.0 {
            return Err(AppError::Validation(
                "fees cannot be negative".to_string(),
            ));
        }
        if self.delivery_address.trim().is_empty() {
            return Err(AppError::Validation(
                "delivery address is required".to_string(),
            ));
        }
        let grand_total = self.grand_total();
        if !grand_total.is_finite() || grand_total <= 0.0 {
            return Err(AppError::Validation(
                "grand total must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn total_price(&self) -> f64 {
        self.price_per_unit * self.quantity as f64
    }

    pub fn grand_total(&self) -> f64 {
        self.total_price() + self.delivery_fee + self.service_charge
    }

    /// Validates and builds the stored row.
    pub fn into_order(self, now: DateTime<Utc>) -> Result<Order, AppError> {
        self.validate()?;
        let total_price = self.total_price();
        let grand_total = self.grand_total();
        let cylinder_type = self
            .cylinder_type
            .ok_or_else(|| AppError::Validation("cylinder type is required".to_string()))?;
        let quantity = u32::try_from(self.quantity)
            .map_err(|_| AppError::Validation("quantity is too large".to_string()))?;

        Ok(Order {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            provider_id: None,
            courier_id: None,
            status: OrderStatus::Pending,
            courier_status: CourierStatus::None,
            payment_status: PaymentStatus::Pending,
            cylinder_type,
            quantity,
            price_per_unit: self.price_per_unit,
            total_price,
            delivery_fee: self.delivery_fee,
            service_charge: self.service_charge,
            grand_total,
            delivery_address: self.delivery_address,
            delivery_method: self.delivery_method,
            payment_method: self.payment_method,
            tracking: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(quantity: i64, price_per_unit: f64) -> NewOrder {
        NewOrder {
            user_id: Uuid::from_u128(7),
            cylinder_type: Some(CylinderType::Kg6),
            quantity,
            price_per_unit,
            delivery_fee: 15.0,
            service_charge: 5.0,
            delivery_address: "Plot 12, Kabulonga".to_string(),
            delivery_method: None,
            payment_method: None,
        }
    }

    #[test]
    fn lifecycle_edges_are_closed() {
        use OrderStatus::*;
        let all = [Pending, Accepted, Rejected, InTransit, Delivered];
        let allowed: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (Pending, Accepted),
                (Pending, Rejected),
                (Accepted, InTransit),
                (InTransit, Accepted),
                (InTransit, Delivered),
            ]
        );
        assert!(Rejected.is_terminal());
        assert!(Delivered.is_terminal());
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let err = new_order(0, 120.0).validate().unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("quantity")));
    }

    #[test]
    fn non_positive_price_is_rejected() {
        assert!(new_order(1, 0.0).validate().is_err());
        assert!(new_order(1, -3.0).validate().is_err());
        assert!(new_order(1, f64::NAN).validate().is_err());
    }

    #[test]
    fn missing_cylinder_type_is_rejected() {
        let mut order = new_order(1, 120.0);
        order.cylinder_type = None;
        assert!(order.validate().is_err());
    }

    #[test]
    fn totals_are_derived_from_unit_price() {
        let order = new_order(2, 120.0).into_order(Utc::now()).unwrap();
        assert_eq!(order.total_price, 240.0);
        assert_eq!(order.grand_total, 260.0);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.courier_status, CourierStatus::None);
        assert!(order.provider_id.is_none());
        assert!(order.courier_id.is_none());
    }

    #[test]
    fn status_strings_round_trip_through_the_wire_names() {
        assert_eq!(OrderStatus::parse("in-transit"), Some(OrderStatus::InTransit));
        assert_eq!(
            serde_json::to_string(&OrderStatus::InTransit).unwrap(),
            "\"in-transit\""
        );
        assert_eq!(CylinderType::parse("48KG"), Some(CylinderType::Kg48));
        assert_eq!(CylinderType::parse("7KG"), None);
    }
}
