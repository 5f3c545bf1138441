use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Courier,
    Provider,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Courier => "courier",
            UserRole::Provider => "provider",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "courier" => Some(UserRole::Courier),
            "provider" => Some(UserRole::Provider),
            _ => None,
        }
    }
}

/// A courier or provider row. Both roles share the `users` table; only the role decides
/// whether the record takes part in matching or serves as a dispatch reference point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub role: UserRole,
    pub name: String,
    pub location: Option<GeoPoint>,
    pub rating: f64,
    pub updated_at: DateTime<Utc>,
}

/// One row of the courier pool as seen by the matcher. `active_orders` is derived at
/// query time from orders in `accepted` or `in-transit` status and never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourierSnapshot {
    pub id: Uuid,
    pub location: GeoPoint,
    pub rating: f64,
    pub active_orders: u32,
}
