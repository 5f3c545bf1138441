use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub distance_score: f64,
    pub rating_score: f64,
    pub availability_score: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.distance_score + self.rating_score + self.availability_score
    }
}

/// Winner of a match, with the numbers that put it first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCourier {
    pub courier_id: Uuid,
    pub distance_km: f64,
    pub active_orders: u32,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(ScoredCourier),
    /// No courier within radius and under the load cap. A normal result.
    Unavailable,
}

impl MatchOutcome {
    pub fn courier_id(&self) -> Option<Uuid> {
        match self {
            MatchOutcome::Matched(scored) => Some(scored.courier_id),
            MatchOutcome::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DispatchTrigger {
    ProviderAccepted,
    PaymentCompleted,
    Manual,
    Admin,
}

impl DispatchTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchTrigger::ProviderAccepted => "provider_accepted",
            DispatchTrigger::PaymentCompleted => "payment_completed",
            DispatchTrigger::Manual => "manual",
            DispatchTrigger::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Assigned {
        courier_id: Uuid,
        score: Option<f64>,
    },
    Unavailable,
    /// The order was not eligible when the attempt ran, e.g. a courier already holds it.
    Skipped { reason: String },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Assigned { .. } => "assigned",
            DispatchOutcome::Unavailable => "unavailable",
            DispatchOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Broadcast to `/ws` subscribers whenever a dispatch attempt or courier response lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    DispatchAttempted {
        order_id: Uuid,
        trigger: DispatchTrigger,
        reference: Option<GeoPoint>,
        outcome: DispatchOutcome,
        at: DateTime<Utc>,
    },
    CourierAccepted {
        order_id: Uuid,
        courier_id: Uuid,
        at: DateTime<Utc>,
    },
    CourierDeclined {
        order_id: Uuid,
        courier_id: Uuid,
        at: DateTime<Utc>,
    },
    Delivered {
        order_id: Uuid,
        at: DateTime<Utc>,
    },
}
