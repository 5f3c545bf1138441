use std::cmp::Ordering;
use std::collections::HashSet;

use uuid::Uuid;

use crate::geo::haversine_km;
use crate::models::assignment::{MatchOutcome, ScoreBreakdown, ScoredCourier};
use crate::models::courier::{CourierSnapshot, GeoPoint};

const DISTANCE_POINTS: f64 = 40.0;
const RATING_POINTS: f64 = 30.0;
const AVAILABILITY_POINTS: f64 = 30.0;
const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    pub radius_km: f64,
    pub max_active_orders: u32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            radius_km: 10.0,
            max_active_orders: 3,
        }
    }
}

/// Scores one courier against `reference`. Returns `None` when the courier is outside
/// the radius or already carries the maximum number of active orders.
pub fn compute_score(
    config: &MatcherConfig,
    courier: &CourierSnapshot,
    reference: &GeoPoint,
) -> Option<ScoredCourier> {
    let distance_km = haversine_km(reference, &courier.location);
    if distance_km > config.radius_km || courier.active_orders >= config.max_active_orders {
        return None;
    }

    let breakdown = ScoreBreakdown {
        distance_score: distance_score(distance_km, config.radius_km),
        rating_score: rating_score(courier.rating),
        availability_score: availability_score(courier.active_orders, config.max_active_orders),
    };

    Some(ScoredCourier {
        courier_id: courier.id,
        distance_km,
        active_orders: courier.active_orders,
        score: breakdown.total(),
        score_breakdown: breakdown,
    })
}

/// Picks the highest scoring courier from a pool snapshot.
///
/// Ties on score go to the closer courier, then to the lower courier id, so the result
/// never depends on the order the store returned rows in.
pub fn find_best_courier(
    config: &MatcherConfig,
    reference: &GeoPoint,
    pool: &[CourierSnapshot],
    excluded: &HashSet<Uuid>,
) -> MatchOutcome {
    pool.iter()
        .filter(|courier| !excluded.contains(&courier.id))
        .filter_map(|courier| compute_score(config, courier, reference))
        .max_by(rank)
        .map_or(MatchOutcome::Unavailable, MatchOutcome::Matched)
}

fn rank(a: &ScoredCourier, b: &ScoredCourier) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.distance_km.total_cmp(&a.distance_km))
        .then_with(|| b.courier_id.cmp(&a.courier_id))
}

fn distance_score(distance_km: f64, radius_km: f64) -> f64 {
    if radius_km <= 0.0 {
        return DISTANCE_POINTS;
    }
    (radius_km - distance_km.max(0.0)) / radius_km * DISTANCE_POINTS
}

fn rating_score(rating: f64) -> f64 {
    rating.clamp(0.0, MAX_RATING) / MAX_RATING * RATING_POINTS
}

fn availability_score(active_orders: u32, max_active_orders: u32) -> f64 {
    if max_active_orders == 0 {
        return 0.0;
    }
    let free = max_active_orders.saturating_sub(active_orders) as f64;
    free / max_active_orders as f64 * AVAILABILITY_POINTS
}
