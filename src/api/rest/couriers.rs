use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::MatchOutcome;
use crate::models::courier::{GeoPoint, User, UserRole};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/best", get(best_courier))
        .route("/couriers/:id/location", patch(update_courier_location))
        .route("/providers", post(create_provider))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub rating: f64,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct BestCourierQuery {
    pub lat: f64,
    pub lng: f64,
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Json<User>, AppError> {
    register(&state, UserRole::Courier, payload).await
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Json<User>, AppError> {
    register(&state, UserRole::Provider, payload).await
}

async fn register(
    state: &AppState,
    role: UserRole,
    payload: CreateUserRequest,
) -> Result<Json<User>, AppError> {
    let user = User {
        id: Uuid::new_v4(),
        role,
        name: payload.name,
        location: payload.location,
        rating: payload.rating,
        updated_at: Utc::now(),
    };
    Ok(Json(state.dispatcher.register_user(user).await?))
}

async fn list_couriers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(state.dispatcher.list_couriers().await?))
}

async fn best_courier(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BestCourierQuery>,
) -> Result<Json<MatchOutcome>, AppError> {
    let outcome = state
        .dispatcher
        .find_best_courier(GeoPoint::new(query.lat, query.lng))
        .await?;
    Ok(Json(outcome))
}

async fn update_courier_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<User>, AppError> {
    let courier = state
        .dispatcher
        .update_user_location(id, UserRole::Courier, payload.location)
        .await?;
    Ok(Json(courier))
}
