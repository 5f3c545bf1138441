use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::DispatchOutcome;
use crate::models::order::{NewOrder, Order, OrderStatus, TrackingLocation};
use crate::state::AppState;
use crate::store::OrderFilter;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", post(accept_order))
        .route("/orders/:id/reject", post(reject_order))
        .route("/orders/:id/assign", post(assign_courier))
        .route("/orders/:id/dispatch", post(dispatch_order))
        .route("/orders/:id/courier/accept", post(accept_assignment))
        .route("/orders/:id/courier/decline", post(decline_assignment))
        .route("/orders/:id/status", patch(update_status))
        .route("/orders/:id/location", patch(update_location))
        .route("/admin/orders/:id/assign", post(admin_assign_courier))
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<OrderStatus>,
    pub provider_id: Option<Uuid>,
    pub courier_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub unassigned: bool,
}

#[derive(Deserialize)]
pub struct AcceptOrderRequest {
    pub provider_id: Uuid,
}

#[derive(Deserialize)]
pub struct CourierRequest {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewOrder>,
) -> Result<Json<Order>, AppError> {
    let order = state.dispatcher.create_order(payload).await?;
    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let filter = OrderFilter {
        status: query.status,
        provider_id: query.provider_id,
        courier_id: query.courier_id,
        user_id: query.user_id,
        unassigned: query.unassigned,
    };
    let orders = state.dispatcher.list_orders(&filter).await?;
    Ok(Json(orders))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.get_order(id).await?))
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .accept_order(payload.provider_id, id)
        .await?;
    Ok(Json(order))
}

async fn reject_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.reject_order(id).await?))
}

async fn assign_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .assign_courier(id, payload.courier_id)
        .await?;
    Ok(Json(order))
}

async fn admin_assign_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .admin_assign_courier(id, payload.courier_id)
        .await?;
    Ok(Json(order))
}

async fn dispatch_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchOutcome>, AppError> {
    Ok(Json(state.dispatcher.dispatch(id).await?))
}

async fn accept_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .accept_courier_assignment(id, payload.courier_id)
        .await?;
    Ok(Json(order))
}

async fn decline_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .decline_courier_assignment(id, payload.courier_id)
        .await?;
    Ok(Json(order))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .update_order_status(id, payload.status)
        .await?;
    Ok(Json(order))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TrackingLocation>,
) -> Result<Json<Order>, AppError> {
    let order = state.dispatcher.update_order_location(id, payload).await?;
    Ok(Json(order))
}
