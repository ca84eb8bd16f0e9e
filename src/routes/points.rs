use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::PointsConfig;
use crate::db::models::{PointsTransaction, ViewerAccount};
use crate::error::{AppError, AppResult};
use crate::services::points::{PointsConfigUpdate, PointsService, PointsStats};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/config", put(update_config))
        .route("/users/:user_id", get(get_user_points))
        .route("/users/:user_id/award", post(award_points))
        .route("/users/:user_id/spend", post(spend_points))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UserPointsResponse {
    pub account: ViewerAccount,
    pub transactions: Vec<PointsTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustPointsRequest {
    pub amount: i64,
    pub reason: Option<String>,
    /// Used when the account has to be created first.
    pub display_name: Option<String>,
}

fn points_service(state: &AppState) -> AppResult<&Arc<PointsService>> {
    state
        .points
        .as_ref()
        .ok_or_else(|| AppError::ServiceUnavailable("Points ledger is not available".to_string()))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<PointsStats>> {
    let points = points_service(&state)?;
    Ok(Json(points.stats().await?))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<PointsConfigUpdate>,
) -> AppResult<Json<PointsConfig>> {
    let points = points_service(&state)?;
    Ok(Json(points.update_config(update).await?))
}

async fn get_user_points(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<UserPointsResponse>> {
    let points = points_service(&state)?;
    let account = points
        .get_account(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Viewer account {}", user_id)))?;
    let transactions = points
        .get_transactions(&user_id, query.limit.unwrap_or(50))
        .await?;

    Ok(Json(UserPointsResponse {
        account,
        transactions,
    }))
}

/// Manual award. Creates the account when it does not exist yet.
async fn award_points(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<AdjustPointsRequest>,
) -> AppResult<Json<ViewerAccount>> {
    let points = points_service(&state)?;
    if request.amount <= 0 {
        return Err(AppError::InvalidAmount(request.amount));
    }
    points
        .ensure_account(&user_id, request.display_name.as_deref().unwrap_or(&user_id))
        .await?;
    let account = points
        .award_points(
            &user_id,
            request.amount,
            request.reason.as_deref().unwrap_or("manual"),
        )
        .await?;
    Ok(Json(account))
}

async fn spend_points(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<AdjustPointsRequest>,
) -> AppResult<Json<ViewerAccount>> {
    let points = points_service(&state)?;
    let account = points
        .spend_points(
            &user_id,
            request.amount,
            request.reason.as_deref().unwrap_or("manual"),
        )
        .await?;
    Ok(Json(account))
}
