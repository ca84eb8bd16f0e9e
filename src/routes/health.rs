use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub overlay_clients: usize,
    /// EventSub session state, absent when the client is disabled.
    pub eventsub: Option<String>,
    pub eventsub_session: Option<String>,
    pub points: bool,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (eventsub, eventsub_session) = match &state.eventsub {
        Some(client) => (
            Some(client.state().await.to_string()),
            client.session().await.map(|session| session.id),
        ),
        None => (None, None),
    };
    let degraded = eventsub.is_none() || state.points.is_none();

    let response = HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        overlay_clients: state.overlay.client_count().await,
        eventsub,
        eventsub_session,
        points: state.points.is_some(),
    };

    (StatusCode::OK, Json(response))
}
