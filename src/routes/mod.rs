pub mod health;
pub mod overlay;
pub mod points;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

/// All HTTP and WebSocket routes, without the outer middleware layers.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/overlay", get(overlay::overlay_socket))
        .nest("/api/points", points::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PointsConfig};
    use crate::db::test_pool;
    use crate::services::overlay::OverlayBroadcaster;
    use crate::services::points::PointsService;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn state_with_points() -> (Arc<AppState>, Arc<PointsService>) {
        let points = Arc::new(PointsService::new(
            test_pool().await,
            Arc::new(Vec::new()),
            PointsConfig::default(),
        ));
        let state = Arc::new(AppState {
            config: Config::default(),
            overlay: Arc::new(OverlayBroadcaster::new()),
            points: Some(points.clone()),
            eventsub: None,
        });
        (state, points)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_degraded_without_eventsub() {
        let (state, _) = state_with_points().await;
        let response = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["overlay_clients"], 0);
        assert_eq!(body["points"], true);
    }

    #[tokio::test]
    async fn user_points_returns_balance_and_history() {
        let (state, points) = state_with_points().await;

        let missing = app(state.clone())
            .oneshot(Request::get("/api/points/users/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        points.ensure_account("1", "Ada").await.unwrap();
        points.award_points("1", 10, "accrual:watching").await.unwrap();
        points.award_points("1", 10, "accrual:watching").await.unwrap();

        let response = app(state)
            .oneshot(
                Request::get("/api/points/users/1?limit=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["account"]["balance"], 20);
        assert_eq!(body["transactions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn config_update_validates_and_applies() {
        let (state, _) = state_with_points().await;

        let rejected = app(state.clone())
            .oneshot(
                Request::put("/api/points/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"points_per_tick": -1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let out_of_range = app(state.clone())
            .oneshot(
                Request::put("/api/points/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"accrual_interval_seconds": 18446744073709551615}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);

        let accepted = app(state.clone())
            .oneshot(
                Request::put("/api/points/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"points_per_tick": 15}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(json_body(accepted).await["points_per_tick"], 15);

        let stats = app(state)
            .oneshot(Request::get("/api/points/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(stats).await;
        assert_eq!(body["points_per_tick"], 15);
        assert_eq!(body["accounts"], 0);
    }

    #[tokio::test]
    async fn manual_spend_beyond_balance_conflicts() {
        let (state, points) = state_with_points().await;

        let post = |uri: &str, body: &'static str| {
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let awarded = app(state.clone())
            .oneshot(post(
                "/api/points/users/1/award",
                r#"{"amount": 30, "display_name": "Ada"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(awarded.status(), StatusCode::OK);
        assert_eq!(json_body(awarded).await["balance"], 30);

        let refused = app(state.clone())
            .oneshot(post("/api/points/users/1/spend", r#"{"amount": 31}"#))
            .await
            .unwrap();
        assert_eq!(refused.status(), StatusCode::CONFLICT);
        let body = json_body(refused).await;
        assert_eq!(body["error"]["details"]["available"], 30);

        let unknown = app(state)
            .oneshot(post("/api/points/users/2/spend", r#"{"amount": 1}"#))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        assert_eq!(points.get_balance("1").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn points_routes_are_unavailable_without_ledger() {
        let state = Arc::new(AppState {
            config: Config::default(),
            overlay: Arc::new(OverlayBroadcaster::new()),
            points: None,
            eventsub: None,
        });

        let response = app(state)
            .oneshot(Request::get("/api/points/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
