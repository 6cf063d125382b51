use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use flotilla_common::GatewayConfig;

use crate::handlers::{api_error, fleet_error_response};
use crate::state::AppState;

/// Deadline for an operator-initiated force load.
const ADMIN_LOAD_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub model: String,
    pub idle_minutes: u64,
}

pub async fn status(State(st): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "backends": st.fleet.backend_statuses(),
        "configured_models": st.fleet.configured_models().len(),
        "queue_depth": st.fleet.queue_depth(),
    }))
}

pub async fn load(State(st): State<AppState>, Json(req): Json<ModelRequest>) -> Response {
    if req.model.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "model field is required", "bad_request");
    }
    let model = st.fleet.resolve(&req.model).unwrap_or(req.model);

    info!(model=%model, "admin load");
    match tokio::time::timeout(ADMIN_LOAD_DEADLINE, st.fleet.acquire(&model)).await {
        Ok(Ok(lease)) => (
            StatusCode::OK,
            Json(json!({
                "status": "loaded",
                "model": model,
                "port": lease.backend().port,
            })),
        )
            .into_response(),
        Ok(Err(e)) => fleet_error_response(e),
        Err(_) => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "timed out waiting for the model to load",
            "load_deadline",
        ),
    }
}

pub async fn unload(State(st): State<AppState>, Json(req): Json<ModelRequest>) -> Response {
    if req.model.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "model field is required", "bad_request");
    }
    let model = st.fleet.resolve(&req.model).unwrap_or(req.model);

    info!(model=%model, "admin unload");
    if st.fleet.unload_model(&model) {
        (StatusCode::OK, Json(json!({"status": "unloaded", "model": model}))).into_response()
    } else {
        api_error(
            StatusCode::NOT_FOUND,
            &format!("model {model:?} is not loaded"),
            "model_not_found",
        )
    }
}

pub async fn reload(State(st): State<AppState>) -> Response {
    info!(path=%st.config_path, "admin config reload");
    match GatewayConfig::load(&st.config_path).await {
        Ok(cfg) => {
            st.fleet.update_config(cfg);
            (StatusCode::OK, Json(json!({"status": "reloaded"}))).into_response()
        }
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("config reload failed: {e}"),
            "reload_failed",
        ),
    }
}

pub async fn events(State(st): State<AppState>, Query(q): Query<EventsQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).min(200);
    Json(json!({"events": st.fleet.recent_events(limit)}))
}

pub async fn schedule_list(State(st): State<AppState>) -> impl IntoResponse {
    Json(json!({"actions": st.fleet.scheduled_actions()}))
}

pub async fn schedule_add(
    State(st): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Response {
    if req.model.is_empty() || req.idle_minutes == 0 {
        return api_error(
            StatusCode::BAD_REQUEST,
            "model and a nonzero idle_minutes are required",
            "bad_request",
        );
    }
    let model = st.fleet.resolve(&req.model).unwrap_or(req.model);
    let id = st.fleet.add_idle_unload(&model, req.idle_minutes * 60);
    (StatusCode::OK, Json(json!({"id": id, "model": model}))).into_response()
}

pub async fn schedule_remove(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    if st.fleet.remove_scheduled_action(&id) {
        (StatusCode::OK, Json(json!({"status": "removed", "id": id}))).into_response()
    } else {
        api_error(
            StatusCode::NOT_FOUND,
            &format!("scheduled action {id:?} not found"),
            "not_found",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_state;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    fn admin_router(st: AppState) -> Router {
        Router::new()
            .route("/admin/status", get(status))
            .route("/admin/unload", post(unload))
            .route("/admin/events", get(events))
            .route("/admin/schedule", get(schedule_list).post(schedule_add))
            .with_state(st)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_empty_fleet() {
        let app = admin_router(test_state(|_| {}));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/admin/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["queue_depth"], 0);
        assert_eq!(v["configured_models"], 1);
        assert!(v["backends"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_model_is_404() {
        let app = admin_router(test_state(|_| {}));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/unload")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"llama3-8b"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schedule_roundtrip() {
        let st = test_state(|_| {});
        let app = admin_router(st.clone());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/schedule")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"llama3-8b","idle_minutes":10}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let actions = st.fleet.scheduled_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].idle_secs, 600);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/admin/schedule")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["actions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_endpoint() {
        let app = admin_router(test_state(|_| {}));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/admin/events?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert!(v["events"].as_array().unwrap().is_empty());
    }
}
