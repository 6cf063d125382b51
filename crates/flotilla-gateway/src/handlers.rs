use std::convert::Infallible;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use futures_util::StreamExt;

use flotilla_fleet::FleetError;

use crate::state::AppState;

/// The only request fields the gateway looks at. The body itself is
/// forwarded verbatim; nothing is re-serialized.
#[derive(Debug, Deserialize)]
struct ProxyFields {
    model: Option<String>,
    stream: Option<bool>,
}

pub async fn chat_completions(
    State(st): State<AppState>,
    headers: HeaderMap,
    req: Request<Body>,
) -> Response {
    proxy_to_model(st, "/v1/chat/completions", headers, req).await
}

pub async fn completions(
    State(st): State<AppState>,
    headers: HeaderMap,
    req: Request<Body>,
) -> Response {
    proxy_to_model(st, "/v1/completions", headers, req).await
}

pub async fn embeddings(
    State(st): State<AppState>,
    headers: HeaderMap,
    req: Request<Body>,
) -> Response {
    proxy_to_model(st, "/v1/embeddings", headers, req).await
}

async fn proxy_to_model(
    st: AppState,
    endpoint: &str,
    headers: HeaderMap,
    req: Request<Body>,
) -> Response {
    let body = match to_bytes(req.into_body(), st.fleet.max_body_bytes()).await {
        Ok(b) => b,
        Err(_) => {
            return api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
                "body_too_large",
            )
        }
    };

    let fields: ProxyFields = match serde_json::from_slice(&body) {
        Ok(f) => f,
        Err(_) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid JSON in request body",
                "bad_request",
            )
        }
    };
    let Some(requested) = fields.model.filter(|m| !m.is_empty()) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "model field is required",
            "bad_request",
        );
    };
    let Some(model) = st.fleet.resolve(&requested) else {
        return api_error(
            StatusCode::NOT_FOUND,
            &format!("model {requested:?} not found"),
            "model_not_found",
        );
    };

    tracing::info!(model=%model, endpoint, "proxying request");

    let lease = match tokio::time::timeout(st.fleet.load_deadline(), st.fleet.acquire(&model)).await
    {
        Ok(Ok(lease)) => lease,
        Ok(Err(e)) => return fleet_error_response(e),
        Err(_) => {
            return api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "timed out waiting for the model to load",
                "load_deadline",
            )
        }
    };

    let is_stream = fields.stream.unwrap_or(false);
    let url = format!("{}{}", lease.backend().url(), endpoint);
    let send = st
        .http
        .post(&url)
        .headers(proxy_headers(&headers))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send();

    if is_stream {
        let resp = match send.await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(model=%model, error=%e, "backend request failed");
                return api_error(
                    StatusCode::BAD_GATEWAY,
                    "backend request failed",
                    "backend_unreachable",
                );
            }
        };

        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let resp_headers = resp.headers().clone();

        let mut upstream = resp.bytes_stream();
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
        tokio::spawn(async move {
            // The lease lives exactly as long as the pump: the backend
            // stays protected from eviction while bytes still flow.
            let _lease = lease;
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Client went away; dropping the upstream
                            // response aborts the backend call.
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut out = Response::builder()
            .status(status)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        append_response_headers(&resp_headers, &mut out);
        return out;
    }

    // Non-streaming: the per-model deadline covers the whole exchange,
    // response body included, so downstream consumers see complete JSON.
    let exchange = async {
        let resp = send.await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        Ok::<_, reqwest::Error>((status, headers, bytes))
    };

    let result = match st.fleet.request_timeout_for(&model) {
        Some(deadline) => match tokio::time::timeout(deadline, exchange).await {
            Ok(r) => r,
            Err(_) => {
                return api_error(
                    StatusCode::GATEWAY_TIMEOUT,
                    "request deadline exceeded",
                    "request_deadline",
                )
            }
        },
        None => exchange.await,
    };

    match result {
        Ok((status, resp_headers, bytes)) => {
            let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut out = Response::builder()
                .status(status)
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            append_response_headers(&resp_headers, &mut out);
            out
        }
        Err(e) => {
            tracing::error!(model=%model, error=%e, "backend request failed");
            api_error(
                StatusCode::BAD_GATEWAY,
                "backend request failed",
                "backend_unreachable",
            )
        }
    }
}

pub async fn list_models(State(st): State<AppState>) -> impl IntoResponse {
    let created = Utc::now().timestamp();
    let mut data = Vec::new();
    for spec in st.fleet.configured_models() {
        data.push(json!({
            "id": spec.name,
            "object": "model",
            "created": created,
            "owned_by": "flotilla",
        }));
        for alias in &spec.aliases {
            data.push(json!({
                "id": alias,
                "object": "model",
                "created": created,
                "owned_by": "flotilla",
            }));
        }
    }
    Json(json!({"object": "list", "data": data}))
}

pub async fn health(State(st): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "loaded_models": st.fleet.loaded_models(),
        "queue_depth": st.fleet.queue_depth(),
    }))
}

/// Headers forwarded to the backend. Host and content-length are
/// recomputed by the client; the rest passes through.
fn proxy_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (k, v) in headers.iter() {
        if k.as_str().eq_ignore_ascii_case("host")
            || k.as_str().eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        out.insert(k, v.clone());
    }
    out
}

/// Copy backend response headers onto the outgoing response, skipping
/// the framing headers axum computes itself.
fn append_response_headers(src: &reqwest::header::HeaderMap, dst: &mut Response) {
    for (k, v) in src.iter() {
        let name = k.as_str();
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(v.as_bytes()),
        ) {
            // content-type set by the streaming branch wins
            if !dst.headers().contains_key(&name) {
                dst.headers_mut().insert(name, value);
            }
        }
    }
}

pub fn api_error(status: StatusCode, message: &str, code: &str) -> Response {
    let kind = if status.is_client_error() {
        "invalid_request_error"
    } else {
        "server_error"
    };
    (
        status,
        Json(json!({
            "error": {"message": message, "type": kind, "code": code}
        })),
    )
        .into_response()
}

pub fn fleet_error_response(err: FleetError) -> Response {
    let (status, code) = match &err {
        FleetError::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
        FleetError::CapacityExhausted => (StatusCode::SERVICE_UNAVAILABLE, "capacity_exhausted"),
        FleetError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
        FleetError::QueueTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_timeout"),
        FleetError::StartupTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "startup_timeout"),
        FleetError::StartupFailed(_) => (StatusCode::SERVICE_UNAVAILABLE, "startup_failed"),
        FleetError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
    };
    api_error(status, &err.to_string(), code)
}
