use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub health_probe_failures: AtomicU64,
}

pub fn render_metrics(st: &AppState) -> String {
    let m = &st.metrics;
    let mut body = String::new();

    body.push_str(&format!(
        "# HELP flotilla_requests_total Total requests handled by the gateway.\n\
         # TYPE flotilla_requests_total counter\n\
         flotilla_requests_total {}\n",
        m.requests_total.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP flotilla_requests_inflight Currently in-flight requests.\n\
         # TYPE flotilla_requests_inflight gauge\n\
         flotilla_requests_inflight {}\n",
        m.requests_inflight.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP flotilla_responses_2xx Total 2xx responses.\n\
         # TYPE flotilla_responses_2xx counter\n\
         flotilla_responses_2xx {}\n",
        m.status_2xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP flotilla_responses_4xx Total 4xx responses.\n\
         # TYPE flotilla_responses_4xx counter\n\
         flotilla_responses_4xx {}\n",
        m.status_4xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP flotilla_responses_5xx Total 5xx responses.\n\
         # TYPE flotilla_responses_5xx counter\n\
         flotilla_responses_5xx {}\n",
        m.status_5xx.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP flotilla_health_probe_failures Total failed backend health probes.\n\
         # TYPE flotilla_health_probe_failures counter\n\
         flotilla_health_probe_failures {}\n",
        m.health_probe_failures.load(Ordering::Relaxed),
    ));
    body.push_str(&format!(
        "# HELP flotilla_loaded_models Models with at least one ready backend.\n\
         # TYPE flotilla_loaded_models gauge\n\
         flotilla_loaded_models {}\n",
        st.fleet.loaded_models().len(),
    ));
    body.push_str(&format!(
        "# HELP flotilla_queue_depth Requests parked waiting for a model slot.\n\
         # TYPE flotilla_queue_depth gauge\n\
         flotilla_queue_depth {}\n",
        st.fleet.queue_depth(),
    ));

    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st);
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
