mod admin;
mod args;
mod handlers;
mod metrics;
mod state;
#[cfg(test)]
mod test_util;

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flotilla_common::GatewayConfig;
use flotilla_fleet::{health, FleetManager};

use crate::args::Args;
use crate::metrics::Metrics;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = GatewayConfig::load(&args.config).await?;
    let listen_addr = args
        .listen_addr
        .clone()
        .unwrap_or_else(|| cfg.listen_addr.clone());

    for m in &cfg.models {
        info!(model=%m.name, aliases=?m.aliases, replicas=m.replicas, "model configured");
    }
    if cfg.queue.enabled {
        info!(
            max_size = cfg.queue.max_size,
            timeout_secs = cfg.queue.timeout_secs,
            "request queue enabled"
        );
    }

    let fleet = FleetManager::new(cfg);

    let prober_cancel = CancellationToken::new();
    health::spawn_prober(fleet.clone(), fleet.health_period(), prober_cancel.clone());

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .build()
        .expect("reqwest client");

    let st = AppState {
        fleet: fleet.clone(),
        http,
        metrics: Arc::new(Metrics::default()),
        config_path: args.config.clone(),
    };

    fleet.set_event_callback(Box::new(|level, source, model, message| {
        tracing::debug!(level, source, model, message, "fleet event");
    }));
    let probe_metrics = st.metrics.clone();
    fleet.set_health_callback(Box::new(move |model, port, ok, latency_ms| {
        if !ok {
            probe_metrics
                .health_probe_failures
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        tracing::debug!(model, port, ok, latency_ms, "health probe");
    }));

    let app = build_router(st);

    let shutdown = CancellationToken::new();
    spawn_signal_task(fleet, shutdown.clone(), args.config.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr=%listen_addr, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    prober_cancel.cancel();
    Ok(())
}

fn build_router(st: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/admin/status", get(admin::status))
        .route("/admin/load", post(admin::load))
        .route("/admin/unload", post(admin::unload))
        .route("/admin/reload", post(admin::reload))
        .route("/admin/events", get(admin::events))
        .route(
            "/admin/schedule",
            get(admin::schedule_list).post(admin::schedule_add),
        )
        .route("/admin/schedule/:id", delete(admin::schedule_remove))
        .layer(middleware::from_fn_with_state(
            st.clone(),
            metrics::track_requests,
        ))
        .with_state(st)
}

/// SIGHUP reloads the config file; SIGINT/SIGTERM drain the fleet and
/// then stop the server.
fn spawn_signal_task(fleet: Arc<FleetManager>, shutdown: CancellationToken, config_path: String) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
            let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        info!("SIGHUP received, reloading configuration");
                        match GatewayConfig::load(&config_path).await {
                            Ok(cfg) => fleet.update_config(cfg),
                            Err(e) => tracing::error!(error=%e, "config reload failed"),
                        }
                    }
                    _ = terminate.recv() => break,
                    _ = interrupt.recv() => break,
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = &config_path;
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutting down gracefully");
        fleet.shutdown().await;
        shutdown.cancel();
    });
}
