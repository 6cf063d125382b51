use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::FleetManager;

/// Spawn the periodic liveness prober for Ready backends.
///
/// Each tick snapshots the Ready set under the fleet lock, then probes
/// with the lock released so a slow backend never stalls `acquire`.
pub fn spawn_prober(
    manager: Arc<FleetManager>,
    period: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of `interval` fires immediately; skip it so a
        // freshly loaded fleet gets a full period before the first probe.
        ticker.tick().await;

        let http = manager.probe_client();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let targets = manager.ready_backends();
            debug!(backends = targets.len(), "running health probes");
            for backend in targets {
                let url = format!("{}/health", backend.url());
                let start = Instant::now();
                let ok = match http.get(&url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(_) => false,
                };
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                manager.on_probe_result(&backend, ok, latency_ms);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;
    use crate::test_support::{manager_with, spec};

    #[tokio::test]
    async fn test_single_failure_demotes_with_default_threshold() {
        let manager = manager_with(&[spec("a", 1)], 2, |_| {});
        let backend = manager.insert_group_for_test("a", &[BackendState::Ready])[0].clone();

        manager.on_probe_result(&backend, false, 3.0);
        assert_eq!(backend.state(), BackendState::Failed);
    }

    #[tokio::test]
    async fn test_threshold_requires_consecutive_failures() {
        let manager = manager_with(&[spec("a", 1)], 2, |cfg| cfg.health_fail_threshold = 3);
        let backend = manager.insert_group_for_test("a", &[BackendState::Ready])[0].clone();

        manager.on_probe_result(&backend, false, 3.0);
        manager.on_probe_result(&backend, false, 3.0);
        assert_eq!(backend.state(), BackendState::Ready);

        // A success resets the streak.
        manager.on_probe_result(&backend, true, 3.0);
        manager.on_probe_result(&backend, false, 3.0);
        manager.on_probe_result(&backend, false, 3.0);
        assert_eq!(backend.state(), BackendState::Ready);

        manager.on_probe_result(&backend, false, 3.0);
        assert_eq!(backend.state(), BackendState::Failed);
    }

    #[tokio::test]
    async fn test_probe_callback_reported() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let manager = manager_with(&[spec("a", 1)], 2, |_| {});
        let backend = manager.insert_group_for_test("a", &[BackendState::Ready])[0].clone();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        manager.set_health_callback(Box::new(move |model, port, ok, latency| {
            assert_eq!(model, "a");
            assert!(port >= 8081);
            assert!(ok);
            assert!(latency >= 0.0);
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        manager.on_probe_result(&backend, true, 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
