use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::backend::{Backend, BackendState, FailureKind};
use crate::FleetManager;

/// How often the readiness probe polls a starting backend.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Hard ceiling on how long a backend may take to become ready.
const READINESS_CEILING: Duration = Duration::from_secs(120);

/// Pause between a crash and the respawn attempt.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Supervised restarts allowed before a replica is declared failed for good.
const MAX_RESTARTS: u32 = 5;

/// Grace period between SIGTERM and SIGKILL when stopping a child.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to (re)spawn one replica, snapshotted at group
/// creation so a config reload cannot change a running process.
#[derive(Debug, Clone)]
pub(crate) struct LaunchPlan {
    pub(crate) server_bin: String,
    pub(crate) args: Vec<String>,
}

impl LaunchPlan {
    /// Final argument vector: configured args plus the loopback bind.
    fn command_args(&self, port: u16) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--host".to_string());
        args.push("127.0.0.1".to_string());
        args.push("--port".to_string());
        args.push(port.to_string());
        args
    }

    fn spawn(&self, port: u16) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.server_bin);
        cmd.args(self.command_args(port));

        // The server binary often ships shared libraries next to itself.
        if let Some(dir) = Path::new(&self.server_bin).parent() {
            let dir = dir.display();
            let ld = std::env::var("LD_LIBRARY_PATH").unwrap_or_default();
            cmd.env("LD_LIBRARY_PATH", format!("{dir}:{ld}"));
            let dyld = std::env::var("DYLD_LIBRARY_PATH").unwrap_or_default();
            cmd.env("DYLD_LIBRARY_PATH", format!("{dir}:{dyld}"));
        }

        cmd.kill_on_drop(true);
        cmd.spawn()
    }
}

/// Spawn the supervision task for one replica.
pub(crate) fn spawn_replica(
    manager: &Arc<FleetManager>,
    backend: Arc<Backend>,
    plan: LaunchPlan,
) {
    let weak = Arc::downgrade(manager);
    let http = manager.probe_client();
    tokio::spawn(run_replica(weak, backend, plan, http));
}

enum StartOutcome {
    Ready,
    TimedOut,
    Exited(String),
    Cancelled,
}

async fn run_replica(
    manager: Weak<FleetManager>,
    backend: Arc<Backend>,
    plan: LaunchPlan,
    http: reqwest::Client,
) {
    let cancel = backend.cancel_token();
    loop {
        let mut child = match plan.spawn(backend.port) {
            Ok(child) => child,
            Err(e) => {
                warn!(model=%backend.model, instance=backend.instance, error=%e, "failed to spawn backend");
                backend.set_failure_kind(FailureKind::SpawnFailed);
                backend.mark_unsupervised();
                publish(&manager, &backend, BackendState::Failed);
                record(
                    &manager,
                    &backend.model,
                    "spawn_failed",
                    format!("instance {}: {}", backend.instance, e),
                );
                return;
            }
        };

        info!(
            model=%backend.model,
            instance=backend.instance,
            port=backend.port,
            bin=%plan.server_bin,
            "backend starting"
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => StartOutcome::Cancelled,
            status = child.wait() => {
                let detail = match status {
                    Ok(s) => s.to_string(),
                    Err(e) => format!("wait failed: {e}"),
                };
                StartOutcome::Exited(detail)
            }
            ready = wait_ready(&http, backend.port, READINESS_CEILING) => {
                if ready { StartOutcome::Ready } else { StartOutcome::TimedOut }
            }
        };

        match outcome {
            StartOutcome::Cancelled => {
                stop_child(&mut child).await;
                publish(&manager, &backend, BackendState::Stopped);
                return;
            }
            StartOutcome::TimedOut => {
                warn!(model=%backend.model, instance=backend.instance, "backend never became ready");
                stop_child(&mut child).await;
                backend.set_failure_kind(FailureKind::StartupTimeout);
                backend.mark_unsupervised();
                publish(&manager, &backend, BackendState::Failed);
                record(
                    &manager,
                    &backend.model,
                    "startup_timeout",
                    format!("instance {} on port {}", backend.instance, backend.port),
                );
                return;
            }
            StartOutcome::Ready => {
                backend.reset_restart_count();
                publish(&manager, &backend, BackendState::Ready);
                info!(model=%backend.model, instance=backend.instance, port=backend.port, "backend ready");
                record(
                    &manager,
                    &backend.model,
                    "loaded",
                    format!("instance {} on port {}", backend.instance, backend.port),
                );

                // Steady state: nothing to do until exit or cancellation.
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stop_child(&mut child).await;
                        publish(&manager, &backend, BackendState::Stopped);
                        return;
                    }
                    status = child.wait() => {
                        let detail = match status {
                            Ok(s) => s.to_string(),
                            Err(e) => format!("wait failed: {e}"),
                        };
                        warn!(model=%backend.model, instance=backend.instance, exit=%detail, "backend exited");
                        record(
                            &manager,
                            &backend.model,
                            "crashed",
                            format!("instance {}: {}", backend.instance, detail),
                        );
                    }
                }
            }
            StartOutcome::Exited(detail) => {
                warn!(model=%backend.model, instance=backend.instance, exit=%detail, "backend exited during startup");
                record(
                    &manager,
                    &backend.model,
                    "crashed",
                    format!("instance {}: {}", backend.instance, detail),
                );
            }
        }

        // Crash path: burn one restart from the budget, or give up.
        backend.set_failure_kind(FailureKind::Crashed);
        publish(&manager, &backend, BackendState::Failed);

        let restarts = backend.bump_restart_count();
        if restarts > MAX_RESTARTS {
            backend.set_failure_kind(FailureKind::GaveUp);
            backend.mark_unsupervised();
            // Re-publish so readiness waiters observe the terminal state.
            publish(&manager, &backend, BackendState::Failed);
            record(
                &manager,
                &backend.model,
                "gave_up",
                format!("instance {} after {} restarts", backend.instance, MAX_RESTARTS),
            );
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                publish(&manager, &backend, BackendState::Stopped);
                return;
            }
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }

        publish(&manager, &backend, BackendState::Starting);
        record(
            &manager,
            &backend.model,
            "restarting",
            format!("instance {} attempt {}", backend.instance, restarts),
        );
    }
}

/// Poll the backend's liveness endpoint until it answers 200, the ceiling
/// elapses, or the future is dropped by the surrounding select.
async fn wait_ready(http: &reqwest::Client, port: u16, ceiling: Duration) -> bool {
    let url = format!("http://127.0.0.1:{port}/health");
    let start = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(PROBE_INTERVAL).await;
        if start.elapsed() > ceiling {
            return false;
        }
        if let Ok(resp) = http.get(&url).send().await {
            if resp.status().is_success() {
                return true;
            }
        }
    }
}

/// SIGTERM first, SIGKILL if the child lingers past the grace period.
pub(crate) async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok()
            {
                return;
            }
            warn!(pid, "graceful stop timed out, killing");
        }
    }
    let _ = child.kill().await;
}

fn publish(manager: &Weak<FleetManager>, backend: &Backend, state: BackendState) {
    match manager.upgrade() {
        Some(m) => m.publish_state(backend, state),
        None => backend.set_state(state),
    }
}

fn record(manager: &Weak<FleetManager>, model: &str, event: &str, detail: String) {
    if let Some(m) = manager.upgrade() {
        m.record_event(model, event, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_command_args_bind_loopback() {
        let plan = LaunchPlan {
            server_bin: "/opt/llama/llama-server".to_string(),
            args: vec!["--model".to_string(), "/models/a.gguf".to_string()],
        };
        let args = plan.command_args(8123);
        assert_eq!(
            args,
            vec!["--model", "/models/a.gguf", "--host", "127.0.0.1", "--port", "8123"]
        );
    }

    async fn serve_health(listener: TcpListener) {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        }
    }

    #[tokio::test]
    async fn test_wait_ready_succeeds_against_live_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_health(listener));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        assert!(wait_ready(&http, port, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_when_nothing_listens() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert!(!wait_ready(&http, port, Duration::from_millis(900)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_child_terminates_promptly() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let start = std::time::Instant::now();
        stop_child(&mut child).await;
        assert!(start.elapsed() < Duration::from_secs(10));

        // A stopped child has an exit status.
        let status = child.try_wait();
        assert!(matches!(status, Ok(Some(_)) | Err(_)));
    }
}
