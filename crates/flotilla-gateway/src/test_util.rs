use std::sync::Arc;

use flotilla_common::{GatewayConfig, ModelSpec, QueueConfig};
use flotilla_fleet::FleetManager;

use crate::metrics::Metrics;
use crate::state::AppState;

/// App state backed by a real fleet manager that never spawns a process
/// (nothing is acquired unless a test asks for it).
pub fn test_state(tweak: impl FnOnce(&mut GatewayConfig)) -> AppState {
    let mut cfg = GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        server_bin: "/bin/sleep".to_string(),
        port_range_start: 8081,
        max_loaded: 2,
        health_check_secs: 30,
        health_fail_threshold: 1,
        load_deadline_secs: 180,
        max_body_bytes: 10 * 1024 * 1024,
        queue: QueueConfig::default(),
        models: vec![ModelSpec {
            name: "llama3-8b".to_string(),
            aliases: vec!["gpt-4".to_string()],
            args: vec![],
            replicas: 1,
            request_timeout_secs: 0,
        }],
    };
    tweak(&mut cfg);

    AppState {
        fleet: FleetManager::new(cfg),
        http: reqwest::Client::new(),
        metrics: Arc::new(Metrics::default()),
        config_path: "/tmp/flotilla-test.json".to_string(),
    }
}
