use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::model_spec::ModelSpec;

/// Request queue settings. When disabled, an acquire that cannot evict
/// fails immediately instead of waiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_enabled")]
    pub enabled: bool,

    /// Maximum number of waiters across all models.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Wall-clock deadline for a waiter, in seconds.
    #[serde(default = "default_queue_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: default_queue_enabled(),
            max_size: default_queue_max_size(),
            timeout_secs: default_queue_timeout_secs(),
        }
    }
}

/// Top-level gateway configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path to the inference server binary spawned for every replica.
    pub server_bin: String,

    /// First port handed out to backends; later allocations count up
    /// from here unless a released port can be recycled.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Capacity bound: backends in Starting or Ready state never exceed this.
    #[serde(default = "default_max_loaded")]
    pub max_loaded: usize,

    /// Interval between liveness probes of Ready backends.
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,

    /// Consecutive probe failures required before a Ready backend is
    /// demoted to Failed.
    #[serde(default = "default_health_fail_threshold")]
    pub health_fail_threshold: u32,

    /// Upper bound on how long a request may wait for its model to load,
    /// queueing included.
    #[serde(default = "default_load_deadline_secs")]
    pub load_deadline_secs: u64,

    /// Largest request body accepted by the proxy.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub queue: QueueConfig,

    pub models: Vec<ModelSpec>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_port_range_start() -> u16 {
    8081
}

fn default_max_loaded() -> usize {
    2
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_health_fail_threshold() -> u32 {
    1
}

fn default_load_deadline_secs() -> u64 {
    180
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_queue_enabled() -> bool {
    true
}

fn default_queue_max_size() -> usize {
    32
}

fn default_queue_timeout_secs() -> u64 {
    60
}

impl GatewayConfig {
    /// Load and validate a config file.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_bin.is_empty() {
            bail!("server_bin is required");
        }
        if self.models.is_empty() {
            bail!("at least one model must be configured");
        }
        if self.max_loaded == 0 {
            bail!("max_loaded must be at least 1");
        }

        let mut seen = HashSet::new();
        for (i, m) in self.models.iter().enumerate() {
            if m.name.is_empty() {
                bail!("model[{i}]: name is required");
            }
            if !seen.insert(m.name.clone()) {
                bail!("model {:?} is configured more than once", m.name);
            }
            if m.replicas == 0 {
                bail!("model {:?}: replicas must be at least 1", m.name);
            }
            if m.replicas > self.max_loaded {
                bail!(
                    "model {:?}: {} replicas cannot fit within max_loaded {}",
                    m.name,
                    m.replicas,
                    self.max_loaded
                );
            }
        }
        for m in &self.models {
            for alias in &m.aliases {
                if !seen.insert(alias.clone()) {
                    bail!(
                        "alias {:?} of model {:?} collides with another model or alias",
                        alias,
                        m.name
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "server_bin": "/usr/local/bin/llama-server",
            "models": [
                {"name": "llama3-8b", "aliases": ["gpt-4"], "args": ["--model", "/models/a.gguf"]}
            ]
        }"#
    }

    #[test]
    fn test_defaults() {
        let cfg: GatewayConfig = serde_json::from_str(minimal_json()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.port_range_start, 8081);
        assert_eq!(cfg.max_loaded, 2);
        assert_eq!(cfg.health_check_secs, 30);
        assert_eq!(cfg.health_fail_threshold, 1);
        assert_eq!(cfg.load_deadline_secs, 180);
        assert_eq!(cfg.max_body_bytes, 10 * 1024 * 1024);
        assert!(cfg.queue.enabled);
        assert_eq!(cfg.queue.max_size, 32);
        assert_eq!(cfg.queue.timeout_secs, 60);
    }

    #[test]
    fn test_missing_server_bin_rejected() {
        let cfg: Result<GatewayConfig, _> =
            serde_json::from_str(r#"{"models": [{"name": "m"}]}"#);
        assert!(cfg.is_err());
    }

    #[test]
    fn test_no_models_rejected() {
        let cfg: GatewayConfig =
            serde_json::from_str(r#"{"server_bin": "/bin/srv", "models": []}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"server_bin": "/bin/srv", "models": [{"name": "m"}, {"name": "m"}]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_alias_colliding_with_name_rejected() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"server_bin": "/bin/srv", "models": [
                {"name": "a", "aliases": ["b"]},
                {"name": "b"}
            ]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_replicas_beyond_capacity_rejected() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"server_bin": "/bin/srv", "max_loaded": 2, "models": [
                {"name": "a", "replicas": 3}
            ]}"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("cannot fit"), "{err}");
    }

    #[test]
    fn test_zero_replicas_rejected() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"server_bin": "/bin/srv", "models": [{"name": "a", "replicas": 0}]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
