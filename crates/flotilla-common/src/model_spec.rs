use serde::{Deserialize, Serialize};

/// Description of one servable model, as written in the config file.
///
/// Immutable once handed to the fleet; a config reload swaps the whole
/// list rather than mutating entries in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Canonical model name clients address in the `model` field.
    pub name: String,

    /// Alternative names that resolve to this model (e.g. "gpt-4").
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Arguments for the inference server binary, excluding the listen
    /// address. The supervisor appends `--host 127.0.0.1 --port <n>`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Number of replica processes to run for this model.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Wall-clock deadline in seconds for non-streaming requests.
    /// 0 means no deadline. Streaming requests are never bounded.
    #[serde(default)]
    pub request_timeout_secs: u64,
}

fn default_replicas() -> usize {
    1
}

impl ModelSpec {
    /// Whether `requested` names this model exactly or via an alias.
    pub fn answers_to(&self, requested: &str) -> bool {
        self.name == requested || self.aliases.iter().any(|a| a == requested)
    }
}

/// Resolve a client-supplied model string against the configured specs.
///
/// Precedence: exact name, then alias, then case-insensitive substring
/// match over names ("llama3" finds "meta/llama3-8b"). Returns the
/// canonical spec, or None when nothing matches.
pub fn resolve_model<'a>(requested: &str, specs: &'a [ModelSpec]) -> Option<&'a ModelSpec> {
    if let Some(spec) = specs.iter().find(|s| s.name == requested) {
        return Some(spec);
    }

    if let Some(spec) = specs
        .iter()
        .find(|s| s.aliases.iter().any(|a| a == requested))
    {
        return Some(spec);
    }

    let lower = requested.to_lowercase();
    specs
        .iter()
        .find(|s| s.name.to_lowercase().contains(&lower))
}
