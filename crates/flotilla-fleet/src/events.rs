use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Lifecycle event for a model: loaded, unloaded, crashed, restarting,
/// restart_failed, gave_up, health_fail, scheduled_unload.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEvent {
    pub timestamp: String,
    pub model: String,
    pub event: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

const EVENT_CAPACITY: usize = 200;

/// Ring of the most recent lifecycle events.
pub(crate) struct EventLog {
    entries: Mutex<VecDeque<ModelEvent>>,
}

impl EventLog {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(EVENT_CAPACITY)),
        }
    }

    pub(crate) fn record(&self, model: &str, event: &str, detail: String) {
        let entry = ModelEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            model: model.to_string(),
            event: event.to_string(),
            detail,
        };
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == EVENT_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent events, newest first.
    pub(crate) fn recent(&self, limit: usize) -> Vec<ModelEvent> {
        let entries = self.entries.lock().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }
}

/// Best-effort observability callbacks wired in by the embedding binary.
type EventCallback = Box<dyn Fn(&str, &str, &str, &str) + Send + Sync>;
type HealthCallback = Box<dyn Fn(&str, u16, bool, f64) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observer {
    on_event: Mutex<Option<EventCallback>>,
    on_health_probe: Mutex<Option<HealthCallback>>,
}

impl Observer {
    pub(crate) fn set_event_callback(&self, cb: EventCallback) {
        *self.on_event.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_health_callback(&self, cb: HealthCallback) {
        *self.on_health_probe.lock().unwrap() = Some(cb);
    }

    pub(crate) fn event(&self, level: &str, source: &str, model: &str, message: &str) {
        if let Some(cb) = self.on_event.lock().unwrap().as_ref() {
            cb(level, source, model, message);
        }
    }

    pub(crate) fn health_probe(&self, model: &str, port: u16, ok: bool, latency_ms: f64) {
        if let Some(cb) = self.on_health_probe.lock().unwrap().as_ref() {
            cb(model, port, ok, latency_ms);
        }
    }
}
