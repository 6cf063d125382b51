use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::FleetManager;

/// A standing rule: unload a model once every replica has sat idle for
/// the threshold. Evaluated on a ticker for as long as the rule exists.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledAction {
    pub id: String,
    pub model: String,
    pub idle_secs: u64,
}

pub(crate) struct ActiveAction {
    pub(crate) info: ScheduledAction,
    pub(crate) cancel: CancellationToken,
}

pub(crate) fn spawn_action(
    manager: &Arc<FleetManager>,
    info: ScheduledAction,
    cancel: CancellationToken,
) {
    let weak = Arc::downgrade(manager);
    tokio::spawn(run_action(weak, info, cancel));
}

async fn run_action(manager: Weak<FleetManager>, info: ScheduledAction, cancel: CancellationToken) {
    let period = Duration::from_secs(info.idle_secs.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(m) = manager.upgrade() else { return };
        if m.unload_if_idle(&info.model, Duration::from_secs(info.idle_secs)) {
            info!(model=%info.model, idle_secs=info.idle_secs, "scheduled unload fired");
            m.record_event(
                &info.model,
                "scheduled_unload",
                format!("idle for {}s", info.idle_secs),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;
    use crate::test_support::{manager_with, spec};

    #[tokio::test]
    async fn test_unload_if_idle_removes_idle_group() {
        let manager = manager_with(&[spec("a", 1)], 2, |_| {});
        manager.insert_group_for_test("a", &[BackendState::Ready]);

        assert!(manager.unload_if_idle("a", Duration::ZERO));
        assert!(manager.loaded_models().is_empty());
    }

    #[tokio::test]
    async fn test_unload_if_idle_spares_recently_used() {
        let manager = manager_with(&[spec("a", 1)], 2, |_| {});
        manager.insert_group_for_test("a", &[BackendState::Ready]);

        assert!(!manager.unload_if_idle("a", Duration::from_secs(3600)));
        assert_eq!(manager.loaded_models(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_unload_if_idle_spares_in_flight() {
        let manager = manager_with(&[spec("a", 1)], 2, |_| {});
        let backend = manager.insert_group_for_test("a", &[BackendState::Ready])[0].clone();
        let lease = manager.test_lease(&backend);

        assert!(!manager.unload_if_idle("a", Duration::ZERO));
        drop(lease);
        assert!(manager.unload_if_idle("a", Duration::ZERO));
    }

    #[tokio::test]
    async fn test_add_and_remove_action() {
        let manager = manager_with(&[spec("a", 1)], 2, |_| {});
        let id = manager.add_idle_unload("a", 300);

        let actions = manager.scheduled_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].model, "a");
        assert_eq!(actions[0].idle_secs, 300);

        assert!(manager.remove_scheduled_action(&id));
        assert!(manager.scheduled_actions().is_empty());
        assert!(!manager.remove_scheduled_action(&id));
    }
}
