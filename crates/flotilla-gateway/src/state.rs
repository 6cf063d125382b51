use std::sync::Arc;

use flotilla_fleet::FleetManager;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetManager>,
    /// Client for proxying to backends. No overall timeout: streaming
    /// responses run arbitrarily long.
    pub http: reqwest::Client,
    pub metrics: Arc<Metrics>,
    /// Config file path, re-read on reload.
    pub config_path: String,
}
