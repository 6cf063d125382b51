pub mod config;
pub mod model_spec;

pub use config::{GatewayConfig, QueueConfig};
pub use model_spec::{resolve_model, ModelSpec};
