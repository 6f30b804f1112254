use std::sync::Arc;

use parley_core::config::GatewayConfig;
use parley_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
    /// Flow that WhatsApp webhook events are routed to.
    pub default_flow: Option<String>,
}
