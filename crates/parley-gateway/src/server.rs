use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_core::config::GatewayConfig;
use parley_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway: the WhatsApp webhook plus the management API.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<Engine>,
    default_flow: Option<String>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<Engine>, default_flow: Option<String>) -> Self {
        Self {
            config,
            engine,
            default_flow,
        }
    }

    fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
            default_flow: self.default_flow.clone(),
        });

        Router::new()
            // Webhooks
            .route(
                "/webhook/whatsapp",
                get(routes::verify_whatsapp).post(routes::receive_whatsapp),
            )
            // REST API
            .route("/api/health", get(routes::health))
            .route("/api/flows", get(routes::list_flows))
            .route("/api/flows/{flow}", put(routes::put_flow))
            .route("/api/flows/{flow}/events", post(routes::post_event))
            .route(
                "/api/flows/{flow}/conversations/{contact}",
                get(routes::get_conversation).delete(routes::reset_conversation),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(
            bind = %self.config.bind,
            default_flow = self.default_flow.as_deref().unwrap_or("-"),
            "Gateway listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
