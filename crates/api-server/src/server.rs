//! API server — assembles the REST routes, webhook intake, and metrics
//! exporter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use trunkline_campaign::CampaignExecutor;
use trunkline_core::config::AppConfig;
use trunkline_webhook::IngestState;

use crate::auth::{auth_middleware, TokenVerifier};
use crate::campaign_rest::{self, CampaignState};
use crate::rest::{self, AppState};

/// Main API server for the messaging core.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
    executor: CampaignExecutor,
    ingest: IngestState,
    verifier: Arc<dyn TokenVerifier>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        state: AppState,
        executor: CampaignExecutor,
        ingest: IngestState,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            config,
            state,
            executor,
            ingest,
            verifier,
        }
    }

    pub fn router(&self) -> Router {
        let message_routes = Router::new()
            .route("/v1/messages", post(rest::handle_send))
            .route("/v1/messages/{id}", get(rest::handle_message_status))
            .route(
                "/v1/phone-numbers/{phone_number_id}/refresh",
                post(rest::handle_refresh_phone),
            )
            .with_state(self.state.clone());

        let campaign_state = CampaignState {
            executor: self.executor.clone(),
        };
        let campaign_routes = Router::new()
            .route("/v1/campaigns", post(campaign_rest::handle_create))
            .route("/v1/campaigns/{id}", get(campaign_rest::handle_get))
            .route("/v1/campaigns/{id}/start", post(campaign_rest::handle_start))
            .route(
                "/v1/campaigns/{id}/trigger",
                post(campaign_rest::handle_trigger),
            )
            .route("/v1/campaigns/{id}/pause", post(campaign_rest::handle_pause))
            .route(
                "/v1/campaigns/{id}/resume",
                post(campaign_rest::handle_resume),
            )
            .route(
                "/v1/campaigns/{id}/cancel",
                post(campaign_rest::handle_cancel),
            )
            .with_state(campaign_state);

        // Bearer auth applies to the client-facing API; the webhook route
        // authenticates by HMAC signature instead.
        let authed = message_routes.merge(campaign_routes).layer(
            middleware::from_fn_with_state(self.verifier.clone(), auth_middleware),
        );

        let ops_routes = Router::new()
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .with_state(self.state.clone());

        authed
            .merge(ops_routes)
            .merge(trunkline_webhook::webhook_router(self.ingest.clone()))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start the HTTP server. Blocks until shutdown.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = self.router();
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive for the process lifetime.
        std::mem::forget(handle);
        Ok(())
    }
}

/// Convenience for tests: an `AppState` with a fresh start time.
pub fn app_state(
    messages: Arc<dyn trunkline_store::MessageStore>,
    phones: Arc<dyn trunkline_store::PhoneNumberStore>,
    queue: Arc<dyn trunkline_queue::Queue<trunkline_core::command::OutboundCommand>>,
    events: Arc<dyn trunkline_core::event_bus::EventSink>,
    upstream: Arc<trunkline_upstream::CloudApiClient>,
    node_id: String,
) -> AppState {
    AppState {
        messages,
        phones,
        queue,
        events,
        upstream,
        node_id,
        start_time: Instant::now(),
    }
}
