//! Trunkline — multi-tenant WhatsApp BSP messaging core.
//!
//! Main entry point: initializes stores, queues, the rate limiter, the
//! dispatcher pool and webhook handlers, then serves the API.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use trunkline_api::{ApiServer, AppState, StaticTokenVerifier};
use trunkline_campaign::{CampaignExecutor, CampaignStateMachine, CounterReducer, ExecutorSettings};
use trunkline_core::command::OutboundCommand;
use trunkline_core::config::AppConfig;
use trunkline_core::event_bus::{EventSink, FanOutSink};
use trunkline_dispatcher::{DispatcherContext, DispatcherSettings, WorkerPool};
use trunkline_limiter::{LimiterRates, RateLimiter, SharedBuckets};
use trunkline_queue::{MemoryQueue, Queue, RedisQueue};
use trunkline_store::{
    DedupeStore, MemoryCampaignStore, MemoryContactStore, MemoryDedupe, MemoryMessageStore,
    MemoryPhoneNumberStore, MemoryWorkspaceStore, RedisDedupe,
};
use trunkline_upstream::CloudApiClient;
use trunkline_webhook::{
    IngestState, InboundHandler, QualityHandler, StatusHandler, TemplateHandler, TemplateState,
    WebhookQueues,
};

#[derive(Parser, Debug)]
#[command(name = "trunkline")]
#[command(about = "Multi-tenant WhatsApp BSP messaging core")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "TRUNKLINE__NODE_ID")]
    node_id: Option<String>,

    /// Dispatcher workers (overrides config)
    #[arg(long, env = "TRUNKLINE__WORKERS__COUNT")]
    workers: Option<usize>,

    /// HTTP port (overrides config)
    #[arg(long, env = "TRUNKLINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Skip dispatcher and webhook handler workers (API-only mode)
    #[arg(long, default_value_t = false)]
    api_only: bool,

    /// Use Redis-backed queues and dedupe instead of in-process state
    #[arg(long, default_value_t = false)]
    redis_backed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trunkline=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Trunkline starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.workers.count = workers;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        workers = config.worker_count(),
        http_port = config.api.http_port,
        redis_backed = cli.redis_backed,
        "Configuration loaded"
    );

    // Stores. The row store is an external collaborator in production;
    // this process ships the in-memory realization.
    let messages = Arc::new(MemoryMessageStore::new());
    let campaigns = Arc::new(MemoryCampaignStore::new());
    let contacts = Arc::new(MemoryContactStore::new());
    let phones = Arc::new(MemoryPhoneNumberStore::new());
    let workspaces = Arc::new(MemoryWorkspaceStore::new());

    let visibility = Duration::from_secs(config.workers.visibility_timeout_secs);
    let outbound: Arc<dyn Queue<OutboundCommand>> = if cli.redis_backed {
        Arc::new(RedisQueue::new(&config.redis.url, "outbound", visibility)?)
    } else {
        Arc::new(MemoryQueue::new(visibility))
    };
    let dedupe: Arc<dyn DedupeStore> = if cli.redis_backed {
        Arc::new(RedisDedupe::new(&config.redis.url)?)
    } else {
        Arc::new(MemoryDedupe::new())
    };
    let webhook_queues = WebhookQueues::in_memory(visibility);

    // Rate limiter, optionally sharing buckets across nodes.
    let mut limiter = RateLimiter::new(LimiterRates::from(&config.limiter));
    if config.limiter.shared {
        match SharedBuckets::new(
            &config.redis.url,
            config.limiter.per_number_rate,
            config.limiter.per_number_rate,
        ) {
            Ok(shared) => limiter = limiter.with_shared(shared),
            Err(e) => error!(error = %e, "Shared limiter unavailable, staying process-local"),
        }
    }
    let limiter = Arc::new(limiter);

    let upstream = Arc::new(CloudApiClient::new(&config.upstream)?);
    let upstream_admin = upstream.clone();

    // Delivery events feed the campaign counter reducer.
    let reducer = CounterReducer::spawn(campaigns.clone());
    let events: Arc<dyn EventSink> = Arc::new(FanOutSink::new(vec![reducer]));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Dispatcher pool.
    let dispatcher_ctx = DispatcherContext {
        queue: outbound.clone(),
        messages: messages.clone(),
        campaigns: campaigns.clone(),
        limiter: limiter.clone(),
        upstream,
        events: events.clone(),
        settings: DispatcherSettings::from_config(&config),
    };
    let mut pool = WorkerPool::new(config.node_id.clone(), dispatcher_ctx);
    if !cli.api_only {
        pool.start(config.worker_count());
    } else {
        info!("Running in API-only mode (no dispatcher workers)");
    }

    // Webhook handlers.
    let templates = Arc::new(TemplateState::new());
    if !cli.api_only {
        let grace = Duration::from_secs(config.webhook.status_grace_secs);
        for _ in 0..config.webhook.handler_count {
            let status = StatusHandler {
                messages: messages.clone(),
                events: events.clone(),
                grace,
            };
            tokio::spawn(status.run(webhook_queues.statuses.clone(), shutdown_rx.clone()));

            let inbound = InboundHandler {
                messages: messages.clone(),
                contacts: contacts.clone(),
            };
            tokio::spawn(inbound.run(webhook_queues.inbound.clone(), shutdown_rx.clone()));
        }
        let template_handler = TemplateHandler {
            templates: templates.clone(),
        };
        tokio::spawn(template_handler.run(webhook_queues.templates.clone(), shutdown_rx.clone()));

        let quality = QualityHandler {
            phones: phones.clone(),
            limiter: limiter.clone(),
            base_rate: config.limiter.per_number_rate,
        };
        tokio::spawn(quality.run(webhook_queues.quality.clone(), shutdown_rx.clone()));
    }

    // Campaign executor.
    let executor = CampaignExecutor {
        campaigns: campaigns.clone(),
        contacts: contacts.clone(),
        phones: phones.clone(),
        messages: messages.clone(),
        queue: outbound.clone(),
        events: events.clone(),
        settings: ExecutorSettings::from_config(&config),
        state_machine: CampaignStateMachine::new(),
        driving: Default::default(),
    };

    // API server.
    let state = AppState {
        messages: messages.clone(),
        phones: phones.clone(),
        queue: outbound,
        events,
        upstream: upstream_admin,
        node_id: config.node_id.clone(),
        start_time: std::time::Instant::now(),
    };
    let ingest = IngestState {
        workspaces,
        dedupe,
        queues: webhook_queues,
        max_body_bytes: config.webhook.max_body_bytes,
        dedupe_ttl: Duration::from_secs(config.webhook.dedupe_ttl_secs),
    };
    let verifier = Arc::new(StaticTokenVerifier::new(config.api.dev_token.clone()));
    let api_server = ApiServer::new(config.clone(), state, executor, ingest, verifier);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Trunkline is ready to serve traffic");

    // Serve until SIGTERM/SIGINT, then drain the pool.
    tokio::select! {
        result = api_server.start_http() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining");
        }
    }

    let _ = shutdown_tx.send(true);
    let abandoned = pool.shutdown().await;
    info!(abandoned, "Trunkline stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
