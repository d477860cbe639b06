use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use controlplane::api::{self, AppState};
use controlplane::audit::AuditSink;
use controlplane::cli::{Cli, Commands};
use controlplane::config::{self, Config, StoreKind};
use controlplane::jobs::reaper;
use controlplane::limits::budget::BudgetLedger;
use controlplane::limits::rate::RateLimiter;
use controlplane::pipeline::Pipeline;
use controlplane::policy::PolicyEngine;
use controlplane::providers::openai::OpenAiProvider;
use controlplane::providers::registry::ProviderRegistry;
use controlplane::providers::router::ProviderRouter;
use controlplane::providers::Provider;
use controlplane::store::memory::MemoryStore;
use controlplane::store::postgres::PgStore;
use controlplane::store::{AuditStore, BudgetStore, PolicyStore, RateWindowStore};

/// Largest sliding window a rate-limit policy may configure; bounds the
/// reaper's retention horizon.
const MAX_RATE_WINDOW: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(&cfg);

    let args = Cli::parse();
    match args.command {
        Some(Commands::Serve { port }) => run_server(cfg, port).await,
        Some(Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database).await?;
            db.migrate().await?;
            tracing::info!("schema applied");
            Ok(())
        }
        None => run_server(cfg, None).await,
    }
}

fn init_tracing(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.observability.log_level.clone()),
    );
    if cfg.observability.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

struct Stores {
    policies: Arc<dyn PolicyStore>,
    rate: Arc<dyn RateWindowStore>,
    budget: Arc<dyn BudgetStore>,
    audit: Arc<dyn AuditStore>,
}

async fn build_stores(cfg: &Config) -> anyhow::Result<Stores> {
    match cfg.store {
        StoreKind::Postgres => {
            tracing::info!("connecting to database");
            let db = PgStore::connect(&cfg.database).await?;
            db.migrate().await?;
            let db = Arc::new(db);
            Ok(Stores {
                policies: db.clone(),
                rate: db.clone(),
                budget: db.clone(),
                audit: db,
            })
        }
        StoreKind::Memory => {
            tracing::warn!("using in-memory store; nothing persists across restarts");
            let mem = Arc::new(MemoryStore::new());
            Ok(Stores {
                policies: mem.clone(),
                rate: mem.clone(),
                budget: mem.clone(),
                audit: mem,
            })
        }
    }
}

async fn run_server(cfg: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    let stores = build_stores(&cfg).await?;

    let registry = Arc::new(ProviderRegistry::new());
    let openai = OpenAiProvider::new(&cfg.providers.openai);
    if !openai.is_available() {
        tracing::warn!("OPENAI_API_KEY is not set; the openai provider will be unavailable");
    }
    registry.register(Arc::new(openai)).await;

    let router = Arc::new(ProviderRouter::new(registry));
    let pipeline = Pipeline::new(
        PolicyEngine::new(stores.policies.clone()),
        RateLimiter::new(stores.rate.clone()),
        BudgetLedger::new(stores.budget.clone()),
        router,
        AuditSink::new(stores.audit.clone()),
        cfg.pipeline.clone(),
    );
    let state = Arc::new(AppState { pipeline });

    reaper::spawn_rate_reaper(stores.rate.clone(), MAX_RATE_WINDOW);
    reaper::spawn_budget_compactor(stores.budget.clone());
    tracing::info!("background jobs started (rate reaper, budget compactor)");

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .merge(api::router(state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            cfg.server.write_timeout_secs,
        )))
        .layer(axum::middleware::from_fn(request_id_middleware));

    let port = port_override.unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("control plane listening on {}", addr);

    // The drain starts when the signal fires and is bounded by the
    // configured grace period: once it expires, stop waiting on in-flight
    // connections and exit.
    let grace = Duration::from_secs(cfg.server.shutdown_timeout_secs);
    let draining = CancellationToken::new();
    let drain_started = draining.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        drain_started.cancel();
    });

    tokio::select! {
        result = serve => {
            result?;
            tracing::info!("shutdown complete");
        }
        _ = async {
            draining.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(
                "grace period of {}s expired with connections still open, forcing shutdown",
                grace.as_secs()
            );
        }
    }
    Ok(())
}

/// Middleware: stamp every response with a request id clients can quote
/// back when filing issues. The chat handler overrides it with the
/// pipeline's own request id.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(req).await;
    if !response.headers().contains_key("x-request-id") {
        if let Ok(value) = axum::http::HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install shutdown signal handler");
        return;
    }
    tracing::info!("shutdown signal received, draining in-flight connections");
}
