use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::{atomic::AtomicI64, Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modelrouter_rust::budget::{self, BudgetStore};
use modelrouter_rust::config::Config;
use modelrouter_rust::db::Database;
use modelrouter_rust::health::HealthStore;
use modelrouter_rust::metrics;
use modelrouter_rust::router::{self, AppState, HttpAdapterSource};
use modelrouter_rust::session::SessionStore;

/// CLI surface + the environment variables it recognizes: `STATE_DB_PATH`,
/// `ADMIN_TOKEN`, `ALLOW_INSECURE_RESUME`, `PORT`. Each overrides the
/// matching config-file field when set, mirroring the teacher's
/// `env = "CCR_..."` clap wiring in its own `Cli` struct.
#[derive(Parser)]
#[command(name = "modelrouter")]
#[command(about = "Quality-gated OpenAI-compatible routing gateway", long_about = None)]
struct Cli {
    /// Path to the router config file (model registry + routing policies).
    #[arg(short, long, env = "ROUTER_CONFIG", default_value = "config.json")]
    config: String,

    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port. Overrides the config file's `port` field.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Embedded state database path. Overrides the config file's `db_path`.
    #[arg(long, env = "STATE_DB_PATH")]
    state_db_path: Option<String>,

    /// Admin token for `/admin/reload` and resume authorization. Overrides
    /// the config file's `admin_token` field.
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Process-wide flag allowing unauthenticated `resume` requests.
    #[arg(long, env = "ALLOW_INSECURE_RESUME", default_value = "false")]
    allow_insecure_resume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelrouter=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = Config::from_file(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?
        .with_admin_overrides(cli.admin_token.clone(), cli.allow_insecure_resume);

    let db_path = cli.state_db_path.clone().unwrap_or_else(|| config.db_path().to_string());
    tracing::info!(path = %db_path, "opening state database");
    let db = Arc::new(Database::open(&db_path)?);

    let health = Arc::new(HealthStore::new(db.clone()));
    let budget = Arc::new(BudgetStore::new(db.clone()));
    let session = Arc::new(SessionStore::new(db.clone()));

    budget::seed_budget_limits(&config, &budget);

    tracing::info!(
        models = config.models().count(),
        db_path = %db_path,
        "router configuration loaded",
    );

    let state = AppState {
        config: Arc::new(RwLock::new(config)),
        config_path: Arc::new(config_path),
        health,
        budget,
        session,
        adapters: Arc::new(HttpAdapterSource),
        active_stream: Arc::new(AtomicI64::new(0)),
        active_nonstream: Arc::new(AtomicI64::new(0)),
    };

    let port = cli.port.unwrap_or_else(|| state.config.read().port());

    let app = Router::new()
        .route("/v1/chat/completions", post(router::chat_completions_handler))
        .route("/v1/responses", post(router::responses_handler))
        .route("/health", get(router::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/admin/reload", post(router::admin_reload_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, port));
    tracing::info!("router listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
