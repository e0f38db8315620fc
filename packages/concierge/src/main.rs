use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use turn_relay::{Orchestrator, RelayConfig, TurnDriver};
use uuid::Uuid;

mod backend;
mod config;
mod db;
mod handlers;
mod metrics;
mod repository;

#[cfg(test)]
mod test_helpers;

use crate::backend::OpenAiBackend;
use crate::config::{BackendConfig, ConciergeConfig, FileConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::Repository;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "concierge")]
#[command(about = "Onboarding concierge relaying a generation backend to chat clients")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.concierge)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Server(ServerArgs),

    /// Print a user's onboarding stage and directive as JSON
    Stage(StageArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct StageArgs {
    /// User to inspect
    user_id: String,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub db: Arc<Database>,
    pub driver: Arc<TurnDriver>,
    /// Bounds of the per-turn client channel
    pub relay_config: Arc<RelayConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConciergeConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config.config_toml_path().display()
            )
        })?;

    match cli.command {
        Commands::Server(args) => run_server(args, config, file_config).await,
        Commands::Stage(args) => stage_command(config, file_config, &args.user_id).await,
    }
}

async fn open_repository(
    config: &ConciergeConfig,
    file_config: &FileConfig,
) -> Result<(Arc<Database>, Arc<Repository>)> {
    let db = Arc::new(Database::new(config).await?);
    db::seed_specializations(&db.pool, &file_config.catalog.specializations).await?;
    let repository = Arc::new(Repository::new(db.pool.clone()));
    Ok((db, repository))
}

async fn stage_command(
    config: ConciergeConfig,
    file_config: FileConfig,
    user_id: &str,
) -> Result<()> {
    let (_db, repository) = open_repository(&config, &file_config).await?;
    let orchestrator = Orchestrator::new(
        repository.clone(),
        repository,
        file_config.backend.max_candidates,
    );
    let plan = orchestrator.plan(user_id).await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn run_server(
    args: ServerArgs,
    config: ConciergeConfig,
    file_config: FileConfig,
) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "concierge=debug,turn_relay=debug,tower_http=debug,info"
    } else {
        "concierge=info,turn_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting concierge relay");

    info!("Initializing database...");
    let (db, repository) = open_repository(&config, &file_config).await?;

    let backend_config = BackendConfig::from_file(&file_config.backend);
    info!(
        "Generation backend: {} (model {}, auth {})",
        backend_config.url,
        backend_config.model,
        if backend_config.api_key.is_some() {
            "bearer"
        } else {
            "none"
        }
    );
    let backend = Arc::new(OpenAiBackend::new(backend_config)?);

    let turn_config = config::turn_config(&file_config);
    info!(
        "Relay config: history={} candidates={} max_line={}KB max_marker={}B",
        turn_config.history_turns,
        turn_config.max_candidates,
        turn_config.relay.max_line_bytes / 1024,
        turn_config.relay.max_marker_bytes
    );
    let relay_config = Arc::new(turn_config.relay.clone());
    let driver = Arc::new(TurnDriver::new(
        repository.clone(),
        repository.clone(),
        repository,
        backend,
        turn_config,
    ));

    let app_state = AppState {
        db,
        driver,
        relay_config,
        metrics: Arc::new(ServerMetrics::new()),
    };

    let app = Router::new()
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/users/{user_id}/stage", get(handlers::get_stage_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Concierge listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/chat                   - Stream one conversational turn (SSE)");
    info!("  GET    /api/users/:id/stage        - Onboarding stage for a user");
    info!("  GET    /health, /health/live, /health/ready, /metrics");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, draining connections...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
