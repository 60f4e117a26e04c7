use std::{path::PathBuf, sync::Arc};

use axum::{Router, routing::get};
use chrono::NaiveDate;
use clap::Parser;
use tokio_util::task::TaskTracker;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

mod aggregation;
mod billing;
mod config;
mod gcp;
mod jobs;
mod middleware;
pub mod observability;
mod retry;
mod routes;
mod runs;
mod sheets;
mod sync;

#[cfg(test)]
mod tests;

use crate::{
    billing::{BigQueryReader, BillingSource},
    config::SyncConfig,
    gcp::{AccessTokenSource, GcpTokenSource},
    runs::RunRegistry,
    sheets::{GoogleSheetsWriter, SheetWriter},
    sync::{SyncPipeline, SyncRequest},
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SyncConfig>,
    pub pipeline: Arc<SyncPipeline>,
    /// Tracks in-flight runs so shutdown can wait for them.
    pub task_tracker: TaskTracker,
}

impl AppState {
    /// Wire the BigQuery reader and Sheets writer from configuration.
    pub fn new(config: SyncConfig) -> Result<Self, StartupError> {
        let config = Arc::new(config);
        let client = config
            .server
            .http_client
            .build_client()
            .map_err(|e| StartupError(format!("failed to build HTTP client: {}", e)))?;

        let tokens: Arc<dyn AccessTokenSource> =
            Arc::new(GcpTokenSource::new(config.gcp.credentials.clone()));

        let source: Arc<dyn BillingSource> = Arc::new(
            BigQueryReader::from_config(&config, client.clone(), tokens.clone())
                .map_err(|e| StartupError(e.to_string()))?,
        );
        let writer: Arc<dyn SheetWriter> = Arc::new(
            GoogleSheetsWriter::from_config(&config.sheets, client, tokens)
                .map_err(|e| StartupError(e.to_string()))?,
        );

        Ok(Self::with_components(config, source, writer))
    }

    pub fn with_components(
        config: Arc<SyncConfig>,
        source: Arc<dyn BillingSource>,
        writer: Arc<dyn SheetWriter>,
    ) -> Self {
        let pipeline = Arc::new(SyncPipeline::new(
            config.clone(),
            source,
            writer,
            RunRegistry::new(),
        ));
        Self {
            config,
            pipeline,
            task_tracker: TaskTracker::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StartupError(String);

/// CLI arguments for costsync
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Aggregates BigQuery billing export costs into Google Sheets",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./costsync.toml if it exists,
    /// otherwise a built-in template driven by environment variables)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Run one sync in-process, print the summary as JSON and exit
    Run {
        #[arg(long)]
        spreadsheet_id: String,
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Sheet tab to replace (defaults to sheets.sheet_name)
        #[arg(long)]
        sheet: Option<String>,
        /// Comma-separated grouping, e.g. month,service,label:team
        #[arg(long)]
        group_by: Option<String>,
    },
    /// Write the default configuration file
    Init {
        /// Path to create the config file (defaults to ./costsync.toml)
        #[arg(short, long)]
        output: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

const DEFAULT_CONFIG_FILE: &str = "costsync.toml";

/// Default configuration, driven entirely by environment variables so a
/// container can start without a config file.
fn default_config_toml() -> &'static str {
    r#"# costsync configuration

[server]
host = "0.0.0.0"
port = ${PORT:-8080}

[gcp]
project_id = "${GCP_PROJECT_ID}"

# Application Default Credentials (GOOGLE_APPLICATION_CREDENTIALS, gcloud, or
# the metadata server). For an explicit key file use:
# [gcp.credentials]
# type = "service_account"
# key_path = "/secrets/key.json"

[bigquery]
dataset_id = "${BIGQUERY_DATASET_ID}"
table_id = "${BIGQUERY_TABLE_ID}"

[sheets]
sheet_name = "${SHEET_NAME:-Costs}"

[sync]
dimensions = ["month", "service", "project"]
default_lookback_days = 30

[schedule]
enabled = false
time = "06:00"
spreadsheet_ids = []

[observability.logging]
level = "info"
format = "compact"
"#
}

/// Where the config comes from.
#[derive(Debug, PartialEq, Eq)]
enum ConfigSource {
    File(PathBuf),
    Template,
}

fn resolve_config_source(explicit_path: Option<&str>) -> Result<ConfigSource, String> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(ConfigSource::File(path));
    }

    let cwd_config = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd_config.exists() {
        return Ok(ConfigSource::File(cwd_config));
    }

    Ok(ConfigSource::Template)
}

fn load_config(explicit_path: Option<&str>) -> Result<(SyncConfig, String), String> {
    match resolve_config_source(explicit_path)? {
        ConfigSource::File(path) => SyncConfig::from_file(&path)
            .map(|c| (c, path.display().to_string()))
            .map_err(|e| format!("Failed to load config from {}: {}", path.display(), e)),
        ConfigSource::Template => SyncConfig::from_str(default_config_toml())
            .map(|c| (c, "<built-in template>".to_string()))
            .map_err(|e| format!("Failed to load built-in config from environment: {}", e)),
    }
}

pub fn build_app(config: &SyncConfig, state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/live", get(routes::health::liveness))
        .route("/health/ready", get(routes::health::readiness));

    if config.observability.metrics.enabled {
        app = app.route(
            &config.observability.metrics.path,
            get(routes::health::metrics),
        );
    }

    app.nest("/api", routes::get_api_routes())
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Init { output, force }) => run_init(output, force),
        Some(Command::Run {
            spreadsheet_id,
            start_date,
            end_date,
            sheet,
            group_by,
        }) => {
            let request = SyncRequest {
                spreadsheet_id,
                sheet_name: sheet,
                start_date,
                end_date,
                dimensions: None,
                deadline: None,
            };
            run_once(args.config.as_deref(), request, group_by).await;
        }
        Some(Command::Serve) | None => run_server(args.config.as_deref()).await,
    }
}

/// Initialize a new configuration file
fn run_init(output: Option<String>, force: bool) {
    let output_path = output.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);

    if output_path.exists() && !force {
        eprintln!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        );
        std::process::exit(1);
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create directory {}: {}", parent.display(), e);
        std::process::exit(1);
    }

    if let Err(e) = std::fs::write(&output_path, default_config_toml()) {
        eprintln!("Failed to write config file: {}", e);
        std::process::exit(1);
    }

    println!("Created config file: {}", output_path.display());
    println!();
    println!("Set GCP_PROJECT_ID, BIGQUERY_DATASET_ID and BIGQUERY_TABLE_ID, then run:");
    println!("  costsync serve");
}

/// Load config and initialize logging/metrics, exiting on failure.
fn bootstrap(explicit_config_path: Option<&str>) -> (SyncConfig, observability::TracingGuard) {
    let (config, source) = match load_config(explicit_config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let guard = match observability::init_tracing(&config.observability) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    tracing::info!(
        config = %source,
        project_id = %config.gcp.project_id,
        dataset_id = %config.bigquery.dataset_id,
        table_id = %config.bigquery.table_id,
        credentials = config.gcp.credentials.kind(),
        "Configuration loaded"
    );

    (config, guard)
}

/// Run one sync and exit.
async fn run_once(explicit_config_path: Option<&str>, mut request: SyncRequest, group_by: Option<String>) {
    let (config, _tracing_guard) = bootstrap(explicit_config_path);

    if let Some(group_by) = group_by {
        match aggregation::Dimension::parse_list(&group_by) {
            Ok(dimensions) => request.dimensions = Some(dimensions),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(2);
            }
        }
    }

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize");
            std::process::exit(1);
        }
    };

    match state.pipeline.run(request).await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Failed to render summary: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Sync failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_server(explicit_config_path: Option<&str>) {
    let (config, _tracing_guard) = bootstrap(explicit_config_path);

    let state = match AppState::new(config.clone()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize application state");
            std::process::exit(1);
        }
    };

    // Untracked: the worker never finishes, its runs end with the process
    if config.schedule.enabled {
        tokio::spawn(jobs::start_daily_sync_worker(
            state.pipeline.clone(),
            config.schedule.clone(),
        ));
    }

    let task_tracker = state.task_tracker.clone();
    let app = build_app(&config, state);

    let bind_addr = std::net::SocketAddr::new(config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = serve(listener, app, shutdown_signal(), task_tracker, SHUTDOWN_DRAIN_TIMEOUT).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

/// Upper bound on waiting for spawned runs once the listener has closed.
const SHUTDOWN_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Serve until `shutdown` resolves. The listener closes first and in-flight
/// requests finish, then runs still tracked by `task_tracker` get up to
/// `drain_timeout` to complete.
async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
    task_tracker: TaskTracker,
    drain_timeout: std::time::Duration,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Listener closed, waiting for in-flight runs to complete...");
    task_tracker.close();

    match tokio::time::timeout(drain_timeout, task_tracker.wait()).await {
        Ok(()) => tracing::info!("All runs completed"),
        Err(_) => tracing::warn!("Timeout waiting for in-flight runs, some may not have completed"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, no longer accepting connections");
}
