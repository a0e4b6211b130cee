//! Stockroom: product catalogue web service.
//!
//! This is the application entry point. It loads configuration from a TOML
//! file, initializes tracing, builds the credential chain and SQL probe, runs
//! a startup probe, sets up the Axum router and starts the HTTP server.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockroom::config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use stockroom::credential::CredentialProvider;
use stockroom::probe::{DependencyTarget, ProbeExecutor, ProbeTimeouts, TdsConnector};
use stockroom::report::HealthReport;
use stockroom::routes::create_router;
use stockroom::state::AppState;
use stockroom::StartupError;

/// Stockroom: product catalogue web service
#[derive(Parser, Debug)]
#[command(name = "stockroom", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "stockroom=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_tracing(log_filter: &str, logging: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(log_filter));
    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config).map_err(StartupError::from)?;

    // Priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter, &config.logging);

    tracing::info!(path = %args.config, "Loaded configuration");

    let credentials = CredentialProvider::from_config(&config.credentials).map_err(StartupError::from)?;
    tracing::info!(
        sources = ?credentials.source_kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        "Initialized credential chain"
    );

    // A missing connection string is reported by the probe, not treated as fatal
    let target = DependencyTarget::from_config(&config.database);
    if target.is_configured() {
        tracing::info!(
            scope = %target.token_scope,
            required_table = ?target.required_table,
            "SQL dependency configured"
        );
    } else {
        tracing::warn!(
            env = %config.database.connection_string_env,
            "SQL connection string not configured; /health/sql will report unhealthy"
        );
    }

    let probe = ProbeExecutor::new(
        credentials,
        Arc::new(TdsConnector::new()),
        ProbeTimeouts::from_config(&config.database),
    );

    if config.database.startup_probe {
        let probe = probe.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let outcome = probe.run(&target).await;
            let report = HealthReport::from(&outcome);
            tracing::info!(status = outcome.status(), report = ?report, "Startup SQL probe finished");
        });
    }

    let state = AppState::new(config.clone(), target, probe);
    let app = create_router(state);

    stockroom::http::start_server(app, &config)
        .await
        .map_err(StartupError::from)?;

    Ok(())
}
