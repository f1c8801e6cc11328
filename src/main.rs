use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use playground_gateway::{
    config::Config,
    executor::{CachedExecutor, CodeExecutor, GoExecutor},
    handlers::{AppState, routes},
    limiter::ClientRateLimiter,
    security::ImportPolicy,
    sweeper,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(&config);
    let config = Arc::new(config.normalized());

    tracing::info!(
        host = %config.host,
        port = config.port,
        max_requests_per_minute = config.max_requests_per_minute,
        max_code_length = config.max_code_length,
        max_output_length = config.max_output_length,
        execution_timeout_secs = config.execution_timeout.as_secs(),
        max_cache_size = config.max_cache_size,
        "configuration loaded"
    );

    let limiter = Arc::new(ClientRateLimiter::new(config.max_requests_per_minute));
    let policy = Arc::new(ImportPolicy::new(config.blacklisted_imports.clone()));
    let runner = Arc::new(GoExecutor::new(
        config.go_executable_path.clone(),
        config.temp_dir.clone(),
        config.max_output_length,
    ));
    let executor: Arc<dyn CodeExecutor> = Arc::new(CachedExecutor::new(
        runner,
        config.max_cache_size,
        config.cache_ttl,
    ));

    sweeper::spawn(config.temp_dir.clone(), config.cleanup_interval);

    let app = routes(AppState {
        config: Arc::clone(&config),
        limiter,
        policy,
        executor,
    });

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;
    tracing::info!(addr = %bind_addr, "go playground gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("gateway server error")?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_directive = if config.debug_mode {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
    }
}
