use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::signal;
use tracing::{info, warn};

mod api;
mod catalog;
mod config;
mod error;
mod hf_gate;
mod metrics;
mod pipeline;
mod planner;
mod upstream;

pub use config::Config;
pub use error::AppError;

use api::rate_limit::RateLimiter;
use catalog::Catalog;
use hf_gate::HfGate;
use metrics::MetricsCollector;
use pipeline::PipelineState;
use upstream::{AdapterSettings, UpstreamAdapter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rainymodel=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("LITELLM_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/rainymodel/config.yaml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(port = config.server.port, deployments = config.model_list.len(), "rainymodel starting");

    let catalog = Arc::new(Catalog::build(&config));
    let hf_gate = HfGate::new();
    let metrics = Arc::new(MetricsCollector::new(config.server.max_records, config.server.max_logs));
    let adapter = Arc::new(UpstreamAdapter::new(AdapterSettings::from(&config.router_settings)));

    let master_key = std::env::var("RAINYMODEL_MASTER_KEY").ok().filter(|v| !v.is_empty());
    let rate_limiter = if config.server.rate_limit_rpm > 0 {
        Some(RateLimiter::new(config.server.rate_limit_rpm))
    } else {
        None
    };

    let state = Arc::new(PipelineState::new(
        Arc::clone(&catalog),
        hf_gate,
        Arc::clone(&metrics),
        Arc::clone(&adapter),
        master_key,
        rate_limiter,
    ));

    tokio::spawn(config_watcher(Arc::clone(&state), config_path.clone()));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = Router::new()
        .route("/", get(api::health::root))
        .route("/health", get(api::health::health))
        .route("/v1/models", get(api::client::list_models))
        .route("/v1/providers", get(api::client::list_providers))
        .route("/v1/auto/config", get(api::client::auto_config))
        .route("/v1/chat/completions", post(api::client::chat_completions))
        .route("/dashboard/api/overview", get(api::dashboard::overview))
        .route("/dashboard/api/providers", get(api::dashboard::providers))
        .route("/dashboard/api/models", get(api::dashboard::models))
        .route("/dashboard/api/financial", get(api::dashboard::financial))
        .route("/dashboard/api/timeseries", get(api::dashboard::timeseries))
        .route("/dashboard/api/errors", get(api::dashboard::errors))
        .route("/dashboard/api/policies", get(api::dashboard::policies))
        .route("/dashboard/api/fallbacks", get(api::dashboard::fallbacks))
        .route("/dashboard/api/request-log", get(api::dashboard::request_log))
        .route("/dashboard/api/system-log", get(api::dashboard::system_log))
        .fallback(api::client::not_found)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), api::rate_limit::rate_limit_middleware))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), api::client_auth::master_key_middleware))
        .layer(middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer)
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `rainymodel --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("RAINYMODEL_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` for change detection — no inotify/kqueue
/// dependencies, matching the teacher's polling watcher.
async fn config_watcher(state: Arc<PipelineState>, path: PathBuf) {
    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_cfg) => {
                state.replace_catalog(Arc::new(Catalog::build(&new_cfg)));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
