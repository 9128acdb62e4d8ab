//! Market Cache daemon
//!
//! Runs a cache manager for the market-data backend and exposes its health
//! and statistics over HTTP.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    market-cache daemon                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  /healthz  /readyz  /health (JSON)  /metrics (Prometheus)  │
//! ├───────────────────────────────────────────────────────────┤
//! │                      Cache Manager                         │
//! │   local tier · distributed tier · invalidation engine      │
//! └───────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_cache::cache::render_prometheus;
use market_cache::{CacheConfig, CacheManager, CacheStrategy, Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Market Cache - multi-tier cache for the market-data backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache strategy (memory-only, distributed-only, hybrid)
    #[arg(long, env = "CACHE_STRATEGY")]
    strategy: Option<CacheStrategy>,

    /// Distributed store URL (redis://... or memory://)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Identity stamped on published invalidations
    #[arg(long, env = "INSTANCE_ID")]
    instance_id: Option<String>,

    /// Health and metrics server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!(
        version = market_cache::VERSION,
        strategy = %config.strategy,
        url = %config.distributed.url,
        "starting market cache"
    );

    let manager = CacheManager::initialize(config).await?;
    let status = manager.status();
    if status.downgraded {
        info!(
            requested = %status.requested,
            active = %status.strategy,
            "running with reduced strategy"
        );
    }

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(run_health_server(
        args.health_addr.clone(),
        Arc::clone(&manager),
        shutdown.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
    }
    info!("shutdown requested");

    shutdown.cancel();
    match server.await {
        Ok(Err(e)) => error!(error = %e, "health server error"),
        Err(e) => error!(error = %e, "health server task failed"),
        Ok(Ok(())) => {}
    }
    manager.close().await;

    info!("market cache shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(url) = &args.redis_url {
        config.distributed.url = url.clone();
    }
    if let Some(id) = &args.instance_id {
        config.invalidation.instance_id = Some(id.clone());
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "redis=info", "deadpool=info"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn route(manager: Arc<CacheManager>, req: Request<Body>) -> Response<Body> {
    match req.uri().path() {
        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            if manager.status().initialized {
                respond(StatusCode::OK, "text/plain", "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "closed")
            }
        }
        "/health" => {
            let report = manager.health_check().await;
            let status = if report.status.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&report) {
                Ok(body) => respond(status, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        "/metrics" => match render_prometheus(&manager.stats()) {
            Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

async fn run_health_server(
    addr: String,
    manager: Arc<CacheManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let manager = Arc::clone(&manager);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = Arc::clone(&manager);
                async move { Ok::<_, Infallible>(route(manager, req).await) }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}
