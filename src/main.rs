//! TierCache Daemon
//!
//! Runs a multi-level cache with a filesystem-backed persistent tier and
//! exposes its statistics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         tiercache                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Memory    │───▶│  Persistent  │───▶│  FsBackend   │       │
//! │  │     Tier     │◀───│     Tier     │    │ (--data-dir) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          │                                                      │
//! │   /metrics  /stats  (metrics addr)     /healthz /readyz         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{AesGcmCipher, CacheConfig, CacheManager, FsBackend};
use tiercache::error::{Error, Result};
use tiercache::exporter::PrometheusExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// TierCache - Multi-level cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding persistent tier records
    #[arg(long, env = "TIERCACHE_DATA_DIR", default_value = "/var/lib/tiercache")]
    data_dir: PathBuf,

    /// AES-256 key as 64 hex characters; a random key is used when unset
    #[arg(long, env = "TIERCACHE_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
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

    info!("Starting tiercache");
    info!("  Data dir: {}", args.data_dir.display());

    let config = match &args.config {
        Some(path) => {
            info!("  Config: {}", path.display());
            CacheConfig::from_yaml_file(path)?
        }
        None => CacheConfig::default(),
    };

    let persistent = config.persistent.is_some();
    let mut builder = CacheManager::builder().with_config(config);
    match &args.encryption_key {
        Some(key) => builder = builder.with_cipher(Arc::new(AesGcmCipher::from_hex(key)?)),
        None => warn!("No encryption key configured; encrypted entries will not survive a restart"),
    }
    if persistent {
        builder = builder.with_persistent_backend(Arc::new(FsBackend::open(&args.data_dir).await?));
    }

    let manager = builder.build()?;
    manager.init().await?;

    let ready = Arc::new(AtomicBool::new(true));
    let exporter = Arc::new(PrometheusExporter::new()?);

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_manager, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("tiercache running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    ready.store(false, Ordering::SeqCst);
    manager.shutdown().await;

    info!("Shutdown complete");
    Ok(())
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

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
// HTTP Helpers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn bind(addr: &str, name: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" => {
                            respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "shutting down")
                        }
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    manager: Arc<CacheManager>,
    exporter: Arc<PrometheusExporter>,
) -> Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let manager = manager.clone();
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let manager = manager.clone();
                let exporter = exporter.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(serve_metrics(req.uri().path(), &manager, &exporter))
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}

fn serve_metrics(path: &str, manager: &CacheManager, exporter: &PrometheusExporter) -> HttpResponse {
    match path {
        "/metrics" => {
            exporter.observe(&manager.stats());
            match exporter.render() {
                Ok(text) => respond(StatusCode::OK, exporter.content_type(), text),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            }
        }
        "/stats" => match serde_json::to_vec(&manager.stats()) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}
