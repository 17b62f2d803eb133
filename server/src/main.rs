//! `h5gate` binary — thin CLI shell over the [`h5gate_server`] library crate.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use h5gate_core::cache::TtlCache;
use h5gate_core::config::{ServiceConfig, StorageConfig, StorageMode};
use h5gate_core::lifecycle::Lifecycle;
use h5gate_core::pool::ReaderPool;
use h5gate_core::storage::{LocalFsAdapter, ObjectStoreAdapter, StorageAdapter};
use h5gate_server::build_router;
use h5gate_server::types::AppContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Read-only HTTP service exposing HDF5 container contents as JSON.
#[derive(Parser)]
#[command(name = "h5gate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Load a TOML config file (see the configuration section of the HTTP
    /// surface docs); any flag below overrides the value it loaded.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage backend: "local" or "s3".
    #[arg(long, value_enum)]
    storage_mode: Option<StorageModeArg>,

    /// Base directory for storage.mode=local.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Endpoint URL for storage.mode=s3.
    #[arg(long)]
    endpoint: Option<String>,

    /// Access key for storage.mode=s3.
    #[arg(long)]
    access_key: Option<String>,

    /// Secret key for storage.mode=s3.
    #[arg(long)]
    secret_key: Option<String>,

    /// Bucket name for storage.mode=s3.
    #[arg(long)]
    bucket: Option<String>,

    /// Region for storage.mode=s3.
    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    listing_ttl_seconds: Option<u64>,
    #[arg(long)]
    meta_ttl_seconds: Option<u64>,
    #[arg(long)]
    max_open: Option<usize>,
    #[arg(long)]
    max_extract_elements: Option<u64>,
    #[arg(long)]
    exact_line_points: Option<u64>,
    #[arg(long)]
    heatmap_max_side: Option<u32>,
    #[arg(long)]
    concurrent_requests: Option<usize>,

    /// Probe storage at startup and exit with code 3 if it is unreachable,
    /// instead of discovering the failure on the first request.
    #[arg(long)]
    eager: bool,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost).
    #[arg(long)]
    bind_all: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StorageModeArg {
    Local,
    S3,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Configuration assembly: TOML file (optional) + CLI overrides
// ---------------------------------------------------------------------------

fn build_config(cli: &Cli) -> Result<ServiceConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("reading {}: {e}", path.display()))?;
            ServiceConfig::from_toml_str(&text).map_err(|e| e.to_string())?
        }
        None => {
            let mode = cli.storage_mode.ok_or_else(|| {
                "storage.mode is required: pass --config or --storage-mode".to_string()
            })?;
            ServiceConfig {
                storage: StorageConfig {
                    mode: match mode {
                        StorageModeArg::Local => StorageMode::Local,
                        StorageModeArg::S3 => StorageMode::S3,
                    },
                    base_dir: None,
                    endpoint: None,
                    access_key: None,
                    secret_key: None,
                    bucket: None,
                    region: None,
                },
                cache: Default::default(),
                readers: Default::default(),
                limits: Default::default(),
            }
        }
    };

    if let Some(base_dir) = &cli.base_dir {
        config.storage.base_dir = Some(base_dir.display().to_string());
    }
    if let Some(v) = &cli.endpoint {
        config.storage.endpoint = Some(v.clone());
    }
    if let Some(v) = &cli.access_key {
        config.storage.access_key = Some(v.clone());
    }
    if let Some(v) = &cli.secret_key {
        config.storage.secret_key = Some(v.clone());
    }
    if let Some(v) = &cli.bucket {
        config.storage.bucket = Some(v.clone());
    }
    if let Some(v) = &cli.region {
        config.storage.region = Some(v.clone());
    }
    if let Some(v) = cli.listing_ttl_seconds {
        config.cache.listing_ttl_seconds = v;
    }
    if let Some(v) = cli.meta_ttl_seconds {
        config.cache.meta_ttl_seconds = v;
    }
    if let Some(v) = cli.max_open {
        config.readers.max_open = v;
    }
    if let Some(v) = cli.max_extract_elements {
        config.limits.max_extract_elements = v;
    }
    if let Some(v) = cli.exact_line_points {
        config.limits.exact_line_points = v;
    }
    if let Some(v) = cli.heatmap_max_side {
        config.limits.heatmap_max_side = v;
    }
    if let Some(v) = cli.concurrent_requests {
        config.limits.concurrent_requests = v;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn build_storage(config: &ServiceConfig) -> Result<Arc<dyn StorageAdapter>, String> {
    match config.storage.mode {
        StorageMode::Local => {
            let base_dir = config.storage.base_dir.as_ref().expect("validated above");
            let adapter = LocalFsAdapter::new(base_dir).map_err(|e| e.to_string())?;
            Ok(Arc::new(adapter))
        }
        StorageMode::S3 => {
            let s = &config.storage;
            let adapter = ObjectStoreAdapter::new(h5gate_core::storage::ObjectStoreConfig {
                endpoint: s.endpoint.clone().expect("validated above"),
                bucket: s.bucket.clone().expect("validated above"),
                access_key: s.access_key.clone().expect("validated above"),
                secret_key: s.secret_key.clone().expect("validated above"),
                region: s.region.clone().unwrap_or_default(),
            })
            .map_err(|e| e.to_string())?;
            Ok(Arc::new(adapter))
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("h5gate=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "h5gate", &mut std::io::stdout());
        return;
    }

    let config = build_config(&cli).unwrap_or_else(|e| {
        error!(error = %e, "configuration error");
        std::process::exit(2);
    });

    let storage = build_storage(&config).unwrap_or_else(|e| {
        error!(error = %e, "could not construct storage adapter");
        std::process::exit(2);
    });

    if cli.eager {
        if let Err(e) = storage.list("", "/").await {
            error!(error = %e, "storage unreachable at startup");
            std::process::exit(3);
        }
    }

    let readers = Arc::new(ReaderPool::new(storage, config.readers.max_open));
    let listing_cache =
        Arc::new(TtlCache::new(Duration::from_secs(config.cache.listing_ttl_seconds)));
    let meta_cache = Arc::new(TtlCache::new(Duration::from_secs(config.cache.meta_ttl_seconds)));
    let lifecycle = Arc::new(Lifecycle::new(config.limits.concurrent_requests));
    let limits = Arc::new(config.limits.clone());

    let ctx = AppContext {
        readers,
        listing_cache,
        meta_cache,
        lifecycle,
        limits,
        start_time: Instant::now(),
    };

    let app = build_router(ctx);

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "could not bind to port");
            eprintln!("  PORT={port} was set explicitly. Choose a different port.");
            std::process::exit(1);
        })
    } else {
        // Auto-scan a small range so two local instances can run side by side.
        const BASE: u16 = 8732;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(l) => {
                    found = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "no free port found");
            eprintln!("  Try: PORT=<port> h5gate ...");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().unwrap().port();
    info!(port = port, concurrent_requests = config.limits.concurrent_requests, "http://{bind_addr}:{port}");
    // Machine-readable line for scripts launching the server as a subprocess.
    eprintln!("H5GATE_PORT={port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();
}
