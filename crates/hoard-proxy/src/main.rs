mod admin;
mod config;
mod error;
mod forwarder;
mod proxy;
mod response;

use admin::AdminState;
use clap::Parser;
use config::{parse_addr, Config};
use forwarder::HyperOrigin;
use hoard_cache::LruStore;
use proxy::{DispatchConfig, Dispatcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// hoard: in-memory HTTP caching proxy in front of a single origin.
#[derive(Parser)]
#[command(name = "hoard")]
struct Args {
    /// Path to the TOML config file (optional; defaults apply if missing)
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Port on which the caching proxy listens
    #[arg(long)]
    port: Option<u16>,

    /// Base URL of the origin server requests are forwarded to
    #[arg(long)]
    origin: Option<String>,

    /// Clear the cache of the running instance via its admin listener, then exit
    #[arg(long)]
    clear_cache: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(c) => {
                tracing::info!(path = %args.config.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, path = %args.config.display(), "failed to load config");
                std::process::exit(2);
            }
        }
    } else {
        tracing::info!(path = %args.config.display(), "no config file found, using defaults");
        Config::default_config()
    };
    config.apply_overrides(args.port, args.origin.as_deref());

    if args.clear_cache {
        std::process::exit(clear_running_instance(&config).await);
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        eprintln!("error: {e}\n\nusage: hoard --port <PORT> --origin <URL>, or hoard --clear-cache");
        std::process::exit(2);
    }

    serve(config).await;
}

async fn clear_running_instance(config: &Config) -> i32 {
    let addr = match parse_addr(&config.admin.listen_addr) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };
    match admin::request_clear(addr).await {
        Ok(result) => {
            println!("Cache cleared successfully ({} entries)", result.cleared);
            0
        }
        Err(e) => {
            eprintln!("error: failed to clear cache: {e}");
            1
        }
    }
}

async fn serve(config: Config) {
    let prometheus = if config.admin.enabled {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install prometheus recorder");
                None
            }
        }
    } else {
        None
    };

    let store = Arc::new(LruStore::new(config.cache.capacity));
    let origin = HyperOrigin::new(&config.upstream.url, config.upstream_timeout());
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        origin,
        DispatchConfig {
            ttl: config.ttl(),
            max_body_size: config.cache.max_body_size_bytes,
        },
    ));

    tracing::info!(
        proxy = %config.server.listen_addr,
        admin = ?config.admin.enabled.then_some(config.admin.listen_addr.as_str()),
        upstream = %config.upstream.url,
        capacity = config.cache.capacity,
        ttl_seconds = config.cache.ttl_seconds,
        timeout_ms = config.upstream.timeout_ms,
        "hoard proxy starting"
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let proxy_listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {}: {e}", config.server.listen_addr));
    let proxy_future = axum::serve(proxy_listener, proxy::router(Arc::clone(&dispatcher)))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    if config.admin.enabled {
        let admin_listener = tokio::net::TcpListener::bind(&config.admin.listen_addr)
            .await
            .unwrap_or_else(|e| panic!("failed to bind admin to {}: {e}", config.admin.listen_addr));
        let admin_router = admin::router(AdminState {
            dispatcher: Arc::clone(&dispatcher),
            prometheus,
        });
        let admin_future = axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());

        tokio::select! {
            result = proxy_future => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "proxy server error");
                }
            }
            result = admin_future => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "admin server error");
                }
            }
        }
    } else if let Err(e) = proxy_future.await {
        tracing::error!(error = %e, "proxy server error");
    }

    tracing::info!("hoard proxy shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}
