use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ocicache::cache::{fs::FsStore, s3::S3Store, Store};
use ocicache::config::{self, Config, StorageBackend};
use ocicache::metrics::MetricsRegistry;
use ocicache::proxy::path::RegistryMode;
use ocicache::proxy::upstream::UpstreamClient;
use ocicache::proxy::{self, AppState};
use ocicache::tls;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ocicache", about = "OCI Pull-Through Caching Proxy")]
struct Cli {
    /// Probe the local /healthz endpoint and exit 0/1. Gives scratch
    /// containers a health check without curl or wget.
    #[arg(long)]
    healthcheck: bool,
}

// ---------------------------------------------------------------------------
// Store construction
// ---------------------------------------------------------------------------

async fn build_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.storage_backend {
        StorageBackend::Fs => Ok(Arc::new(FsStore::new(&config.fs_root))),
        StorageBackend::S3 => {
            let aws_config =
                aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .load()
                    .await;

            let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.s3_force_path_style)
                .build();
            let client = aws_sdk_s3::Client::from_conf(s3_config);

            tracing::info!(
                bucket = %config.s3_bucket,
                prefix = %config.s3_prefix,
                "S3 client initialised"
            );

            Ok(Arc::new(S3Store::new(
                client,
                config.s3_bucket.clone(),
                config.s3_prefix.clone(),
                config.s3_lifecycle_days,
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

/// Accept a Go-style `:8080` listen address as well as a full socket address.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.healthcheck {
        let healthy = reqwest::get("http://127.0.0.1:8080/healthz")
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false);
        std::process::exit(if healthy { 0 } else { 1 });
    }

    let config = config::load()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = build_store(&config).await?;
    store
        .init()
        .await
        .context("failed to initialise storage backend")?;

    let (mode, scheme) = match &config.upstream {
        Some(target) => (
            RegistryMode::SingleUpstream(target.host.clone()),
            target.scheme.clone(),
        ),
        None => (RegistryMode::InPath, "https".to_string()),
    };

    let state = Arc::new(AppState {
        store,
        upstream: UpstreamClient::new(scheme)?,
        mode,
        cache_tag_manifests: config.cache_tag_manifests,
        cache_latest_tag: config.cache_latest_tag,
        metrics: MetricsRegistry::new(),
    });

    let app = proxy::create_router(state);
    let listen_addr = parse_listen_addr(&config.listen_addr)?;

    // In-flight requests get 30 seconds to drain after a shutdown signal.
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutting down gracefully");
            handle.graceful_shutdown(Some(Duration::from_secs(30)));
        }
    });

    tracing::info!(
        %listen_addr,
        tls = config.generate_self_signed_tls,
        upstream = ?config.upstream.as_ref().map(|u| u.host.as_str()),
        backend = ?config.storage_backend,
        "starting server"
    );

    if config.generate_self_signed_tls {
        let tls_config = tls::self_signed_config().await?;
        tracing::info!("generated self-signed TLS certificate");
        axum_server::bind_rustls(listen_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server error")?;
    } else {
        axum_server::bind(listen_addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server error")?;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_accepts_go_style() {
        assert_eq!(
            parse_listen_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("not-an-addr").is_err());
    }
}
