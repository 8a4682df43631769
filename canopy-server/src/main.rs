use anyhow::{Context, Result};
use canopy_cluster::{ClusterNode, HandlerRegistry, HttpProxyHandler, MemoryStore, RecordStore, RestApiHandler};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;

use config::{Config, HandlersConfig};

#[derive(Parser, Debug)]
#[command(name = "canopy-server")]
#[command(about = "Canopy cluster federation node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "canopy.toml")]
    config: String,

    /// Cluster name, overrides the config file
    #[arg(long, env = "CANOPY_NAME")]
    name: Option<String>,

    /// Child-link listen address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Parent listen address; omit to run as root
    #[arg(short, long, env = "CANOPY_PARENT")]
    parent: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_create(std::path::Path::new(&args.config))?;
    if let Some(name) = args.name {
        config.cluster.name = name;
    }
    if let Some(listen) = args.listen {
        config.cluster.listen_addr = listen;
    }
    if args.parent.is_some() {
        config.cluster.parent_addr = args.parent;
    }

    init_tracing(&config);
    tracing::info!("Config file: {}", args.config);

    if let Some(addr) = &config.observability.metrics_addr {
        let addr: SocketAddr = addr.parse().with_context(|| format!("invalid metrics address {}", addr))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        tracing::info!("Metrics listening on {}", addr);
    }

    let handlers = build_handlers(&config.handlers)?;
    tracing::info!(handlers = ?handlers.tags(), "Backend handlers registered");

    let store: Option<Arc<dyn RecordStore>> = if config.cluster.is_root() {
        Some(Arc::new(MemoryStore::new()))
    } else {
        None
    };
    let node = Arc::new(ClusterNode::start(config.cluster.clone(), handlers, store).await?);

    let (admin_stop, admin_task) = if config.admin.enabled {
        let listener = tokio::net::TcpListener::bind(&config.admin.bind_addr)
            .await
            .with_context(|| format!("binding admin API on {}", config.admin.bind_addr))?;
        tracing::info!("Admin API listening on {}", config.admin.bind_addr);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let app = api::router(node.clone());
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
        (Some(stop_tx), Some(task))
    } else {
        (None, None)
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutdown signal received");

    if let Some(stop) = admin_stop {
        let _ = stop.send(());
    }
    if let Some(task) = admin_task {
        let _ = task.await;
    }
    node.shutdown().await;

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
    );
    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn build_handlers(config: &HandlersConfig) -> Result<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    if let Some(upstream) = &config.http_upstream {
        handlers.register("http", Arc::new(HttpProxyHandler::new(upstream.clone(), config.timeout())?));
    }
    if let Some(base_url) = &config.rest_base_url {
        handlers.register(
            "rest",
            Arc::new(RestApiHandler::new(
                base_url.clone(),
                config.rest_token.clone(),
                config.timeout(),
            )?),
        );
    }
    Ok(handlers)
}
