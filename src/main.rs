use deploygate::config::Config;
use deploygate::db::Database;
use deploygate::deploy::Orchestrator;
use deploygate::docker::DockerEngine;
use deploygate::engine::SharedEngine;
use deploygate::proxy::{Proxy, RouteTable, SharedProxy};
use deploygate::server::{AppState, DeployServer, PKG_NAME, VERSION};
use deploygate::transfer::{gc_loop, TransferLimits, TransferStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deploygate=debug".parse().expect("valid log directive"))
                .add_directive("container=warn".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("deploygate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db = Database::open(&config.database.path)?;

    let engine: SharedEngine = Arc::new(
        DockerEngine::connect(config.engine.docker_host.as_deref(), &config.engine.network).await?,
    );

    let route_table = Arc::new(RouteTable::new(db.clone(), config.database.call_timeout()));
    let routes = route_table.reload().await?;
    info!(routes, "Route table loaded");
    let proxy: SharedProxy = route_table;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&engine),
        db.clone(),
        Arc::clone(&proxy),
        &config,
    ));

    let transfers = Arc::new(TransferStore::new(TransferLimits::from(&config.transfers)));

    let auth_token = config.server.auth_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure server.auth_token to set a fixed value)");
        token
    });

    let state = Arc::new(AppState {
        transfers: Arc::clone(&transfers),
        orchestrator,
        db,
        proxy,
        auth_token,
        db_timeout: config.database.call_timeout(),
        max_chunk_size: config.transfers.max_chunk_size,
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let server = DeployServer::new(bind_addr, state, shutdown_rx.clone());

    let gc_shutdown_rx = shutdown_rx.clone();
    let gc_interval = config.transfers.gc_interval();
    let gc_timeout = config.transfers.timeout();
    let gc_handle = tokio::spawn(async move {
        gc_loop(transfers, gc_interval, gc_timeout, gc_shutdown_rx).await;
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Deploy server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = gc_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting deploy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.path,
        "Server configuration"
    );
    info!(
        network = %config.engine.network,
        call_timeout_secs = config.engine.call_timeout_secs,
        staging_dir = %config.engine.staging_dir().display(),
        "Engine settings"
    );
    info!(
        gc_interval_secs = config.transfers.gc_interval_secs,
        timeout_secs = config.transfers.timeout_secs,
        max_chunk_size = config.transfers.max_chunk_size,
        max_total_size = config.transfers.max_total_size,
        "Transfer limits"
    );
}
