use devgate::certs::{CertStore, CertificateAuthority, CertificateSource};
use devgate::config::Config;
use devgate::events::LogEvents;
use devgate::pool::{AppPool, PoolConfig};
use devgate::proxy::{HttpServer, ServerSettings};
use devgate::registry::DirRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let directive = if config.server.debug { "devgate=debug" } else { "devgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file given, using defaults"),
    }
    print_startup_banner(&config);

    std::fs::create_dir_all(&config.apps.dir)?;

    let certs: Option<Arc<dyn CertificateSource>> = if config.server.tls_enabled() {
        let ca = CertificateAuthority::load_or_create(&config.tls.ca_dir, config.tls.ca_validity()).map_err(|e| {
            error!(dir = %config.tls.ca_dir.display(), error = %e, "Failed to set up certificate authority");
            e
        })?;
        Some(Arc::new(CertStore::new(Arc::new(ca), config.tls.leaf_validity())))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(DirRegistry::new(&config.apps.dir, &config.apps.command));
    let pool = AppPool::new(registry, Arc::new(LogEvents), PoolConfig::from_config(&config.apps));
    let reaper = pool.spawn_reaper(shutdown_rx.clone());

    let settings = ServerSettings::from_config(&config.server, config.normalized_domains());
    let server = Arc::new(HttpServer::setup(settings, Arc::clone(&pool), certs, shutdown_rx.clone()).await?);

    let http_server = Arc::clone(&server);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.serve().await {
            error!(error = %e, "HTTP server error");
        }
    });
    let https_server = Arc::clone(&server);
    let https_handle = tokio::spawn(async move {
        if let Err(e) = https_server.serve_tls().await {
            error!(error = %e, "HTTPS server error");
        }
    });

    wait_for_shutdown(&pool).await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping all apps...");
    pool.purge().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        let _ = https_handle.await;
        let _ = reaper.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Handle signals until one asks for shutdown. SIGUSR1 restarts every app.
#[cfg(unix)]
async fn wait_for_shutdown(pool: &AppPool) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sigquit.recv() => {
                info!("Received SIGQUIT, shutting down...");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, stopping all apps");
                pool.purge().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_pool: &AppPool) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), "Starting devgate");
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.tls_enabled().then_some(config.server.https_port),
        domains = ?config.server.domains,
        debug = config.server.debug,
        "Server configuration"
    );
    info!(
        dir = %config.apps.dir.display(),
        command = %config.apps.command,
        idle_timeout_secs = config.apps.idle_timeout_secs,
        startup_timeout_secs = config.apps.startup_timeout_secs,
        "App settings"
    );
    if config.server.tls_enabled() {
        info!(ca_dir = %config.tls.ca_dir.display(), "Certificate authority");
    } else {
        warn!("HTTPS disabled");
    }
}
