use anyhow::Result;
use lib_common::connections::{MongoCatalog, MongoConnector};
use lib_common::core::BroadcastHub;
use lib_common::feeds::MongoChangeFeed;
use servers::watch_logic::{config, downstream, logger, state, upstream};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config()?;
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let connector = Arc::new(MongoConnector::new(
        settings.mongo_uri.clone(),
        settings.server_selection_timeout,
    ));
    match connector.ping().await {
        Ok(()) => info!("document store reachable"),
        Err(e) => warn!(error = %e, "document store unreachable at startup, the watch session will keep retrying"),
    }
    let catalog = Arc::new(MongoCatalog::new(Arc::clone(&connector), settings.excluded.clone()));
    let hub = Arc::new(BroadcastHub::new(settings.viewer_queue, settings.locked));
    let shutdown = CancellationToken::new();

    let (session, upstream_handle) = upstream::spawn(
        MongoChangeFeed::new(connector),
        Arc::clone(&hub),
        &settings,
        shutdown.clone(),
    );

    let app_state = state::AppState::new(hub, session, catalog, settings);
    let downstream_handle = tokio::spawn(downstream::run(app_state, shutdown.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping.");
    shutdown.cancel();

    let (upstream_result, downstream_result) = tokio::join!(upstream_handle, downstream_handle);
    if let Err(e) = upstream_result {
        error!(error = %e, "upstream task panicked");
    }
    match downstream_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "downstream server failed"),
        Err(e) => error!(error = %e, "downstream task panicked"),
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
