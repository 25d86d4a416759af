use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;

use relay_server::ticker_logic::{config, downstream, logger};
use relay_server::{RelayState, UpstreamFeed};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (config, config_file) = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir, &config.log_level)
        .context("failed to set up logging")?;
    log::info!("Logging to {}", log_path.display());
    config_file.log();

    let (shutdown_tx, _) = broadcast::channel(1);
    let relay = RelayState::new();

    let feed = UpstreamFeed::new(config.upstream_url.clone(), config.reconnect, relay.clone());

    // Ends on its own once the feed is dropped.
    let mut feed_state = feed.subscribe_state();
    tokio::spawn(async move {
        while feed_state.changed().await.is_ok() {
            log::debug!("Upstream feed is {:?}", *feed_state.borrow_and_update());
        }
    });
    let upstream_handle = tokio::spawn({
        let shutdown = shutdown_tx.subscribe();
        async move { feed.run(shutdown).await }
    });

    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        relay.clone(),
        shutdown_tx.subscribe(),
    ));

    tokio::select! {
        _ = shutdown_signal() => {}
        res = &mut downstream_handle => {
            // The server only returns on its own when it could not start or failed.
            let _ = shutdown_tx.send(());
            let _ = upstream_handle.await;
            return res.context("downstream task panicked")?;
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let (upstream_res, downstream_res) = tokio::join!(upstream_handle, downstream_handle);
    if let Ok(attempts) = upstream_res {
        log::info!("Upstream feed stopped after {} connection attempt(s).", attempts);
    }
    downstream_res.context("downstream task panicked")??;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Ctrl-C received, initiating shutdown.");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-unix platforms, just wait forever.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
