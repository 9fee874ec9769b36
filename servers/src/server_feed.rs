use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_marketfeed::{CoalescingCache, MarketData, MarketRestClient, Multiplexer};

mod feed_logic;
use feed_logic::{config, logger, monitor, state, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    // One multiplexer and one cache per process, shared by handle
    let mux = Multiplexer::new(config.multiplexer_config()?);
    let cache_config = config.cache_config();
    let cache = CoalescingCache::new(cache_config.clone());
    let rest = MarketRestClient::new(&config.rest_config())?;
    let market = MarketData::new(Arc::new(rest), cache.clone());
    let app_state = state::AppState::new(mux.clone(), market);

    let sweeper_cancel = CancellationToken::new();
    let sweeper_handle = cache.spawn_sweeper(cache_config.sweep_interval(), sweeper_cancel.clone());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let upstream_handle = tokio::spawn(upstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let _ = tokio::try_join!(upstream_handle, monitor_handle);

    sweeper_cancel.cancel();
    let _ = sweeper_handle.await;
    mux.disconnect();

    log::info!("Shutdown complete.");
    Ok(())
}
