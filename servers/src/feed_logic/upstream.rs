use crate::feed_logic::config::Config;
use crate::feed_logic::state::AppState;
use futures_util::future::join_all;
use lib_marketfeed::{FeedError, Handlers, MarketData, SubscriptionHandle};
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let symbols = config.symbols();
    if symbols.is_empty() {
        log::warn!("No symbols configured, upstream stays idle.");
        let _ = shutdown.recv().await;
        return;
    }

    // Authenticate up front so a bad key is reported once instead of per symbol
    match app_state.mux.connect().await {
        Ok(()) => log::info!("Upstream authenticated at {}", app_state.mux.config().url),
        Err(FeedError::AuthenticationFailed(reason)) => {
            log::error!("Upstream rejected the API key: {}. Not subscribing.", reason);
            let _ = shutdown.recv().await;
            return;
        }
        Err(e) => log::warn!("Initial upstream connect failed: {}. Subscriptions will retry.", e),
    }

    let handles = subscribe_all(&app_state, &symbols);
    warm_previous_close(&app_state, &symbols).await;

    let _ = shutdown.recv().await;
    log::info!("Upstream service received shutdown signal.");

    for handle in handles {
        handle.unsubscribe();
    }
    app_state.mux.disconnect();
}

fn subscribe_all(app_state: &AppState, symbols: &[String]) -> Vec<SubscriptionHandle> {
    symbols
        .iter()
        .map(|symbol| {
            let state = app_state.clone();
            let error_symbol = symbol.clone();
            let handler = Handlers::new(move |tick| {
                let board = state.record_tick(tick);
                match board.change_percent() {
                    Some(change) => log::debug!("{} {:.2} ({:+.2}%)", tick.ticker, tick.price, change),
                    None => log::debug!("{} {:.2}", tick.ticker, tick.price),
                }
            })
            .on_error(move |e| log::warn!("{}: upstream error: {}", error_symbol, e));

            log::info!("Subscribing {}", symbol);
            app_state.mux.subscribe(symbol, Arc::new(handler))
        })
        .collect()
}

/// Pulls previous closes through the cache so the board can show changes.
async fn warm_previous_close(app_state: &AppState, symbols: &[String]) {
    let results = join_all(symbols.iter().map(|symbol| app_state.market.previous_close(symbol))).await;

    for (symbol, result) in symbols.iter().zip(results) {
        match result {
            Ok(payload) => match MarketData::close_price(&payload) {
                Some(close) => app_state.set_previous_close(symbol, close),
                None => log::warn!("No previous close in response for {}", symbol),
            },
            Err(e) => log::warn!("{}", e),
        }
    }
}
