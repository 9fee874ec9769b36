use crate::feed_logic::config::Config;
use crate::feed_logic::state::AppState;
use lib_marketfeed::ConnectionState;
use tokio::sync::broadcast;
use tokio::time::interval;

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let period = config.status_interval();
    let mut check_interval = interval(period);
    let mut state_rx = app_state.mux.state_changes();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Reconnecting { attempt } => {
                        log::warn!("Upstream lost, reconnect attempt {} scheduled", attempt);
                    }
                    other => log::info!("Upstream state: {:?}", other),
                }
            }
            _ = check_interval.tick() => {
                let status = app_state.mux.status();
                let cache = app_state.market.cache().stats();
                log::info!(
                    "Status: {:?}, {} symbols, {} subscribers, {} queued | cache {}/{} entries, {} in flight, {} hits, {} misses, {} evictions",
                    status.state,
                    status.symbols.len(),
                    status.subscribers,
                    status.queued_directives,
                    cache.size,
                    cache.max_size,
                    cache.in_flight,
                    cache.hits,
                    cache.misses,
                    cache.evictions,
                );

                if status.live_data_delayed {
                    log::warn!(
                        "Live data delayed: gave up after {} reconnect attempts. Showing last known prices.",
                        status.reconnect_attempts
                    );
                }

                if status.state == ConnectionState::Authenticated && status.subscribers > 0 {
                    match app_state.silent_for() {
                        Some(silent) if silent > period * 2 => {
                            log::warn!("No ticks for {} seconds on an authenticated session.", silent.as_secs());
                        }
                        _ => {}
                    }
                }

                for (symbol, board) in app_state.snapshot() {
                    log::debug!(
                        "{}: last {:?}, prev close {:?}, change {:?}%, {} ticks",
                        symbol,
                        board.last_price,
                        board.previous_close,
                        board.change_percent(),
                        board.ticks,
                    );
                }
            }
        }
    }
}
