use lib_marketfeed::{MarketData, Multiplexer, Tick};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};

/// Latest view of one streamed symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolBoard {
    pub last_price: Option<f64>,
    pub previous_close: Option<f64>,
    pub ticks: u64,
    // Exchange timestamp of the last tick, epoch ms
    pub last_tick_ms: Option<i64>,
}

impl SymbolBoard {
    /// Percent change of the last price against the previous close.
    pub fn change_percent(&self) -> Option<f64> {
        match (self.last_price, self.previous_close) {
            (Some(last), Some(prev)) if prev != 0.0 => Some((last - prev) / prev * 100.0),
            _ => None,
        }
    }
}

struct Board {
    symbols: BTreeMap<String, SymbolBoard>,
    last_data_at: Option<Instant>,
}

#[derive(Clone)]
pub struct AppState {
    pub mux: Multiplexer,
    pub market: MarketData,
    board: Arc<Mutex<Board>>,
}

impl AppState {
    pub fn new(mux: Multiplexer, market: MarketData) -> Self {
        Self {
            mux,
            market,
            board: Arc::new(Mutex::new(Board {
                symbols: BTreeMap::new(),
                last_data_at: None,
            })),
        }
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_tick(&self, tick: &Tick) -> SymbolBoard {
        let mut board = self.board();
        board.last_data_at = Some(Instant::now());
        let entry = board.symbols.entry(tick.ticker.clone()).or_default();
        entry.last_price = Some(tick.price);
        entry.ticks += 1;
        entry.last_tick_ms = Some(tick.timestamp);
        entry.clone()
    }

    pub fn set_previous_close(&self, symbol: &str, close: f64) {
        self.board().symbols.entry(symbol.to_string()).or_default().previous_close = Some(close);
    }

    pub fn snapshot(&self) -> Vec<(String, SymbolBoard)> {
        self.board()
            .symbols
            .iter()
            .map(|(symbol, entry)| (symbol.clone(), entry.clone()))
            .collect()
    }

    /// Time since the last tick on any symbol; `None` before the first one.
    pub fn silent_for(&self) -> Option<Duration> {
        self.board().last_data_at.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_marketfeed::cache::CacheConfig;
    use lib_marketfeed::{CoalescingCache, MarketRestClient, MultiplexerConfig, RestConfig};

    fn app_state() -> AppState {
        let rest = MarketRestClient::new(&RestConfig {
            api_key: "test".into(),
            ..Default::default()
        })
        .unwrap();
        let market = MarketData::new(Arc::new(rest), CoalescingCache::new(CacheConfig::default()));
        AppState::new(Multiplexer::new(MultiplexerConfig::for_feed("test", false)), market)
    }

    fn tick(symbol: &str, price: f64) -> Tick {
        Tick {
            ticker: symbol.to_string(),
            price,
            open: price,
            high: price,
            low: price,
            volume: 10.0,
            vwap: price,
            timestamp: 1_700_000_000_000,
            accumulated_volume: 10.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_update_board_and_change() {
        let state = app_state();
        assert_eq!(state.silent_for(), None);

        state.set_previous_close("AAPL", 200.0);
        state.record_tick(&tick("AAPL", 190.0));
        let board = state.record_tick(&tick("AAPL", 210.0));
        assert_eq!(board.ticks, 2);
        assert_eq!(board.last_price, Some(210.0));
        assert_eq!(board.change_percent(), Some(5.0));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(state.silent_for(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_symbol() {
        let state = app_state();
        state.record_tick(&tick("MSFT", 1.0));
        state.record_tick(&tick("AAPL", 1.0));
        state.set_previous_close("NVDA", 3.0);

        let symbols: Vec<String> = state.snapshot().into_iter().map(|(s, _)| s).collect();
        assert_eq!(symbols, ["AAPL", "MSFT", "NVDA"]);
        assert_eq!(state.snapshot()[2].1.change_percent(), None);
    }
}
