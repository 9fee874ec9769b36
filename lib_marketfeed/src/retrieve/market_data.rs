//! Cached Polygon endpoints.
//!
//! Each endpoint resolves through one shared [`CoalescingCache`], so a burst
//! of identical dashboard requests costs one upstream call. Failures are not
//! cached and surface as [`CacheError::FetchFailed`] wrapping the
//! [`RestError`](super::RestError).

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::rest_client::MarketRestClient;
use crate::cache::{CacheError, CoalescingCache};

/// Ticker search results live 5 minutes.
pub const TICKER_SEARCH_TTL_SECS: u64 = 300;
/// Aggregate bars live 1 minute.
pub const AGGREGATES_TTL_SECS: u64 = 60;
/// News lives 2 minutes.
pub const NEWS_TTL_SECS: u64 = 120;
/// Market status lives 1 minute.
pub const MARKET_STATUS_TTL_SECS: u64 = 60;
/// Previous close lives 5 minutes.
pub const PREVIOUS_CLOSE_TTL_SECS: u64 = 300;

/// Bar width unit for [`MarketData::aggregates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timespan {
    /// One minute.
    Minute,
    /// One hour.
    Hour,
    /// One day.
    Day,
    /// One week.
    Week,
    /// One month.
    Month,
    /// One quarter.
    Quarter,
    /// One year.
    Year,
}

impl Timespan {
    /// The path segment Polygon expects.
    pub fn as_str(self) -> &'static str {
        match self {
            Timespan::Minute => "minute",
            Timespan::Hour => "hour",
            Timespan::Day => "day",
            Timespan::Week => "week",
            Timespan::Month => "month",
            Timespan::Quarter => "quarter",
            Timespan::Year => "year",
        }
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort order for news.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl SortOrder {
    /// The query value Polygon expects.
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Market-data endpoints behind the coalescing cache.
#[derive(Debug, Clone)]
pub struct MarketData {
    client: Arc<MarketRestClient>,
    cache: CoalescingCache<Arc<Value>>,
}

impl MarketData {
    /// Wraps `client` with `cache`.
    pub fn new(client: Arc<MarketRestClient>, cache: CoalescingCache<Arc<Value>>) -> Self {
        Self { client, cache }
    }

    /// The underlying cache, for stats and invalidation.
    pub fn cache(&self) -> &CoalescingCache<Arc<Value>> {
        &self.cache
    }

    /// Active tickers matching `query` (up to 20).
    pub async fn search_tickers(&self, query: &str) -> Result<Arc<Value>, CacheError> {
        self.cached(
            format!("tickers:{query}"),
            "/v3/reference/tickers".to_string(),
            vec![
                ("search".into(), query.to_string()),
                ("active".into(), "true".into()),
                ("limit".into(), "20".into()),
            ],
            TICKER_SEARCH_TTL_SECS,
        )
        .await
    }

    /// Aggregate bars for `ticker` between two `YYYY-MM-DD` dates.
    pub async fn aggregates(
        &self,
        ticker: &str,
        multiplier: u32,
        timespan: Timespan,
        from: &str,
        to: &str,
    ) -> Result<Arc<Value>, CacheError> {
        self.cached(
            format!("aggs:{ticker}:{multiplier}:{timespan}:{from}:{to}"),
            format!("/v2/aggs/ticker/{ticker}/range/{multiplier}/{timespan}/{from}/{to}"),
            Vec::new(),
            AGGREGATES_TTL_SECS,
        )
        .await
    }

    /// News articles, optionally for one ticker.
    pub async fn news(
        &self,
        ticker: Option<&str>,
        limit: u32,
        order: SortOrder,
    ) -> Result<Arc<Value>, CacheError> {
        let mut query = vec![
            ("limit".to_string(), limit.to_string()),
            ("order".to_string(), order.as_str().to_string()),
        ];
        if let Some(ticker) = ticker {
            query.push(("ticker".to_string(), ticker.to_string()));
        }
        self.cached(
            format!("news:{}:{}:{}", ticker.unwrap_or("*"), limit, order.as_str()),
            "/v2/reference/news".to_string(),
            query,
            NEWS_TTL_SECS,
        )
        .await
    }

    /// Current market status.
    pub async fn market_status(&self) -> Result<Arc<Value>, CacheError> {
        self.cached(
            "market-status".to_string(),
            "/v1/marketstatus/now".to_string(),
            Vec::new(),
            MARKET_STATUS_TTL_SECS,
        )
        .await
    }

    /// Previous session's bar for `ticker`.
    pub async fn previous_close(&self, ticker: &str) -> Result<Arc<Value>, CacheError> {
        self.cached(
            format!("prev-close:{ticker}"),
            format!("/v2/aggs/ticker/{ticker}/prev"),
            Vec::new(),
            PREVIOUS_CLOSE_TTL_SECS,
        )
        .await
    }

    /// Close price from a [`previous_close`](Self::previous_close) payload.
    pub fn close_price(payload: &Value) -> Option<f64> {
        payload.get("results")?.get(0)?.get("c")?.as_f64()
    }

    async fn cached(
        &self,
        key: String,
        endpoint: String,
        query: Vec<(String, String)>,
        ttl_secs: u64,
    ) -> Result<Arc<Value>, CacheError> {
        let client = Arc::clone(&self.client);
        self.cache
            .resolve(
                &key,
                move || async move {
                    let response = client.get_json::<Value>(&endpoint, &query).await?;
                    Ok::<_, super::RestError>(Arc::new(response.data))
                },
                ttl_secs,
            )
            .await
    }
}
