//! # Data Retrieval Module
//!
//! The slow, rate-limited side of the feed: the Polygon REST API.
//!
//! ## Contained Modules:
//!
//! - **`rest_client`**: [`MarketRestClient`], built on `reqwest` and
//!   `reqwest-middleware` with exponential-backoff retries.
//! - **`market_data`**: [`MarketData`], the typed endpoints resolved through
//!   the coalescing cache with per-endpoint TTLs.

/// Cached market-data endpoints.
pub mod market_data;
/// REST client with retry middleware.
pub mod rest_client;

pub use market_data::{MarketData, SortOrder, Timespan};
pub use rest_client::{MarketRestClient, RestConfig, RestError, RestResponse, POLYGON_REST_URL};
