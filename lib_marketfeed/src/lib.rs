//! # lib_marketfeed
//!
//! Real-time market data distribution for the dashboard backend.
//!
//! - **`core`**: the connection multiplexer. One authenticated upstream
//!   WebSocket to the Polygon stocks cluster, fanned out to any number of
//!   in-process subscribers keyed by symbol, with queued directives while
//!   offline and exponential-backoff reconnects.
//! - **`cache`**: a TTL cache with LRU bounding and in-flight request
//!   coalescing, placed in front of slow, rate-limited fetches.
//! - **`retrieve`**: the REST client and the cached market-data endpoints
//!   built on top of `cache`.
//!
//! Modules are gated by the features of the same name (`full` enables all).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Upstream connection multiplexer and its wire protocol.
#[cfg(feature = "core")]
pub mod core;

/// Coalescing TTL/LRU cache.
#[cfg(feature = "cache")]
pub mod cache;

/// REST retrieval with retries and cached endpoints.
#[cfg(feature = "retrieve")]
pub mod retrieve;

// --- Public API Re-exports ---
#[cfg(feature = "core")]
pub use crate::core::{
    ConnectionState, FeedError, Handlers, Multiplexer, MultiplexerConfig, SubscriptionEvent,
    SubscriptionHandle, Tick, TickHandler,
};

#[cfg(feature = "cache")]
pub use crate::cache::{CacheConfig, CacheError, CoalescingCache};

#[cfg(feature = "retrieve")]
pub use crate::retrieve::{MarketData, MarketRestClient, RestConfig, RestError};
