//! # Coalescing Cache
//!
//! A TTL cache bounded by LRU eviction, with in-flight request coalescing:
//! concurrent `resolve()` calls for the same key share a single fetch and
//! receive the same result or the same error. Failures are never cached.
//!
//! Typical keys are `"<endpoint>:<params>"`, e.g. `news:AAPL:10:desc`.

/// Time sources.
pub mod clock;
/// The cache itself.
pub mod coalescing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coalescing::{CacheConfig, CacheError, CacheStats, CoalescingCache};
