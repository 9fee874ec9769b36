//! # Core Feed Module
//!
//! The connection multiplexer: one authenticated upstream WebSocket shared by
//! every in-process consumer of real-time ticks.
//!
//! ## Core Components:
//!
//! - **`multiplexer`**: The state machine. Owns the single upstream
//!   connection, performs the auth handshake, keeps the `symbol → handlers`
//!   map, queues directives while offline and reconnects with exponential
//!   backoff when the socket drops unexpectedly.
//!
//! - **`protocol`**: The JSON wire format. Outbound directives, the tagged
//!   inbound message enum and the canonical [`Tick`] record.
//!
//! - **`handlers`**: The subscriber side. The [`TickHandler`] trait, the
//!   closure-based [`Handlers`] bundle and the channel-backed
//!   [`SubscriptionEvent`] form.
//!
//! - **`transport`**: The duplex socket primitive. A [`Connector`] opens a
//!   [`Transport`]; [`WsConnector`] does so over `tokio-tungstenite`.
//!
//! - **`backoff`**: The reconnect schedule, `base * 2^(attempt-1)` up to a
//!   maximum number of attempts.

/// Exponential reconnect schedule.
pub mod backoff;
/// Errors surfaced by the multiplexer.
pub mod error;
/// Subscriber callbacks and channel adapters.
pub mod handlers;
/// The multiplexer state machine.
pub mod multiplexer;
/// Upstream wire protocol.
pub mod protocol;
/// Socket abstraction and the WebSocket implementation.
pub mod transport;

// --- Public API Re-exports ---
pub use backoff::ReconnectPolicy;
pub use error::FeedError;
pub use handlers::{Handlers, SubscriptionEvent, TickHandler};
pub use multiplexer::{
    ConnectionState, Multiplexer, MultiplexerConfig, MultiplexerStatus, SubscriptionHandle,
};
pub use protocol::{Directive, FeedMessage, Tick};
pub use transport::{Connector, Transport, WsConnector};
