//! Subscriber callbacks.
//!
//! A subscription is an `Arc<dyn TickHandler>`. Identity is the `Arc`
//! pointer: registering the same `Arc` twice yields two deliveries, and
//! unsubscribing removes the first registration of that exact `Arc`.

use tokio::sync::mpsc;

use super::error::FeedError;
use super::protocol::Tick;

/// Receives ticks and connection lifecycle notifications for one symbol.
///
/// Callbacks run on the connection task, outside any internal lock, so a
/// handler may subscribe or unsubscribe from inside a callback. They must not
/// block.
pub trait TickHandler: Send + Sync {
    /// A tick for the subscribed symbol.
    fn on_message(&self, tick: &Tick);

    /// A transport or authentication error on the shared connection.
    fn on_error(&self, _error: &FeedError) {}

    /// The shared connection authenticated.
    fn on_connect(&self) {}

    /// The shared connection closed.
    fn on_disconnect(&self) {}
}

type TickFn = Box<dyn Fn(&Tick) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&FeedError) + Send + Sync>;
type LifecycleFn = Box<dyn Fn() + Send + Sync>;

/// Closure-based [`TickHandler`].
///
/// ```ignore
/// let handler = Handlers::new(|tick| println!("{} {}", tick.ticker, tick.price))
///     .on_error(|e| eprintln!("{e}"));
/// let sub = mux.subscribe("AAPL", std::sync::Arc::new(handler));
/// ```
pub struct Handlers {
    message: TickFn,
    error: Option<ErrorFn>,
    connect: Option<LifecycleFn>,
    disconnect: Option<LifecycleFn>,
}

impl Handlers {
    /// Creates a bundle with only the required tick callback.
    pub fn new(on_message: impl Fn(&Tick) + Send + Sync + 'static) -> Self {
        Self {
            message: Box::new(on_message),
            error: None,
            connect: None,
            disconnect: None,
        }
    }

    /// Sets the error callback.
    pub fn on_error(mut self, f: impl Fn(&FeedError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Sets the connect callback.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.connect = Some(Box::new(f));
        self
    }

    /// Sets the disconnect callback.
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.disconnect = Some(Box::new(f));
        self
    }
}

impl TickHandler for Handlers {
    fn on_message(&self, tick: &Tick) {
        (self.message)(tick);
    }

    fn on_error(&self, error: &FeedError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    fn on_connect(&self) {
        if let Some(f) = &self.connect {
            f();
        }
    }

    fn on_disconnect(&self) {
        if let Some(f) = &self.disconnect {
            f();
        }
    }
}

/// Everything a subscription observes, as a channel item.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A tick for the subscribed symbol.
    Tick(Tick),
    /// An error on the shared connection.
    Error(FeedError),
    /// The shared connection authenticated.
    Connected,
    /// The shared connection closed.
    Disconnected,
}

/// Forwards callbacks into an unbounded channel. Sends to a dropped receiver
/// are ignored.
pub(crate) struct ChannelHandler {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelHandler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SubscriptionEvent>) -> Self {
        Self { tx }
    }
}

impl TickHandler for ChannelHandler {
    fn on_message(&self, tick: &Tick) {
        let _ = self.tx.send(SubscriptionEvent::Tick(tick.clone()));
    }

    fn on_error(&self, error: &FeedError) {
        let _ = self.tx.send(SubscriptionEvent::Error(error.clone()));
    }

    fn on_connect(&self) {
        let _ = self.tx.send(SubscriptionEvent::Connected);
    }

    fn on_disconnect(&self) {
        let _ = self.tx.send(SubscriptionEvent::Disconnected);
    }
}
