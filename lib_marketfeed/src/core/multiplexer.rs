//! # Connection Multiplexer
//!
//! One physical upstream socket shared by many logical subscriptions.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──connect()/subscribe()──▶ Connecting ──open──▶ AwaitingAuth ──auth_success──▶ Authenticated
//!      ▲                                       ▲                     │                              │
//!      │ cap reached / auth_failed             │ backoff elapsed     └───────── close/error ────────┤
//!      └────────────────────────────── Reconnecting { attempt } ◀──────────────────────────────────┘
//! ```
//!
//! Each connection attempt runs in its own spawned task that owns the
//! [`Transport`](super::Transport). The multiplexer talks to that task through
//! an unbounded channel of serialized directives, and the task reports back by
//! calling into the shared state. Attempts carry a generation number: once an
//! attempt has been superseded (by `disconnect()` or a newer attempt) its
//! events are ignored.
//!
//! Directives issued while not authenticated are queued and flushed in FIFO
//! order inside the same critical section that marks the session
//! authenticated, so nothing issued afterwards can overtake them.
//!
//! Handler callbacks always run outside the lock on a snapshot of the handler
//! list, which lets a handler unsubscribe itself from inside `on_message`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectPolicy;
use super::error::FeedError;
use super::handlers::{ChannelHandler, SubscriptionEvent, TickHandler};
use super::protocol::{
    self, Action, Directive, FeedMessage, StatusKind, DELAYED_STOCKS_URL, REALTIME_STOCKS_URL,
    SECOND_AGGREGATES,
};
use super::transport::{Connector, Transport, WsConnector};

/// Settings for one [`Multiplexer`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultiplexerConfig {
    /// WebSocket endpoint of the stocks cluster.
    pub url: String,
    /// Credential presented in the `auth` directive.
    pub api_key: String,
    /// Channel prefix prepended to every symbol (`A` per-second, `AM` per-minute).
    pub channel_prefix: String,
    /// Bound on transport open plus authentication.
    pub auth_timeout_ms: u64,
    /// Reconnect schedule for unexpected closes.
    pub reconnect: ReconnectPolicy,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            url: DELAYED_STOCKS_URL.to_string(),
            api_key: String::new(),
            channel_prefix: SECOND_AGGREGATES.to_string(),
            auth_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl MultiplexerConfig {
    /// Config for the real-time (`realtime = true`) or the 15-minute delayed
    /// stocks cluster.
    pub fn for_feed(api_key: impl Into<String>, realtime: bool) -> Self {
        let url = if realtime {
            REALTIME_STOCKS_URL
        } else {
            DELAYED_STOCKS_URL
        };
        Self {
            url: url.to_string(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// The authentication bound as a `Duration`.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

impl fmt::Debug for MultiplexerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("channel_prefix", &self.channel_prefix)
            .field("auth_timeout_ms", &self.auth_timeout_ms)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Connection lifecycle, as published through [`Multiplexer::state_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No socket and no pending attempt.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, `auth` sent, waiting for the status frame.
    AwaitingAuth,
    /// Authenticated; directives go straight to the socket.
    Authenticated,
    /// Waiting out the backoff delay before attempt `attempt`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
}

/// Point-in-time view of the multiplexer, for status endpoints and monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexerStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Subscribed symbols, in first-registration order.
    pub symbols: Vec<String>,
    /// Total registered handlers across all symbols.
    pub subscribers: usize,
    /// Directives waiting for authentication.
    pub queued_directives: usize,
    /// Consecutive failed reconnect attempts.
    pub reconnect_attempts: u32,
    /// Subscriptions exist but nothing will reconnect on its own
    /// (retry cap reached or credential rejected).
    pub live_data_delayed: bool,
}

type ConnectWaiter = oneshot::Sender<Result<(), FeedError>>;

struct Inner {
    state: ConnectionState,
    generation: u64,
    /// Cancels the active attempt task or pending backoff timer.
    session: Option<CancellationToken>,
    /// Serialized frames for the socket task; `Some` from transport open until close.
    outbound: Option<mpsc::UnboundedSender<String>>,
    subscriptions: IndexMap<String, Vec<Arc<dyn TickHandler>>>,
    queue: VecDeque<Directive>,
    attempts: u32,
    waiters: Vec<ConnectWaiter>,
}

struct Shared {
    config: MultiplexerConfig,
    connector: Arc<dyn Connector>,
    /// Runtime current at construction; used when a caller has none.
    runtime: Option<Handle>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Why an attempt's socket went away.
enum CloseReason {
    /// The reader ended.
    Closed,
    /// The socket or the auth bound failed.
    Error(FeedError),
    /// The server answered `auth_failed`.
    AuthRejected(String),
}

enum FrameOutcome {
    Continue,
    Authenticated,
    AuthRejected(String),
    Stale,
}

/// What `connection_closed` decided to do next, executed after callbacks.
struct Reconnect {
    generation: u64,
    cancel: CancellationToken,
    delay: Duration,
}

/// A cheaply cloneable handle to the single upstream connection.
///
/// Construct one per process in the composition root and share clones.
/// Dropping the last clone cancels the connection task. Connection tasks run
/// on the caller's Tokio runtime, or else on the one current when the
/// multiplexer was created. With neither, `subscribe` only registers and
/// `connect` fails.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

/// Registration returned by [`Multiplexer::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[must_use = "dropping the handle leaves the subscription registered"]
pub struct SubscriptionHandle {
    symbol: String,
    handler: Arc<dyn TickHandler>,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    /// The symbol this registration belongs to.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Removes this registration. Returns `false` if it was already gone
    /// (for example after `disconnect()`).
    pub fn unsubscribe(self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.unsubscribe(&self.symbol, &self.handler),
            None => false,
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("symbol", &self.symbol)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Creates a multiplexer over the real WebSocket transport. Nothing
    /// connects until `connect()` or the first `subscribe()`.
    pub fn new(config: MultiplexerConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Creates a multiplexer over a custom transport.
    pub fn with_connector(config: MultiplexerConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                runtime: Handle::try_current().ok(),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    session: None,
                    outbound: None,
                    subscriptions: IndexMap::new(),
                    queue: VecDeque::new(),
                    attempts: 0,
                    waiters: Vec::new(),
                }),
                state_tx,
            }),
        }
    }

    /// Connects and authenticates.
    ///
    /// Resolves immediately when already authenticated and fails with
    /// [`FeedError::ConnectionInProgress`] while another attempt is opening or
    /// authenticating. A pending backoff timer is cut short. Errors after this
    /// call has resolved reach subscribers through `on_error` only.
    pub async fn connect(&self) -> Result<(), FeedError> {
        let rx = {
            let mut inner = self.shared.lock();
            match inner.state {
                ConnectionState::Authenticated => return Ok(()),
                ConnectionState::Connecting | ConnectionState::AwaitingAuth => {
                    return Err(FeedError::ConnectionInProgress)
                }
                ConnectionState::Disconnected | ConnectionState::Reconnecting { .. } => {}
            }
            inner.attempts = 0;
            if !self.shared.begin_connect(&mut inner) {
                return Err(FeedError::Transport("no Tokio runtime to drive the connection".into()));
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(Err(FeedError::Disconnected))
    }

    /// Registers `handler` for `symbol`.
    ///
    /// The first handler for a symbol sends the upstream `subscribe`
    /// directive, or queues it when not authenticated. From `Disconnected`
    /// this also starts a connection attempt. Never fails and never panics;
    /// without any Tokio runtime the attempt is left to a later `connect()`.
    pub fn subscribe(&self, symbol: &str, handler: Arc<dyn TickHandler>) -> SubscriptionHandle {
        self.shared.subscribe(symbol, handler.clone());
        SubscriptionHandle {
            symbol: symbol.to_string(),
            handler,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// [`subscribe`](Self::subscribe), delivering events through a channel.
    pub fn subscribe_channel(
        &self,
        symbol: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(symbol, Arc::new(ChannelHandler::new(tx)));
        (handle, rx)
    }

    /// Removes the first registration of exactly this `Arc` for `symbol`.
    ///
    /// Removing the last handler sends one upstream `unsubscribe` directive
    /// (or drops the still-queued `subscribe`). Returns whether anything was
    /// removed.
    pub fn unsubscribe<H: TickHandler + ?Sized>(&self, symbol: &str, handler: &Arc<H>) -> bool {
        self.shared.unsubscribe(symbol, handler)
    }

    /// Transport open and authenticated.
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.lock();
        inner.state == ConnectionState::Authenticated && inner.outbound.is_some()
    }

    /// Closes the socket and forgets every subscription and queued directive.
    ///
    /// No callbacks run and nothing reconnects afterwards. A pending
    /// `connect()` fails with [`FeedError::Disconnected`].
    pub fn disconnect(&self) {
        let waiters = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            if let Some(token) = inner.session.take() {
                token.cancel();
            }
            inner.outbound = None;
            inner.subscriptions.clear();
            inner.queue.clear();
            inner.attempts = 0;
            self.shared.set_state(&mut inner, ConnectionState::Disconnected);
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(FeedError::Disconnected));
        }
        log::info!("Multiplexer disconnected by caller");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> MultiplexerStatus {
        let inner = self.shared.lock();
        let subscribers = inner.subscriptions.values().map(Vec::len).sum();
        MultiplexerStatus {
            state: inner.state,
            symbols: inner.subscriptions.keys().cloned().collect(),
            subscribers,
            queued_directives: inner.queue.len(),
            reconnect_attempts: inner.attempts,
            live_data_delayed: inner.state == ConnectionState::Disconnected
                && !inner.subscriptions.is_empty(),
        }
    }

    /// The configuration this multiplexer was built with.
    pub fn config(&self) -> &MultiplexerConfig {
        &self.shared.config
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            log::debug!("Connection state {:?} -> {:?}", inner.state, state);
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Starts a fresh attempt, superseding whatever was running. Returns
    /// `false`, leaving the state untouched, when no runtime is available.
    fn begin_connect(self: &Arc<Self>, inner: &mut Inner) -> bool {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            log::error!("No Tokio runtime to connect to {}; staying disconnected", self.config.url);
            return false;
        };
        inner.generation += 1;
        if let Some(token) = inner.session.take() {
            token.cancel();
        }
        inner.outbound = None;
        let cancel = CancellationToken::new();
        inner.session = Some(cancel.clone());
        self.set_state(inner, ConnectionState::Connecting);
        log::info!("Connecting to {}", self.config.url);

        runtime.spawn(run_connection(
            Arc::downgrade(self),
            inner.generation,
            cancel,
        ));
        true
    }

    fn subscribe(self: &Arc<Self>, symbol: &str, handler: Arc<dyn TickHandler>) {
        let mut inner = self.lock();
        let handlers = inner.subscriptions.entry(symbol.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push(handler);
        log::debug!("Subscribed to {} (first: {})", symbol, first);

        if first {
            let directive = Directive::subscribe(&self.config.channel_prefix, symbol);
            self.send_or_queue(&mut inner, directive);
        }
        if inner.state == ConnectionState::Disconnected {
            inner.attempts = 0;
            // Without a runtime the directive stays queued for a later connect().
            let _ = self.begin_connect(&mut inner);
        }
    }

    fn unsubscribe<H: TickHandler + ?Sized>(&self, symbol: &str, handler: &Arc<H>) -> bool {
        let target = Arc::as_ptr(handler).cast::<()>();
        let mut inner = self.lock();

        let Some(handlers) = inner.subscriptions.get_mut(symbol) else {
            return false;
        };
        let Some(pos) = handlers
            .iter()
            .position(|h| Arc::as_ptr(h).cast::<()>() == target)
        else {
            return false;
        };
        handlers.remove(pos);

        if handlers.is_empty() {
            inner.subscriptions.shift_remove(symbol);
            log::debug!("Last handler for {} removed", symbol);
            if inner.state == ConnectionState::Authenticated {
                let directive = Directive::unsubscribe(&self.config.channel_prefix, symbol);
                self.send_or_queue(&mut inner, directive);
            } else {
                let channel = protocol::channel(&self.config.channel_prefix, symbol);
                inner
                    .queue
                    .retain(|d| !(d.action == Action::Subscribe && d.params == channel));
            }
        }
        true
    }

    /// Sends straight to the socket when authenticated, otherwise queues.
    fn send_or_queue(&self, inner: &mut Inner, directive: Directive) {
        if inner.state == ConnectionState::Authenticated {
            if let Some(tx) = &inner.outbound {
                match directive.to_frame() {
                    Ok(frame) => {
                        if tx.send(frame).is_ok() {
                            log::debug!("Sent {:?}", directive);
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to serialize {:?}: {}", directive, e);
                        return;
                    }
                }
            }
        }
        inner.queue.push_back(directive);
    }

    /// The attempt's socket opened: hand it the outbound channel and send `auth`.
    fn transport_opened(&self, generation: u64, tx: mpsc::UnboundedSender<String>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        match Directive::auth(&self.config.api_key).to_frame() {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(e) => log::error!("Failed to serialize auth directive: {}", e),
        }
        inner.outbound = Some(tx);
        self.set_state(&mut inner, ConnectionState::AwaitingAuth);
        log::info!("Transport open, authenticating");
        true
    }

    fn handle_frame(&self, generation: u64, text: &str) -> FrameOutcome {
        let messages = match protocol::parse_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("{}", FeedError::from(e));
                return FrameOutcome::Continue;
            }
        };

        let mut outcome = FrameOutcome::Continue;
        for message in messages {
            match message {
                FeedMessage::Status(status) => match status.kind() {
                    StatusKind::AuthSuccess => {
                        if !self.authenticated(generation) {
                            return FrameOutcome::Stale;
                        }
                        outcome = FrameOutcome::Authenticated;
                    }
                    StatusKind::AuthFailed => {
                        let reason = status.message.unwrap_or(status.status);
                        log::error!("Authentication failed: {}", reason);
                        return FrameOutcome::AuthRejected(reason);
                    }
                    StatusKind::Informational => {
                        log::debug!(
                            "Status {}: {}",
                            status.status,
                            status.message.as_deref().unwrap_or("")
                        );
                    }
                },
                FeedMessage::SecondAggregate(agg) | FeedMessage::MinuteAggregate(agg) => {
                    let handlers = {
                        let inner = self.lock();
                        if inner.generation != generation {
                            return FrameOutcome::Stale;
                        }
                        inner.subscriptions.get(&agg.sym).cloned()
                    };
                    if let Some(handlers) = handlers {
                        let tick = agg.into();
                        for handler in handlers {
                            handler.on_message(&tick);
                        }
                    }
                }
                FeedMessage::Unknown => {}
            }
        }
        outcome
    }

    /// `auth_success`: flush the queue, settle waiters, then notify handlers.
    fn authenticated(&self, generation: u64) -> bool {
        let (waiters, handlers) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return false;
            }
            if inner.state == ConnectionState::Authenticated {
                log::debug!("Ignoring repeated auth_success");
                return true;
            }
            self.set_state(&mut inner, ConnectionState::Authenticated);
            inner.attempts = 0;

            let queued = std::mem::take(&mut inner.queue);
            let flushed = queued.len();
            for directive in queued {
                self.send_or_queue(&mut inner, directive);
            }
            log::info!("Authenticated; flushed {} queued directive(s)", flushed);

            (std::mem::take(&mut inner.waiters), snapshot_all(&inner))
        };

        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        for handler in handlers {
            handler.on_connect();
        }
        true
    }

    fn connection_closed(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        let (waiters, handlers, error, reconnect) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.outbound = None;
            inner.session = None;

            // The next session starts with no upstream subscriptions; restore
            // every registered symbol before anything newer.
            let resubscribe: VecDeque<Directive> = inner
                .subscriptions
                .keys()
                .map(|symbol| Directive::subscribe(&self.config.channel_prefix, symbol))
                .collect();
            inner.queue = resubscribe;

            let (error, retry) = match reason {
                CloseReason::Closed => {
                    log::warn!("Upstream connection closed");
                    (None, true)
                }
                CloseReason::Error(e) => {
                    log::warn!("Upstream connection failed: {}", e);
                    let retry = e.is_retryable();
                    (Some(e), retry)
                }
                CloseReason::AuthRejected(reason) => {
                    (Some(FeedError::AuthenticationFailed(reason)), false)
                }
            };

            let mut reconnect = None;
            if retry && !inner.subscriptions.is_empty() {
                let attempt = inner.attempts + 1;
                match self.config.reconnect.delay_for(attempt) {
                    Some(delay) => {
                        inner.attempts = attempt;
                        inner.generation += 1;
                        let cancel = CancellationToken::new();
                        inner.session = Some(cancel.clone());
                        self.set_state(&mut inner, ConnectionState::Reconnecting { attempt });
                        log::info!("Reconnect attempt {} in {:?}", attempt, delay);
                        reconnect = Some(Reconnect {
                            generation: inner.generation,
                            cancel,
                            delay,
                        });
                    }
                    None => {
                        log::warn!(
                            "Giving up after {} reconnect attempt(s); live data delayed",
                            inner.attempts
                        );
                        self.set_state(&mut inner, ConnectionState::Disconnected);
                    }
                }
            } else {
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }

            (
                std::mem::take(&mut inner.waiters),
                snapshot_all(&inner),
                error,
                reconnect,
            )
        };

        let waiter_error = error
            .clone()
            .unwrap_or_else(|| FeedError::Transport("connection closed before authentication".into()));
        for waiter in waiters {
            let _ = waiter.send(Err(waiter_error.clone()));
        }
        if let Some(error) = &error {
            for handler in &handlers {
                handler.on_error(error);
            }
        }
        for handler in &handlers {
            handler.on_disconnect();
        }

        if let Some(plan) = reconnect {
            tokio::spawn(reconnect_after(Arc::downgrade(self), plan));
        }
    }

    /// The backoff delay elapsed; move to `Connecting` if still current.
    fn reconnect_due(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.set_state(&mut inner, ConnectionState::Connecting);
        log::info!("Reconnecting to {} (attempt {})", self.config.url, inner.attempts);
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = inner.session.take() {
            token.cancel();
        }
    }
}

/// Every registration across all symbols, in registration order per symbol.
fn snapshot_all(inner: &Inner) -> Vec<Arc<dyn TickHandler>> {
    inner.subscriptions.values().flatten().cloned().collect()
}

async fn reconnect_after(weak: Weak<Shared>, plan: Reconnect) {
    tokio::select! {
        _ = plan.cancel.cancelled() => return,
        _ = tokio::time::sleep(plan.delay) => {}
    }
    let due = match weak.upgrade() {
        Some(shared) => shared.reconnect_due(plan.generation),
        None => false,
    };
    if due {
        run_connection(weak, plan.generation, plan.cancel).await;
    }
}

/// Drives one connection attempt from transport open until close.
async fn run_connection(weak: Weak<Shared>, generation: u64, cancel: CancellationToken) {
    let Some((connector, url, auth_timeout)) = weak.upgrade().map(|shared| {
        (
            shared.connector.clone(),
            shared.config.url.clone(),
            shared.config.auth_timeout(),
        )
    }) else {
        return;
    };

    let deadline = tokio::time::sleep(auth_timeout);
    tokio::pin!(deadline);

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        _ = &mut deadline => Err(FeedError::AuthenticationTimeout(auth_timeout)),
        result = connector.connect(&url) => result,
    };
    let Transport {
        mut writer,
        mut reader,
    } = match opened {
        Ok(transport) => transport,
        Err(e) => {
            if let Some(shared) = weak.upgrade() {
                shared.connection_closed(generation, CloseReason::Error(e));
            }
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let opened = weak
        .upgrade()
        .is_some_and(|shared| shared.transport_opened(generation, tx));
    if !opened {
        let _ = writer.close().await;
        return;
    }

    let mut authenticated = false;
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = writer.close().await;
                return;
            }
            _ = &mut deadline, if !authenticated => {
                break CloseReason::Error(FeedError::AuthenticationTimeout(auth_timeout));
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = writer.send(frame).await {
                    break CloseReason::Error(e);
                }
            }
            item = reader.next() => match item {
                Some(Ok(text)) => {
                    let Some(shared) = weak.upgrade() else { return };
                    match shared.handle_frame(generation, &text) {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Authenticated => authenticated = true,
                        FrameOutcome::AuthRejected(reason) => break CloseReason::AuthRejected(reason),
                        FrameOutcome::Stale => {
                            let _ = writer.close().await;
                            return;
                        }
                    }
                }
                Some(Err(e)) => break CloseReason::Error(e),
                None => break CloseReason::Closed,
            }
        }
    };

    let _ = writer.close().await;
    if let Some(shared) = weak.upgrade() {
        shared.connection_closed(generation, reason);
    }
}
