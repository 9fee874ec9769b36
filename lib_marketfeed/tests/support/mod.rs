//! In-memory transport and recording handlers for multiplexer tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::mpsc as fmpsc;
use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use lib_marketfeed::core::{Connector, FeedError, Transport};
use lib_marketfeed::{Multiplexer, MultiplexerConfig, Tick, TickHandler};

pub const API_KEY: &str = "test-key";

/// The server side of one connection attempt.
pub struct MockSession {
    pub from_client: fmpsc::UnboundedReceiver<String>,
    pub to_client: fmpsc::UnboundedSender<Result<String, FeedError>>,
    pub opened_at: Instant,
}

impl MockSession {
    /// Next frame the client wrote, as JSON.
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(1), self.from_client.next())
            .await
            .expect("client sent nothing")
            .expect("client closed the socket");
        serde_json::from_str(&text).expect("client frame is JSON")
    }

    /// Asserts the client writes nothing more for a while.
    pub async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(50), self.from_client.next()).await;
        if let Ok(Some(frame)) = next {
            panic!("unexpected frame {frame}");
        }
    }

    pub fn push(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(text.to_string()))
            .expect("client reader is gone");
    }

    pub fn auth_success(&self) {
        self.push(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#);
    }

    pub fn auth_failed(&self) {
        self.push(r#"[{"ev":"status","status":"auth_failed","message":"authentication failed"}]"#);
    }

    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .unbounded_send(Err(FeedError::Transport(reason.to_string())));
    }
}

/// Hands every opened session to the test.
pub struct MockConnector {
    sessions: mpsc::UnboundedSender<MockSession>,
}

impl Connector for MockConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Transport, FeedError>> {
        let (client_tx, client_rx) = fmpsc::unbounded::<String>();
        let (server_tx, server_rx) = fmpsc::unbounded::<Result<String, FeedError>>();
        let _ = self.sessions.send(MockSession {
            from_client: client_rx,
            to_client: server_tx,
            opened_at: Instant::now(),
        });
        let transport = Transport {
            writer: Box::pin(client_tx.sink_map_err(|e| FeedError::Transport(e.to_string()))),
            reader: server_rx.boxed(),
        };
        Box::pin(future::ready(Ok(transport)))
    }
}

pub fn config() -> MultiplexerConfig {
    let mut config = MultiplexerConfig::for_feed(API_KEY, false);
    config.reconnect.base_delay_ms = 100;
    config.reconnect.max_attempts = 3;
    config
}

pub fn mock_mux(config: MultiplexerConfig) -> (Multiplexer, mpsc::UnboundedReceiver<MockSession>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux = Multiplexer::with_connector(config, Arc::new(MockConnector { sessions: tx }));
    (mux, rx)
}

/// Runs `connect()` against the next session and answers `auth_success`.
pub async fn connect_authenticated(
    mux: &Multiplexer,
    sessions: &mut mpsc::UnboundedReceiver<MockSession>,
) -> MockSession {
    let connecting = mux.clone();
    let pending = tokio::spawn(async move { connecting.connect().await });
    let mut session = sessions.recv().await.expect("no connection attempt");
    assert_eq!(
        session.next_frame().await,
        serde_json::json!({"action": "auth", "params": API_KEY})
    );
    session.auth_success();
    pending.await.expect("connect task panicked").expect("connect failed");
    session
}

/// Lets spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn aggregate(symbol: &str, close: f64) -> String {
    format!(
        r#"{{"ev":"A","sym":"{symbol}","c":{close},"o":1.0,"h":2.0,"l":0.5,"v":100,"vw":1.5,"e":1700000000000,"av":1000}}"#
    )
}

/// Appends `"<name>:<event>"` lines to a shared log.
pub struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: Arc::clone(log),
        })
    }

    fn push(&self, event: String) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
    }
}

impl TickHandler for Recorder {
    fn on_message(&self, tick: &Tick) {
        self.push(format!("tick:{}:{}", tick.ticker, tick.price));
    }

    fn on_error(&self, error: &FeedError) {
        self.push(format!("error:{error}"));
    }

    fn on_connect(&self) {
        self.push("connect".to_string());
    }

    fn on_disconnect(&self) {
        self.push("disconnect".to_string());
    }
}

pub fn new_log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn count(log: &Arc<Mutex<Vec<String>>>, needle: &str) -> usize {
    log.lock().unwrap().iter().filter(|line| line.contains(needle)).count()
}
