//! # Upstream Wire Protocol
//!
//! JSON frames exchanged with the Polygon stocks WebSocket cluster.
//!
//! Outbound frames are [`Directive`]s (`auth`, `subscribe`, `unsubscribe`).
//! Inbound frames are either a single object or an array of objects; each
//! element is decoded on its own into a [`FeedMessage`], tagged by its `ev`
//! field. Event types this client does not consume decode to
//! [`FeedMessage::Unknown`] and are ignored by the dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Real-time stocks cluster (paid plans).
pub const REALTIME_STOCKS_URL: &str = "wss://socket.polygon.io/stocks";
/// 15-minute delayed stocks cluster.
pub const DELAYED_STOCKS_URL: &str = "wss://delayed.polygon.io/stocks";
/// Per-second aggregates channel.
pub const SECOND_AGGREGATES: &str = "A";
/// Per-minute aggregates channel.
pub const MINUTE_AGGREGATES: &str = "AM";

/// Outbound directive verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Present the API key.
    Auth,
    /// Start streaming a channel.
    Subscribe,
    /// Stop streaming a channel.
    Unsubscribe,
}

/// One outbound control frame: `{"action": "...", "params": "..."}`.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    /// The verb.
    pub action: Action,
    /// The credential for `auth`, `<prefix>.<symbol>` otherwise.
    pub params: String,
}

impl Directive {
    /// Builds the authentication frame.
    pub fn auth(api_key: &str) -> Self {
        Self {
            action: Action::Auth,
            params: api_key.to_string(),
        }
    }

    /// Builds a subscribe frame for `<prefix>.<symbol>`.
    pub fn subscribe(prefix: &str, symbol: &str) -> Self {
        Self {
            action: Action::Subscribe,
            params: channel(prefix, symbol),
        }
    }

    /// Builds an unsubscribe frame for `<prefix>.<symbol>`.
    pub fn unsubscribe(prefix: &str, symbol: &str) -> Self {
        Self {
            action: Action::Unsubscribe,
            params: channel(prefix, symbol),
        }
    }

    /// Serializes the directive into its text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// The auth params carry the API key; keep it out of the logs.
impl fmt::Debug for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = match self.action {
            Action::Auth => "<redacted>",
            _ => self.params.as_str(),
        };
        f.debug_struct("Directive")
            .field("action", &self.action)
            .field("params", &params)
            .finish()
    }
}

/// Joins a channel prefix and a symbol, e.g. `A.AAPL`.
pub fn channel(prefix: &str, symbol: &str) -> String {
    format!("{prefix}.{symbol}")
}

/// An inbound message, discriminated by `ev`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "ev")]
pub enum FeedMessage {
    /// Connection and authentication status.
    #[serde(rename = "status")]
    Status(StatusMessage),
    /// Per-second aggregate bar.
    #[serde(rename = "A")]
    SecondAggregate(AggregateMessage),
    /// Per-minute aggregate bar.
    #[serde(rename = "AM")]
    MinuteAggregate(AggregateMessage),
    /// Any other event type (trades, quotes, ...). Ignored.
    #[serde(other)]
    Unknown,
}

/// Body of a `status` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusMessage {
    /// `connected`, `auth_success`, `auth_failed`, `success`, ...
    pub status: String,
    /// Human readable detail, e.g. `authenticated` or `subscribed to: A.AAPL`.
    #[serde(default)]
    pub message: Option<String>,
}

/// What a status message means for the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// The credential was accepted.
    AuthSuccess,
    /// The credential was rejected.
    AuthFailed,
    /// Informational (`connected`, subscription confirmations, ...).
    Informational,
}

impl StatusMessage {
    /// Classifies the status.
    pub fn kind(&self) -> StatusKind {
        match self.status.as_str() {
            "auth_success" => StatusKind::AuthSuccess,
            "auth_failed" => StatusKind::AuthFailed,
            _ => StatusKind::Informational,
        }
    }
}

/// Body of an aggregate (`A` / `AM`) event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregateMessage {
    /// Ticker symbol.
    pub sym: String,
    /// Close price of the window.
    #[serde(default)]
    pub c: f64,
    /// Open price of the window.
    #[serde(default)]
    pub o: f64,
    /// High of the window.
    #[serde(default)]
    pub h: f64,
    /// Low of the window.
    #[serde(default)]
    pub l: f64,
    /// Volume of the window.
    #[serde(default)]
    pub v: f64,
    /// Volume weighted average price of the window.
    #[serde(default)]
    pub vw: f64,
    /// Window end, Unix milliseconds.
    #[serde(default)]
    pub e: i64,
    /// Accumulated volume for the day.
    #[serde(default)]
    pub av: f64,
}

/// The canonical tick record handed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Ticker symbol.
    pub ticker: String,
    /// Latest (close) price.
    pub price: f64,
    /// Window open.
    pub open: f64,
    /// Window high.
    pub high: f64,
    /// Window low.
    pub low: f64,
    /// Window volume.
    pub volume: f64,
    /// Volume weighted average price.
    pub vwap: f64,
    /// Window end, Unix milliseconds.
    pub timestamp: i64,
    /// Accumulated volume for the day.
    pub accumulated_volume: f64,
}

impl From<AggregateMessage> for Tick {
    fn from(msg: AggregateMessage) -> Self {
        Self {
            ticker: msg.sym,
            price: msg.c,
            open: msg.o,
            high: msg.h,
            low: msg.l,
            volume: msg.v,
            vwap: msg.vw,
            timestamp: msg.e,
            accumulated_volume: msg.av,
        }
    }
}

/// Decodes one inbound text frame.
///
/// Fails only when the frame is not JSON at all. Inside a batch, elements
/// that do not match any known shape are logged and skipped so that their
/// siblings are still delivered.
pub fn parse_frame(text: &str) -> Result<Vec<FeedMessage>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let elements = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut messages = Vec::with_capacity(elements.len());
    for element in elements {
        match serde_json::from_value::<FeedMessage>(element) {
            Ok(message) => messages.push(message),
            Err(e) => log::warn!("Skipping undecodable feed message: {}", e),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_serialize_to_wire_shape() {
        let auth: Value = serde_json::from_str(&Directive::auth("KEY").to_frame().unwrap()).unwrap();
        assert_eq!(auth, serde_json::json!({"action": "auth", "params": "KEY"}));

        let sub: Value =
            serde_json::from_str(&Directive::subscribe("A", "AAPL").to_frame().unwrap()).unwrap();
        assert_eq!(sub, serde_json::json!({"action": "subscribe", "params": "A.AAPL"}));

        let unsub: Value =
            serde_json::from_str(&Directive::unsubscribe("AM", "MSFT").to_frame().unwrap()).unwrap();
        assert_eq!(unsub, serde_json::json!({"action": "unsubscribe", "params": "AM.MSFT"}));
    }

    #[test]
    fn auth_directive_debug_hides_key() {
        let rendered = format!("{:?}", Directive::auth("super-secret"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn single_status_object_is_parsed() {
        let frame = r#"{"ev":"status","status":"auth_success","message":"authenticated"}"#;
        let messages = parse_frame(frame).unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            FeedMessage::Status(status) => {
                assert_eq!(status.kind(), StatusKind::AuthSuccess);
                assert_eq!(status.message.as_deref(), Some("authenticated"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn batch_elements_are_independent() {
        let frame = r#"[
            {"ev":"status","status":"connected","message":"Connected Successfully"},
            {"ev":"A","sym":"AAPL","c":190.5,"o":190.0,"h":191.0,"l":189.5,"v":1200,"vw":190.2,"e":1700000001000,"av":5000000},
            {"ev":"A","c":1.0},
            {"ev":"T","sym":"AAPL","p":190.4,"s":100},
            {"ev":"AM","sym":"MSFT","c":410.0,"o":409.0,"h":411.0,"l":408.0,"v":30000,"vw":410.1,"e":1700000060000,"av":9000000}
        ]"#;
        let messages = parse_frame(frame).unwrap();

        // The aggregate without `sym` is skipped; the trade decodes as Unknown.
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], FeedMessage::Status(_)));
        assert!(matches!(messages[2], FeedMessage::Unknown));

        match messages[1].clone() {
            FeedMessage::SecondAggregate(agg) => {
                let tick = Tick::from(agg);
                assert_eq!(tick.ticker, "AAPL");
                assert_eq!(tick.price, 190.5);
                assert_eq!(tick.open, 190.0);
                assert_eq!(tick.high, 191.0);
                assert_eq!(tick.low, 189.5);
                assert_eq!(tick.volume, 1200.0);
                assert_eq!(tick.vwap, 190.2);
                assert_eq!(tick.timestamp, 1_700_000_001_000);
                assert_eq!(tick.accumulated_volume, 5_000_000.0);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(messages[3], FeedMessage::MinuteAggregate(_)));
    }

    #[test]
    fn non_json_frame_is_an_error() {
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn tick_serializes_with_canonical_field_names() {
        let tick = Tick {
            ticker: "AAPL".into(),
            price: 1.0,
            open: 2.0,
            high: 3.0,
            low: 0.5,
            volume: 10.0,
            vwap: 1.5,
            timestamp: 42,
            accumulated_volume: 100.0,
        };
        let value = serde_json::to_value(&tick).unwrap();
        for field in [
            "ticker",
            "price",
            "open",
            "high",
            "low",
            "volume",
            "vwap",
            "timestamp",
            "accumulated_volume",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
