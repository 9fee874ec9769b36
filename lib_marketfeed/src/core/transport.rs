//! The duplex socket primitive the multiplexer runs on.
//!
//! A [`Transport`] is a text-frame writer plus a text-frame reader. The reader
//! ending (`None`) means the peer closed the connection; an `Err` item means
//! the socket failed. Anything that can produce a `Transport` can drive the
//! multiplexer, which is how tests run it against in-memory channels.

use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Sink, SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use super::error::FeedError;

/// Outbound half: accepts serialized JSON frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = FeedError> + Send>>;
/// Inbound half: yields raw JSON text frames.
pub type FrameStream = BoxStream<'static, Result<String, FeedError>>;

/// An open, unauthenticated connection.
pub struct Transport {
    /// Frames written here are sent to the server in order.
    pub writer: FrameSink,
    /// Frames received from the server, in arrival order.
    pub reader: FrameStream,
}

/// Opens transports. One call per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection to `url`.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, FeedError>>;
}

/// [`Connector`] over `tokio-tungstenite`.
///
/// Ping/pong is answered by tungstenite itself; binary frames are accepted
/// when they hold UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, FeedError>> {
        let url = url.to_string();
        async move {
            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| FeedError::Transport(e.to_string()))?;
            log::info!("WebSocket opened: {}", url);

            let (write, read) = ws_stream.split();

            let writer = write
                .sink_map_err(|e| FeedError::Transport(e.to_string()))
                .with(|text: String| future::ready(Ok::<_, FeedError>(Message::Text(text.into()))));

            let reader = read.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bin)) => String::from_utf8(bin.to_vec()).ok().map(Ok),
                    Ok(Message::Close(frame)) => {
                        log::debug!("Server sent close frame: {:?}", frame);
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(FeedError::Transport(e.to_string()))),
                })
            });

            Ok(Transport {
                writer: Box::pin(writer),
                reader: reader.boxed(),
            })
        }
        .boxed()
    }
}
