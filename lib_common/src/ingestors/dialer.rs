//! # Upstream Dialer
//!
//! Opens the upstream WebSocket and exposes it as a boxed `Sink`/`Stream` pair of
//! [`WsFrame`]s. The subscriber only sees this trait, so tests dial in-memory channels instead
//! of the network.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::core::codec::WsFrame;
use crate::core::error::RelayError;

/// Write half of an upstream link.
pub type FrameSink = Pin<Box<dyn Sink<WsFrame, Error = RelayError> + Send>>;
/// Read half of an upstream link.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WsFrame, RelayError>> + Send>>;

/// Establishes upstream transports.
#[async_trait]
pub trait UpstreamDialer: Send + Sync + 'static {
    /// Connects to `endpoint` and completes the WebSocket handshake.
    async fn dial(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), RelayError>;
}

/// Dials with tokio-tungstenite (rustls with the native root store).
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteDialer;

#[async_trait]
impl UpstreamDialer for TungsteniteDialer {
    async fn dial(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), RelayError> {
        let (ws_stream, response) = connect_async(endpoint).await?;
        log::debug!("Upstream handshake completed with status {}", response.status());

        let (write, read) = ws_stream.split();
        let sink = write
            .sink_map_err(|e| RelayError::Transport(e.to_string()))
            .with(|frame: WsFrame| future::ready(Ok::<_, RelayError>(to_message(frame))));
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
            })
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::Text(text.into()),
        WsFrame::Binary(data) => Message::Binary(data.into()),
        WsFrame::Ping(data) => Message::Ping(data.into()),
        WsFrame::Pong(data) => Message::Pong(data.into()),
        WsFrame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<WsFrame> {
    match message {
        Message::Text(text) => Some(WsFrame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(WsFrame::Binary(data.to_vec())),
        Message::Ping(data) => Some(WsFrame::Ping(data.to_vec())),
        Message::Pong(data) => Some(WsFrame::Pong(data.to_vec())),
        Message::Close(_) => Some(WsFrame::Close),
        Message::Frame(_) => None,
    }
}

impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Url(e) => RelayError::Connection(format!("invalid endpoint: {}", e)),
            tungstenite::Error::Http(response) => RelayError::Connection(format!(
                "handshake rejected with status {}",
                response.status()
            )),
            tungstenite::Error::Io(e) => RelayError::Connection(e.to_string()),
            other => RelayError::Transport(other.to_string()),
        }
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::Connection(format!("invalid URL: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_map_onto_tungstenite_messages() {
        assert_eq!(to_message(WsFrame::Text("hi".into())), Message::Text("hi".into()));
        assert_eq!(to_message(WsFrame::Close), Message::Close(None));
        assert_eq!(
            from_message(Message::Pong(vec![1, 2].into())),
            Some(WsFrame::Pong(vec![1, 2]))
        );
        assert_eq!(from_message(Message::Text("x".into())), Some(WsFrame::Text("x".into())));
    }
}
