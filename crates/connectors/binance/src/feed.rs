use async_trait::async_trait;
use feedhub_core::ConnectorError;
use futures_util::stream::BoxStream;
use futures_util::{future, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

/// Text frames from one open trade-stream connection.
pub type FrameStream = BoxStream<'static, Result<String, ConnectorError>>;

/// Opens a per-symbol trade stream. A new call means a new connection.
#[async_trait]
pub trait TradeFeed: Send + Sync + 'static {
    async fn open(&self, symbol: &str) -> Result<FrameStream, ConnectorError>;
}

/// Binance `<symbol>@trade` over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketFeed {
    ws_base: String,
}

impl WebSocketFeed {
    pub fn new(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into(),
        }
    }

    pub fn url_for(&self, symbol: &str) -> String {
        format!(
            "{}/ws/{}@trade",
            self.ws_base.trim_end_matches('/'),
            symbol.to_lowercase()
        )
    }
}

#[async_trait]
impl TradeFeed for WebSocketFeed {
    async fn open(&self, symbol: &str) -> Result<FrameStream, ConnectorError> {
        let url = self.url_for(symbol);
        info!(%url, "connecting Binance trade stream");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectorError::WebSocket(e.to_string()))?;

        let frames = ws.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                // Pings are answered by tungstenite; a close frame ends the stream.
                Ok(_) => None,
                Err(e) => Some(Err(ConnectorError::WebSocket(e.to_string()))),
            })
        });
        Ok(frames.boxed())
    }
}
