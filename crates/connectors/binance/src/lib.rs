//! Binance spot market data connector.
//!
//! Historical klines over REST, live trades over the `<symbol>@trade`
//! WebSocket stream.

pub mod feed;
pub mod types;

use async_trait::async_trait;
use feedhub_core::*;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use feed::{FrameStream, TradeFeed, WebSocketFeed};
pub use types::{parse_klines, parse_trade_frame, Kline, Trade};

/// Binance caps `limit` on the klines endpoint.
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Configuration for the Binance connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    pub rest_base: String,
    pub ws_base: String,
    /// Fixed wait before reopening a dropped trade stream.
    pub reconnect_delay_ms: u64,
    /// Calls allowed per `rate_window_secs`.
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub request_timeout_secs: u64,
    /// Trades buffered between the stream task and its consumer.
    pub stream_buffer: usize,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_base: "https://api.binance.com".to_string(),
            ws_base: "wss://stream.binance.com:9443".to_string(),
            reconnect_delay_ms: 5_000,
            rate_limit: 1200,
            rate_window_secs: 60,
            request_timeout_secs: 10,
            stream_buffer: 1024,
        }
    }
}

/// Binance connector. Owns its rate limiter; clones share it.
pub struct BinanceConnector<F: TradeFeed = WebSocketFeed> {
    config: BinanceConfig,
    http: reqwest::Client,
    feed: Arc<F>,
    limiter: Arc<RateLimiter>,
}

impl<F: TradeFeed> Clone for BinanceConnector<F> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            http: self.http.clone(),
            feed: self.feed.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl BinanceConnector<WebSocketFeed> {
    pub fn new(config: BinanceConfig) -> Result<Self, ConnectorError> {
        let feed = WebSocketFeed::new(config.ws_base.clone());
        Self::with_feed(config, feed)
    }
}

impl<F: TradeFeed> BinanceConnector<F> {
    pub fn with_feed(config: BinanceConfig, feed: F) -> Result<Self, ConnectorError> {
        let limiter = RateLimiter::new(
            config.rate_limit,
            Duration::from_secs(config.rate_window_secs),
        )?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConnectorError::Config(e.to_string()))?;
        Ok(Self {
            config,
            http,
            feed: Arc::new(feed),
            limiter: Arc::new(limiter),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn klines_query(symbol: &str, request: &HistoryRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("symbol", symbol.to_uppercase()),
            ("interval", request.interval.code()),
        ];
        if let Some(start) = request.start {
            query.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = request.end {
            query.push(("endTime", end.timestamp_millis().to_string()));
        }
        if let Some(limit) = request.limit {
            query.push(("limit", limit.min(MAX_KLINES_PER_REQUEST).to_string()));
        }
        query
    }
}

#[async_trait]
impl<F: TradeFeed> MarketDataSource for BinanceConnector<F> {
    type Instrument = String;
    type Bar = Kline;
    type Trade = Trade;

    fn venue(&self) -> &'static str {
        "binance"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &String,
        request: &HistoryRequest,
    ) -> Result<Vec<Kline>, ConnectorError> {
        self.limiter.acquire().await;

        let url = format!("{}/api/v3/klines", self.config.rest_base.trim_end_matches('/'));
        let query = Self::klines_query(symbol, request);
        debug!(%symbol, interval = %request.interval, "fetching Binance klines");

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectorError::Http(e.to_string()))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<types::ApiError>(&body) {
                Ok(err) => format!("{} (code {})", err.msg, err.code),
                Err(_) => body,
            };
            return Err(ConnectorError::Vendor(format!("{}: {}", status, detail)));
        }

        parse_klines(&body)
    }

    async fn stream_trades(&self, symbol: &String) -> Result<TradeStream<Trade>, ConnectorError> {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        tokio::spawn(run_trade_stream(
            self.feed.clone(),
            self.limiter.clone(),
            symbol.to_uppercase(),
            Duration::from_millis(self.config.reconnect_delay_ms),
            tx,
        ));
        Ok(rx)
    }
}

enum StreamEnd {
    ConsumerClosed,
    Disconnected,
}

/// Retry-forever policy: any socket error, close, or malformed frame waits
/// `reconnect_delay` and reopens the stream. Only the consumer closing the
/// receiver ends the loop.
async fn run_trade_stream<F: TradeFeed>(
    feed: Arc<F>,
    limiter: Arc<RateLimiter>,
    symbol: String,
    reconnect_delay: Duration,
    tx: mpsc::Sender<Trade>,
) {
    let mut reconnects: u64 = 0;
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            _ = limiter.acquire() => {}
        }

        match feed.open(&symbol).await {
            Ok(frames) => {
                info!(%symbol, reconnects, "Binance trade stream open");
                if let StreamEnd::ConsumerClosed = forward_frames(frames, &symbol, &tx).await {
                    break;
                }
            }
            Err(e) => warn!(%symbol, error = %e, "failed to open Binance trade stream"),
        }

        reconnects += 1;
        tokio::select! {
            _ = tx.closed() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    info!(%symbol, "Binance trade stream closed by consumer");
}

async fn forward_frames(mut frames: FrameStream, symbol: &str, tx: &mpsc::Sender<Trade>) -> StreamEnd {
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return StreamEnd::ConsumerClosed,
            next = frames.next() => next,
        };
        match next {
            None => {
                warn!(%symbol, "Binance trade stream closed by server");
                return StreamEnd::Disconnected;
            }
            Some(Err(e)) => {
                warn!(%symbol, error = %e, "Binance trade stream error");
                return StreamEnd::Disconnected;
            }
            Some(Ok(text)) => match parse_trade_frame(&text) {
                Ok(Some(trade)) => {
                    if tx.send(trade).await.is_err() {
                        return StreamEnd::ConsumerClosed;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%symbol, error = %e, "malformed Binance frame, reconnecting");
                    return StreamEnd::Disconnected;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Script = Vec<Result<String, ConnectorError>>;

    /// Hands out one scripted connection per `open`; each stays open after
    /// its script runs out.
    struct ScriptedFeed {
        scripts: Mutex<VecDeque<Script>>,
        opens: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TradeFeed for ScriptedFeed {
        async fn open(&self, _symbol: &str) -> Result<FrameStream, ConnectorError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(items) => Ok(stream::iter(items).chain(stream::pending()).boxed()),
                None => Err(ConnectorError::WebSocket("no more scripts".into())),
            }
        }
    }

    fn trade_json(id: u64, price: &str) -> String {
        format!(
            r#"{{"e":"trade","E":1,"s":"BTCUSDT","t":{},"p":"{}","q":"1","T":1,"m":false}}"#,
            id, price
        )
    }

    fn connector(scripts: Vec<Script>) -> (BinanceConnector<ScriptedFeed>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let feed = ScriptedFeed {
            scripts: Mutex::new(scripts.into()),
            opens: opens.clone(),
        };
        let config = BinanceConfig {
            reconnect_delay_ms: 50,
            ..Default::default()
        };
        (BinanceConnector::with_feed(config, feed).unwrap(), opens)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_survives_one_error() {
        let (binance, opens) = connector(vec![
            vec![
                Ok(trade_json(1, "100.0")),
                Err(ConnectorError::WebSocket("connection reset".into())),
            ],
            vec![Ok(trade_json(2, "101.0"))],
        ]);

        let mut trades = binance.stream_trades(&"btcusdt".to_string()).await.unwrap();
        assert_eq!(trades.recv().await.unwrap().trade_id, 1);
        assert_eq!(trades.recv().await.unwrap().trade_id, 2);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_triggers_reconnect() {
        let (binance, opens) = connector(vec![
            vec![
                Ok(r#"{"result":null,"id":1}"#.to_string()),
                Ok("garbage".to_string()),
                Ok(trade_json(9, "1.0")),
            ],
            vec![Ok(trade_json(10, "2.0"))],
        ]);

        let mut trades = binance.stream_trades(&"BTCUSDT".to_string()).await.unwrap();
        assert_eq!(trades.recv().await.unwrap().trade_id, 10);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failures_keep_retrying() {
        let (binance, opens) = connector(vec![]);
        let trades = binance.stream_trades(&"BTCUSDT".to_string()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(175)).await;
        assert!(opens.load(Ordering::SeqCst) >= 3);

        drop(trades);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_close = opens.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(opens.load(Ordering::SeqCst), after_close);
    }

    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (base, handle)
    }

    #[tokio::test]
    async fn test_fetch_ohlcv_maps_rows() {
        let body = r#"[[1700000000000,"100.0","110.0","95.0","105.0","12.5",1700000059999,"1300.0",42,"6.0","630.0","0"]]"#;
        let (base, server) = serve_once("200 OK", body).await;
        let binance = BinanceConnector::new(BinanceConfig {
            rest_base: base,
            ..Default::default()
        })
        .unwrap();

        let klines = binance
            .fetch_ohlcv(
                &"btcusdt".to_string(),
                &HistoryRequest::latest(Interval::Minute(1), 5000),
            )
            .await
            .unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].trade_count, 42);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v3/klines?"));
        assert!(request.contains("symbol=BTCUSDT"));
        assert!(request.contains("interval=1m"));
        assert!(request.contains("limit=1000"));
        assert_eq!(binance.limiter().in_window().await, 1);
    }

    #[tokio::test]
    async fn test_fetch_ohlcv_surfaces_vendor_error() {
        let (base, _server) =
            serve_once("400 Bad Request", r#"{"code":-1121,"msg":"Invalid symbol."}"#).await;
        let binance = BinanceConnector::new(BinanceConfig {
            rest_base: base,
            ..Default::default()
        })
        .unwrap();

        match binance
            .fetch_ohlcv(&"NOPE".to_string(), &HistoryRequest::latest(Interval::Hour(1), 10))
            .await
        {
            Err(ConnectorError::Vendor(msg)) => {
                assert!(msg.contains("Invalid symbol."));
                assert!(msg.contains("-1121"));
            }
            other => panic!("expected vendor error, got {:?}", other.map(|k| k.len())),
        }
    }
}
