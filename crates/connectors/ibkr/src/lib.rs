//! Interactive Brokers connector over an injected [`IbApi`] client.

pub mod api;

use async_trait::async_trait;
use feedhub_core::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub use api::{Contract, ContractKey, HistoricalBar, HistoricalDataRequest, IbApi, Ticker};

/// Configuration for the IBKR connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbkrConfig {
    pub reconnect_delay_ms: u64,
    /// Messages allowed per `rate_window_secs`; IB paces clients at 50/s.
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub what_to_show: String,
    /// Regular trading hours only.
    pub use_rth: bool,
    pub stream_buffer: usize,
}

impl Default for IbkrConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            rate_limit: 45,
            rate_window_secs: 1,
            what_to_show: "TRADES".to_string(),
            use_rth: false,
            stream_buffer: 1024,
        }
    }
}

/// IB bar size setting for an interval.
pub fn bar_size(interval: Interval) -> String {
    fn plural(n: u32, unit: &str) -> String {
        if n == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", n, unit)
        }
    }
    match interval {
        Interval::Second(n) => format!("{} secs", n),
        Interval::Minute(n) => {
            if n == 1 {
                "1 min".to_string()
            } else {
                format!("{} mins", n)
            }
        }
        Interval::Hour(n) => plural(n, "hour"),
        Interval::Daily => "1 day".to_string(),
        Interval::Weekly => "1 week".to_string(),
        Interval::Monthly => "1 month".to_string(),
    }
}

/// IB duration string covering `span`: seconds up to a day, then days,
/// then whole years.
pub fn duration_str(span: Duration) -> String {
    const DAY: u64 = 86_400;
    let secs = span.as_secs().max(1);
    if secs <= DAY {
        return format!("{} S", secs);
    }
    let days = secs.div_ceil(DAY);
    if days <= 365 {
        format!("{} D", days)
    } else {
        format!("{} Y", days.div_ceil(365))
    }
}

struct Inner<A: IbApi> {
    api: Arc<A>,
    config: IbkrConfig,
    limiter: RateLimiter,
    connect_lock: Mutex<()>,
}

enum SessionEnd {
    ConsumerClosed,
    Retry,
}

impl<A: IbApi> Inner<A> {
    /// Connect unless already connected. Serialized so concurrent callers
    /// never dial twice.
    async fn ensure_connected(&self) -> Result<(), ConnectorError> {
        let _guard = self.connect_lock.lock().await;
        if self.api.is_connected() {
            return Ok(());
        }
        self.limiter.acquire().await;
        info!("Connecting to IBKR");
        self.api.connect().await
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_delay_ms)
    }

    async fn stream_session(&self, contract: &Contract, tx: &mpsc::Sender<Ticker>) -> SessionEnd {
        if let Err(e) = self.ensure_connected().await {
            warn!(%contract, error = %e, "IBKR connect failed");
            return SessionEnd::Retry;
        }

        let mut events = self.api.pending_tickers();
        self.limiter.acquire().await;
        if let Err(e) = self.api.req_mkt_data(contract).await {
            warn!(%contract, error = %e, "IBKR market data request failed");
            return SessionEnd::Retry;
        }
        info!(%contract, "IBKR market data streaming");

        let key = contract.key();
        loop {
            let batch = tokio::select! {
                _ = tx.closed() => return SessionEnd::ConsumerClosed,
                batch = events.recv() => batch,
            };
            match batch {
                Ok(tickers) => {
                    for ticker in tickers.into_iter().filter(|t| t.contract.key() == key) {
                        if tx.send(ticker).await.is_err() {
                            return SessionEnd::ConsumerClosed;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%contract, skipped, "IBKR ticker events lagged");
                }
                Err(RecvError::Closed) => {
                    warn!(%contract, "IBKR ticker events ended");
                    return SessionEnd::Retry;
                }
            }
        }
    }

    async fn cancel_quietly(&self, contract: &Contract) {
        self.limiter.acquire().await;
        if let Err(e) = self.api.cancel_mkt_data(contract).await {
            debug!(%contract, error = %e, "IBKR market data cancel failed");
        }
    }
}

/// Retry-forever policy: request failure, exhausted events, or any error
/// disconnects and tries again after `reconnect_delay`. Every session exit
/// cancels the market data request.
async fn run_ticker_stream<A: IbApi>(inner: Arc<Inner<A>>, contract: Contract, tx: mpsc::Sender<Ticker>) {
    loop {
        let end = inner.stream_session(&contract, &tx).await;
        inner.cancel_quietly(&contract).await;

        if let SessionEnd::ConsumerClosed = end {
            break;
        }
        inner.api.disconnect().await;
        tokio::select! {
            _ = tx.closed() => break,
            _ = tokio::time::sleep(inner.reconnect_delay()) => {}
        }
    }
    info!(%contract, "IBKR ticker stream closed by consumer");
}

/// IBKR connector. Owns its rate limiter; clones share it.
pub struct IbkrConnector<A: IbApi> {
    inner: Arc<Inner<A>>,
}

impl<A: IbApi> Clone for IbkrConnector<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: IbApi> IbkrConnector<A> {
    pub fn new(api: Arc<A>, config: IbkrConfig) -> Result<Self, ConnectorError> {
        let limiter = RateLimiter::new(
            config.rate_limit,
            Duration::from_secs(config.rate_window_secs),
        )?;
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                config,
                limiter,
                connect_lock: Mutex::new(()),
            }),
        })
    }

    pub async fn ensure_connected(&self) -> Result<(), ConnectorError> {
        self.inner.ensure_connected().await
    }

    fn historical_request(&self, request: &HistoryRequest) -> HistoricalDataRequest {
        HistoricalDataRequest {
            end_date_time: request.end,
            duration: duration_str(request.span(chrono::Utc::now())),
            bar_size: bar_size(request.interval),
            what_to_show: self.inner.config.what_to_show.clone(),
            use_rth: self.inner.config.use_rth,
        }
    }
}

#[async_trait]
impl<A: IbApi> MarketDataSource for IbkrConnector<A> {
    type Instrument = Contract;
    type Bar = HistoricalBar;
    type Trade = Ticker;

    fn venue(&self) -> &'static str {
        "ibkr"
    }

    async fn fetch_ohlcv(
        &self,
        contract: &Contract,
        request: &HistoryRequest,
    ) -> Result<Vec<HistoricalBar>, ConnectorError> {
        self.inner.ensure_connected().await?;
        self.inner.limiter.acquire().await;

        let hist = self.historical_request(request);
        debug!(%contract, duration = %hist.duration, bar_size = %hist.bar_size, "requesting IBKR history");
        let mut bars = self.inner.api.req_historical_data(contract, &hist).await?;

        // IB has no row limit; keep the most recent rows.
        if let Some(limit) = request.limit {
            let limit = limit as usize;
            if bars.len() > limit {
                bars.drain(..bars.len() - limit);
            }
        }
        Ok(bars)
    }

    async fn stream_trades(&self, contract: &Contract) -> Result<TradeStream<Ticker>, ConnectorError> {
        let (tx, rx) = mpsc::channel(self.inner.config.stream_buffer.max(1));
        tokio::spawn(run_ticker_stream(self.inner.clone(), contract.clone(), tx));
        Ok(rx)
    }
}
