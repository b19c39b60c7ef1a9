use crate::models::*;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Unbounded sequence of vendor trades produced by a background task.
///
/// The task runs until the receiver is closed or dropped.
pub type TradeStream<T> = mpsc::Receiver<T>;

// ---------------------------------------------------------------------------
// Market Data Source Trait
// ---------------------------------------------------------------------------

/// Errors that can occur while talking to an upstream venue.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Decode error: {0}")]
    Decode(String),
    /// The venue answered but refused the request (unknown symbol, bad range...).
    #[error("Vendor error: {0}")]
    Vendor(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<crate::rate_limit::RateLimitError> for ConnectorError {
    fn from(e: crate::rate_limit::RateLimitError) -> Self {
        ConnectorError::Config(e.to_string())
    }
}

/// A venue that can serve historical bars and live trades.
///
/// `Bar` and `Trade` are the vendor's native shapes; normalization into
/// [`Bar`](crate::Bar) and [`Tick`](crate::Tick) happens in the collector.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// What the venue addresses: a symbol string, a contract, ...
    type Instrument: Clone + fmt::Display + Send + Sync + 'static;
    type Bar: Send + 'static;
    type Trade: Send + 'static;

    /// Short venue label, e.g. `binance`.
    fn venue(&self) -> &'static str;

    /// Fetch a finite batch of historical bars. Never retried internally.
    async fn fetch_ohlcv(
        &self,
        instrument: &Self::Instrument,
        request: &HistoryRequest,
    ) -> Result<Vec<Self::Bar>, ConnectorError>;

    /// Start streaming trades. The returned stream reconnects on its own and
    /// only ends when the caller closes it.
    async fn stream_trades(
        &self,
        instrument: &Self::Instrument,
    ) -> Result<TradeStream<Self::Trade>, ConnectorError>;
}

// ---------------------------------------------------------------------------
// Market Data Sink Trait
// ---------------------------------------------------------------------------

/// Errors that can occur while persisting data.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Persistence collaborator. Both methods upsert on the natural key, so
/// replaying a batch is harmless. Empty input is a no-op.
#[async_trait]
pub trait MarketDataSink: Send + Sync {
    /// Returns the number of rows written.
    async fn persist_ohlcv(&self, rows: &[Bar]) -> Result<u64, DataError>;

    /// Returns the number of rows written.
    async fn persist_ticks(&self, rows: &[Tick]) -> Result<u64, DataError>;
}
