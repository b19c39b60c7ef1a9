use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedhub_core::ConnectorError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// An IB contract, reduced to the fields this connector needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    /// `STK`, `FUT`, `CASH`, ...
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

/// Identity of a contract when matching ticker events against a request.
pub type ContractKey = (String, String, String);

impl Contract {
    pub fn stock(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: "STK".to_string(),
            exchange: exchange.to_string(),
            currency: currency.to_string(),
        }
    }

    pub fn future(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            sec_type: "FUT".to_string(),
            ..Self::stock(symbol, exchange, currency)
        }
    }

    /// `(symbol, exchange, currency)`, compared exactly.
    pub fn key(&self) -> ContractKey {
        (
            self.symbol.clone(),
            self.exchange.clone(),
            self.currency.clone(),
        )
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.symbol, self.exchange, self.currency)
    }
}

/// Parameters of a historical data request, in IB's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalDataRequest {
    /// `None` means "now".
    pub end_date_time: Option<DateTime<Utc>>,
    /// e.g. `3600 S`, `2 D`, `1 Y`.
    pub duration: String,
    /// e.g. `1 min`, `5 mins`, `1 hour`.
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
}

/// One bar as the vendor hands it back.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBar {
    pub date: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub bar_count: Option<u64>,
    pub wap: Option<Decimal>,
}

/// Live ticker state for a contract, as delivered by a pending-tickers event.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub contract: Contract,
    pub time: DateTime<Utc>,
    pub last: Option<Decimal>,
    pub last_size: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
}

/// The brokerage's asynchronous client.
///
/// Ticker updates are published as batches on a broadcast channel; a
/// closed channel means the vendor's event loop has gone away.
#[async_trait]
pub trait IbApi: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), ConnectorError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    async fn req_historical_data(
        &self,
        contract: &Contract,
        request: &HistoricalDataRequest,
    ) -> Result<Vec<HistoricalBar>, ConnectorError>;

    async fn req_mkt_data(&self, contract: &Contract) -> Result<(), ConnectorError>;

    async fn cancel_mkt_data(&self, contract: &Contract) -> Result<(), ConnectorError>;

    fn pending_tickers(&self) -> broadcast::Receiver<Vec<Ticker>>;
}
