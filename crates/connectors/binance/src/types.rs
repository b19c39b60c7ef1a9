use feedhub_core::ConnectorError;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Raw row of `GET /api/v3/klines`, in Binance's positional order.
type KlineRow = (
    i64,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    i64,
    Decimal,
    u64,
    Decimal,
    Decimal,
    serde_json::Value,
);

/// One kline (candlestick) as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "KlineRow")]
pub struct Kline {
    /// Open time, epoch milliseconds.
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Close time, epoch milliseconds.
    pub close_time: i64,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

impl From<KlineRow> for Kline {
    fn from(row: KlineRow) -> Self {
        Self {
            open_time: row.0,
            open: row.1,
            high: row.2,
            low: row.3,
            close: row.4,
            volume: row.5,
            close_time: row.6,
            quote_volume: row.7,
            trade_count: row.8,
            taker_buy_base_volume: row.9,
            taker_buy_quote_volume: row.10,
        }
    }
}

/// One `<symbol>@trade` stream event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trade {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Trade time, epoch milliseconds.
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// True when the buyer was the resting order, i.e. the taker sold.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// Error body Binance returns with non-2xx statuses.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    pub code: i64,
    pub msg: String,
}

pub fn parse_klines(body: &str) -> Result<Vec<Kline>, ConnectorError> {
    serde_json::from_str(body).map_err(|e| ConnectorError::Decode(format!("klines: {}", e)))
}

/// Decode a stream frame. Subscription acks and non-trade events yield `None`.
pub fn parse_trade_frame(text: &str) -> Result<Option<Trade>, ConnectorError> {
    let mut value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ConnectorError::Decode(format!("trade frame: {}", e)))?;

    // Combined-stream endpoints wrap the payload as {"stream": ..., "data": {...}}.
    if let Some(data) = value.get_mut("data") {
        value = data.take();
    }
    if value.get("result").is_some() {
        return Ok(None);
    }
    match value.get("e").and_then(|e| e.as_str()) {
        Some("trade") => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ConnectorError::Decode(format!("trade frame: {}", e))),
        Some(_) => Ok(None),
        None => Err(ConnectorError::Decode(format!(
            "trade frame without event type: {}",
            text
        ))),
    }
}
