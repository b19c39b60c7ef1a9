use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Free-form vendor fields carried alongside canonical records.
pub type Extra = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// Bar aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Second(u32),
    Minute(u32),
    Hour(u32),
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    /// Canonical short code, e.g. `1m`, `4h`, `1d`. Stored in `Bar::interval`.
    pub fn code(&self) -> String {
        match self {
            Interval::Second(n) => format!("{}s", n),
            Interval::Minute(n) => format!("{}m", n),
            Interval::Hour(n) => format!("{}h", n),
            Interval::Daily => "1d".to_string(),
            Interval::Weekly => "1w".to_string(),
            Interval::Monthly => "1M".to_string(),
        }
    }

    /// Nominal length of one bar. Months count as 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            Interval::Second(n) => Duration::from_secs(u64::from(*n)),
            Interval::Minute(n) => Duration::from_secs(u64::from(*n) * 60),
            Interval::Hour(n) => Duration::from_secs(u64::from(*n) * 3_600),
            Interval::Daily => Duration::from_secs(86_400),
            Interval::Weekly => Duration::from_secs(7 * 86_400),
            Interval::Monthly => Duration::from_secs(30 * 86_400),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Error returned when an interval code cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid interval code: {0}")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "1d" => return Ok(Interval::Daily),
            "1w" => return Ok(Interval::Weekly),
            "1M" => return Ok(Interval::Monthly),
            _ => {}
        }

        let err = || ParseIntervalError(s.to_string());
        let (unit_at, _) = s.char_indices().last().ok_or_else(err)?;
        let (count, unit) = s.split_at(unit_at);
        let n: u32 = count.parse().map_err(|_| err())?;
        if n == 0 {
            return Err(err());
        }
        match unit {
            "s" => Ok(Interval::Second(n)),
            "m" => Ok(Interval::Minute(n)),
            "h" => Ok(Interval::Hour(n)),
            _ => Err(err()),
        }
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A single trade event in canonical form.
///
/// Identified by `(exchange, symbol, source, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub exchange: String,
    pub symbol: String,
    /// Which feed produced the tick (e.g. `binance_ws`, `ibkr`).
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Option<Side>,
    #[serde(default)]
    pub extra: Extra,
}

/// Natural key of a [`Tick`].
pub type TickKey = (String, String, String, DateTime<Utc>);

impl Tick {
    pub fn key(&self) -> TickKey {
        (
            self.exchange.clone(),
            self.symbol.clone(),
            self.source.clone(),
            self.timestamp,
        )
    }
}

/// A single OHLCV bar in canonical form.
///
/// Identified by `(exchange, symbol, interval, timestamp)`; the timestamp
/// is the bar open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub exchange: String,
    pub symbol: String,
    pub interval: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Option<Decimal>,
    pub trade_count: Option<u64>,
    #[serde(default)]
    pub extra: Extra,
}

/// Natural key of a [`Bar`].
pub type BarKey = (String, String, String, DateTime<Utc>);

impl Bar {
    pub fn key(&self) -> BarKey {
        (
            self.exchange.clone(),
            self.symbol.clone(),
            self.interval.clone(),
            self.timestamp,
        )
    }
}

// ---------------------------------------------------------------------------
// History request
// ---------------------------------------------------------------------------

/// The range argument of a historical fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub interval: Interval,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Upper bound on rows returned, if the venue supports it.
    pub limit: Option<u32>,
}

impl HistoryRequest {
    /// The most recent `limit` bars up to now.
    pub fn latest(interval: Interval, limit: u32) -> Self {
        Self {
            interval,
            start: None,
            end: None,
            limit: Some(limit),
        }
    }

    /// Wall-clock span covered by the request. Falls back to
    /// `limit * interval`, saturating, when no explicit start is given.
    pub fn span(&self, now: DateTime<Utc>) -> Duration {
        let end = self.end.unwrap_or(now);
        match self.start {
            Some(start) => (end - start).to_std().unwrap_or_default(),
            None => self
                .interval
                .duration()
                .checked_mul(self.limit.unwrap_or(1))
                .unwrap_or(Duration::MAX),
        }
    }
}
