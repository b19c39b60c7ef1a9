//! Vendor shapes into canonical [`Bar`] / [`Tick`].

use chrono::{DateTime, Utc};
use feedhub_connectors_binance::{Kline, Trade};
use feedhub_connectors_ibkr::{Contract, HistoricalBar, Ticker};
use feedhub_core::{Bar, Extra, Interval, Side, Tick};
use rust_decimal::Decimal;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("timestamp out of range: {0} ms")]
    Timestamp(i64),
}

/// Converts a vendor bar into a canonical one.
pub trait IntoBar<I> {
    fn into_bar(self, instrument: &I, interval: Interval) -> Result<Bar, NormalizeError>;
}

/// Converts a vendor trade into a canonical tick. `Ok(None)` means the
/// event was not a trade.
pub trait IntoTick<I> {
    fn into_tick(self, instrument: &I) -> Result<Option<Tick>, NormalizeError>;
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::from_timestamp_millis(ms).ok_or(NormalizeError::Timestamp(ms))
}

fn decimal(value: Decimal) -> Value {
    Value::String(value.to_string())
}

impl IntoBar<String> for Kline {
    fn into_bar(self, symbol: &String, interval: Interval) -> Result<Bar, NormalizeError> {
        let mut extra = Extra::new();
        extra.insert("close_time".into(), Value::from(self.close_time));
        extra.insert("taker_buy_base_volume".into(), decimal(self.taker_buy_base_volume));
        extra.insert("taker_buy_quote_volume".into(), decimal(self.taker_buy_quote_volume));

        Ok(Bar {
            exchange: "binance".to_string(),
            symbol: symbol.to_uppercase(),
            interval: interval.code(),
            timestamp: from_millis(self.open_time)?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: Some(self.quote_volume),
            trade_count: Some(self.trade_count),
            extra,
        })
    }
}

impl IntoTick<String> for Trade {
    fn into_tick(self, _symbol: &String) -> Result<Option<Tick>, NormalizeError> {
        let mut extra = Extra::new();
        extra.insert("trade_id".into(), Value::from(self.trade_id));

        // Buyer as maker means the aggressor sold.
        let side = if self.buyer_is_maker { Side::Sell } else { Side::Buy };
        Ok(Some(Tick {
            exchange: "binance".to_string(),
            symbol: self.symbol,
            source: "binance_ws".to_string(),
            timestamp: from_millis(self.trade_time)?,
            price: self.price,
            size: self.quantity,
            side: Some(side),
            extra,
        }))
    }
}

impl IntoBar<Contract> for HistoricalBar {
    fn into_bar(self, contract: &Contract, interval: Interval) -> Result<Bar, NormalizeError> {
        let mut extra = Extra::new();
        if let Some(wap) = self.wap {
            extra.insert("wap".into(), decimal(wap));
        }

        Ok(Bar {
            exchange: contract.exchange.clone(),
            symbol: contract.symbol.clone(),
            interval: interval.code(),
            timestamp: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: None,
            trade_count: self.bar_count,
            extra,
        })
    }
}

impl IntoTick<Contract> for Ticker {
    fn into_tick(self, contract: &Contract) -> Result<Option<Tick>, NormalizeError> {
        let Some(price) = self.last else {
            return Ok(None);
        };

        let mut extra = Extra::new();
        if let Some(bid) = self.bid {
            extra.insert("bid".into(), decimal(bid));
        }
        if let Some(ask) = self.ask {
            extra.insert("ask".into(), decimal(ask));
        }

        Ok(Some(Tick {
            exchange: contract.exchange.clone(),
            symbol: contract.symbol.clone(),
            source: "ibkr".to_string(),
            timestamp: self.time,
            price,
            size: self.last_size.unwrap_or(Decimal::ZERO),
            side: None,
            extra,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn kline() -> Kline {
        Kline {
            open_time: 1_700_000_000_000,
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(12.5),
            close_time: 1_700_000_059_999,
            quote_volume: dec!(1300),
            trade_count: 42,
            taker_buy_base_volume: dec!(6),
            taker_buy_quote_volume: dec!(620),
        }
    }

    #[test]
    fn test_kline_into_bar() {
        let bar = kline().into_bar(&"btcusdt".to_string(), Interval::Minute(1)).unwrap();
        assert_eq!(bar.exchange, "binance");
        assert_eq!(bar.symbol, "BTCUSDT");
        assert_eq!(bar.interval, "1m");
        assert_eq!(bar.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(bar.quote_volume, Some(dec!(1300)));
        assert_eq!(bar.trade_count, Some(42));
        assert_eq!(bar.extra["close_time"], Value::from(1_700_000_059_999i64));
        assert_eq!(bar.extra["taker_buy_quote_volume"], Value::from("620"));
    }

    #[test]
    fn test_trade_side_from_maker_flag() {
        let trade = Trade {
            event_time: 1,
            symbol: "BTCUSDT".into(),
            trade_id: 77,
            price: dec!(65000.1),
            quantity: dec!(0.25),
            trade_time: 1_700_000_000_123,
            buyer_is_maker: true,
        };
        let tick = trade.clone().into_tick(&"BTCUSDT".to_string()).unwrap().unwrap();
        assert_eq!(tick.source, "binance_ws");
        assert_eq!(tick.side, Some(Side::Sell));
        assert_eq!(tick.size, dec!(0.25));
        assert_eq!(tick.extra["trade_id"], Value::from(77));

        let taker_buy = Trade {
            buyer_is_maker: false,
            ..trade
        };
        let tick = taker_buy.into_tick(&"BTCUSDT".to_string()).unwrap().unwrap();
        assert_eq!(tick.side, Some(Side::Buy));
    }

    #[test]
    fn test_kline_bad_timestamp() {
        let bad = Kline {
            open_time: i64::MAX,
            ..kline()
        };
        assert!(matches!(
            bad.into_bar(&"BTCUSDT".to_string(), Interval::Daily),
            Err(NormalizeError::Timestamp(_))
        ));
    }

    #[test]
    fn test_historical_bar_into_bar() {
        let contract = Contract::future("ES", "CME", "USD");
        let bar = HistoricalBar {
            date: Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap(),
            open: dec!(5000),
            high: dec!(5010),
            low: dec!(4995),
            close: dec!(5005.25),
            volume: dec!(1200),
            bar_count: Some(300),
            wap: Some(dec!(5003.5)),
        }
        .into_bar(&contract, Interval::Minute(5))
        .unwrap();

        assert_eq!(bar.exchange, "CME");
        assert_eq!(bar.symbol, "ES");
        assert_eq!(bar.interval, "5m");
        assert_eq!(bar.quote_volume, None);
        assert_eq!(bar.extra["wap"], Value::from("5003.5"));
    }

    #[test]
    fn test_ticker_without_last_is_not_a_trade() {
        let contract = Contract::future("ES", "CME", "USD");
        let ticker = Ticker {
            contract: contract.clone(),
            time: Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap(),
            last: None,
            last_size: None,
            bid: Some(dec!(5000)),
            ask: Some(dec!(5000.25)),
        };
        assert_eq!(ticker.clone().into_tick(&contract).unwrap(), None);

        let traded = Ticker {
            last: Some(dec!(5000.25)),
            last_size: Some(dec!(3)),
            ..ticker
        };
        let tick = traded.into_tick(&contract).unwrap().unwrap();
        assert_eq!(tick.source, "ibkr");
        assert_eq!(tick.price, dec!(5000.25));
        assert_eq!(tick.size, dec!(3));
        assert_eq!(tick.side, None);
        assert_eq!(tick.extra["bid"], Value::from("5000"));
    }
}
