pub mod db;

use async_trait::async_trait;
use feedhub_core::{Bar, BarKey, DataError, MarketDataSink, Tick, TickKey};
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A PostgreSQL-backed sink.
pub struct PostgresSink {
    pub pool: sqlx::PgPool,
}

impl PostgresSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DataError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| DataError::Database(e.to_string()))?;
        db::run_migrations(&pool)
            .await
            .map_err(|e| DataError::Database(format!("migration failed: {}", e)))?;
        info!(max_connections, "Postgres sink ready");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl MarketDataSink for PostgresSink {
    async fn persist_ohlcv(&self, rows: &[Bar]) -> Result<u64, DataError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let written = db::upsert_bars(&self.pool, rows)
            .await
            .map_err(|e| DataError::Database(e.to_string()))?;
        debug!(written, "bars upserted");
        Ok(written)
    }

    async fn persist_ticks(&self, rows: &[Tick]) -> Result<u64, DataError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let written = db::upsert_ticks(&self.pool, rows)
            .await
            .map_err(|e| DataError::Database(e.to_string()))?;
        debug!(written, "ticks upserted");
        Ok(written)
    }
}

/// In-process sink with the same upsert semantics. Used for dry runs.
#[derive(Default)]
pub struct MemorySink {
    bars: RwLock<BTreeMap<BarKey, Bar>>,
    ticks: RwLock<BTreeMap<TickKey, Tick>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bars in key order.
    pub async fn bars(&self) -> Vec<Bar> {
        self.bars.read().await.values().cloned().collect()
    }

    /// Stored ticks in key order.
    pub async fn ticks(&self) -> Vec<Tick> {
        self.ticks.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl MarketDataSink for MemorySink {
    async fn persist_ohlcv(&self, rows: &[Bar]) -> Result<u64, DataError> {
        let mut bars = self.bars.write().await;
        for bar in rows {
            bars.insert(bar.key(), bar.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn persist_ticks(&self, rows: &[Tick]) -> Result<u64, DataError> {
        let mut ticks = self.ticks.write().await;
        for tick in rows {
            ticks.insert(tick.key(), tick.clone());
        }
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use feedhub_core::Extra;
    use rust_decimal_macros::dec;

    fn bar(minute: u32, close: rust_decimal::Decimal) -> Bar {
        Bar {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close,
            volume: dec!(3),
            quote_volume: None,
            trade_count: Some(12),
            extra: Extra::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_upserts_bars() {
        let sink = MemorySink::new();
        sink.persist_ohlcv(&[bar(0, dec!(101)), bar(1, dec!(102))])
            .await
            .unwrap();
        let written = sink.persist_ohlcv(&[bar(1, dec!(105))]).await.unwrap();

        assert_eq!(written, 1);
        let bars = sink.bars().await;
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(101));
        assert_eq!(bars[1].close, dec!(105));
    }

    #[tokio::test]
    async fn test_memory_sink_keys_ticks_by_source() {
        let sink = MemorySink::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let tick = |source: &str, price| Tick {
            exchange: "CME".into(),
            symbol: "ESZ4".into(),
            source: source.into(),
            timestamp: ts,
            price,
            size: dec!(1),
            side: None,
            extra: Extra::new(),
        };

        sink.persist_ticks(&[tick("ibkr", dec!(4200)), tick("dtc", dec!(4200))])
            .await
            .unwrap();
        sink.persist_ticks(&[tick("ibkr", dec!(4201))]).await.unwrap();

        let ticks = sink.ticks().await;
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks.iter().find(|t| t.source == "ibkr").unwrap().price, dec!(4201));
    }

    #[tokio::test]
    async fn test_memory_sink_empty_is_noop() {
        let sink = MemorySink::new();
        assert_eq!(sink.persist_ohlcv(&[]).await.unwrap(), 0);
        assert_eq!(sink.persist_ticks(&[]).await.unwrap(), 0);
        assert!(sink.bars().await.is_empty());
    }
}
