use feedhub_core::{Bar, Tick};
use sqlx::types::Json;
use sqlx::PgPool;

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Upsert bars on `(exchange, symbol, interval, timestamp)` in one transaction.
pub async fn upsert_bars(pool: &PgPool, bars: &[Bar]) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut count = 0u64;
    for bar in bars {
        let result = sqlx::query(
            "INSERT INTO bars (exchange, symbol, interval, timestamp, open, high, low, close,
                               volume, quote_volume, trade_count, extra)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (exchange, symbol, interval, timestamp) DO UPDATE
             SET open = EXCLUDED.open, high = EXCLUDED.high,
                 low = EXCLUDED.low, close = EXCLUDED.close, volume = EXCLUDED.volume,
                 quote_volume = EXCLUDED.quote_volume, trade_count = EXCLUDED.trade_count,
                 extra = EXCLUDED.extra",
        )
        .bind(&bar.exchange)
        .bind(&bar.symbol)
        .bind(&bar.interval)
        .bind(bar.timestamp)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.quote_volume)
        .bind(bar.trade_count.map(|n| n as i64))
        .bind(Json(&bar.extra))
        .execute(&mut *tx)
        .await?;
        count += result.rows_affected();
    }
    tx.commit().await?;
    Ok(count)
}

/// Upsert ticks on `(exchange, symbol, source, timestamp)` in one transaction.
pub async fn upsert_ticks(pool: &PgPool, ticks: &[Tick]) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut count = 0u64;
    for tick in ticks {
        let result = sqlx::query(
            "INSERT INTO ticks (exchange, symbol, source, timestamp, price, size, side, extra)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (exchange, symbol, source, timestamp) DO UPDATE
             SET price = EXCLUDED.price, size = EXCLUDED.size,
                 side = EXCLUDED.side, extra = EXCLUDED.extra",
        )
        .bind(&tick.exchange)
        .bind(&tick.symbol)
        .bind(&tick.source)
        .bind(tick.timestamp)
        .bind(tick.price)
        .bind(tick.size)
        .bind(tick.side.as_ref().map(|s| s.as_str()))
        .bind(Json(&tick.extra))
        .execute(&mut *tx)
        .await?;
        count += result.rows_affected();
    }
    tx.commit().await?;
    Ok(count)
}
