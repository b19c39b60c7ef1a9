//! Ingestion orchestration: backfill loops, trade stream loops, and the
//! best-effort downstream fan-out.

pub mod normalize;

use async_trait::async_trait;
use feedhub_core::*;
use feedhub_dtc::{DtcClient, DtcError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use normalize::{IntoBar, IntoTick, NormalizeError};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Sink(#[from] DataError),
}

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error(transparent)]
    Dtc(#[from] DtcError),
    #[error("{0}")]
    Other(String),
}

/// Where freshly persisted ticks are forwarded.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn publish_ticks(&self, ticks: &[Tick]) -> Result<(), DownstreamError>;
}

#[async_trait]
impl Downstream for DtcClient {
    async fn publish_ticks(&self, ticks: &[Tick]) -> Result<(), DownstreamError> {
        DtcClient::publish_ticks(self, ticks).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig<I> {
    /// `(instrument, interval)` pairs polled for history.
    pub backfill: Vec<(I, Interval)>,
    /// Instruments whose trades are streamed.
    pub live: Vec<I>,
    pub poll_interval: Duration,
    /// Bars requested per poll.
    pub lookback: u32,
    /// Upper bound on ticks persisted per write.
    pub tick_batch_size: usize,
    pub stream_restart_delay: Duration,
}

impl<I> Default for CollectorConfig<I> {
    fn default() -> Self {
        Self {
            backfill: Vec::new(),
            live: Vec::new(),
            poll_interval: Duration::from_secs(60),
            lookback: 500,
            tick_batch_size: 500,
            stream_restart_delay: Duration::from_secs(5),
        }
    }
}

/// Cooperative stop flag shared by every loop of a collector.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once the flag is set, or once the signal is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Sleep for `delay` unless stopped first. Returns true when stopped.
async fn pause(rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = stopped(rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

pub struct Collector<C: MarketDataSource, S: MarketDataSink> {
    source: Arc<C>,
    sink: Arc<S>,
    downstream: Option<Arc<dyn Downstream>>,
    config: Arc<CollectorConfig<C::Instrument>>,
    stop: StopSignal,
}

impl<C: MarketDataSource, S: MarketDataSink> Clone for Collector<C, S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            sink: self.sink.clone(),
            downstream: self.downstream.clone(),
            config: self.config.clone(),
            stop: self.stop.clone(),
        }
    }
}

impl<C: MarketDataSource, S: MarketDataSink> Collector<C, S> {
    pub fn new(source: Arc<C>, sink: Arc<S>, config: CollectorConfig<C::Instrument>) -> Self {
        Self {
            source,
            sink,
            downstream: None,
            config: Arc::new(config),
            stop: StopSignal::new(),
        }
    }

    pub fn with_downstream(mut self, downstream: Arc<dyn Downstream>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask every loop to finish at its next wait point.
    pub fn stop(&self) {
        info!("collector stop requested");
        self.stop.stop();
    }

    /// Write bars to the sink. Empty input makes no sink call.
    pub async fn persist_bars(&self, bars: &[Bar]) -> Result<u64, DataError> {
        if bars.is_empty() {
            return Ok(0);
        }
        self.sink.persist_ohlcv(bars).await
    }

    /// Write ticks to the sink. Empty input makes no sink call.
    pub async fn persist_ticks(&self, ticks: &[Tick]) -> Result<u64, DataError> {
        if ticks.is_empty() {
            return Ok(0);
        }
        self.sink.persist_ticks(ticks).await
    }

    /// Persist a batch, then forward it downstream.
    ///
    /// A failed persist is retried once with the same batch; the sink upserts,
    /// so a partial first write is harmless. After a second failure the batch
    /// is dropped and never forwarded. Downstream failures are logged only.
    async fn ingest_ticks(&self, ticks: &[Tick]) {
        if ticks.is_empty() {
            return;
        }
        let persisted = match self.persist_ticks(ticks).await {
            Err(e) => {
                warn!(error = %e, count = ticks.len(), "tick persist failed, retrying once");
                self.persist_ticks(ticks).await
            }
            ok => ok,
        };
        match persisted {
            Ok(written) => debug!(written, "ticks persisted"),
            Err(e) => {
                error!(error = %e, count = ticks.len(), "tick persist failed twice, dropping batch");
                return;
            }
        }
        if let Some(downstream) = &self.downstream {
            if let Err(e) = downstream.publish_ticks(ticks).await {
                warn!(error = %e, count = ticks.len(), "downstream publish failed");
            }
        }
    }
}

impl<C, S> Collector<C, S>
where
    C: MarketDataSource + 'static,
    S: MarketDataSink + 'static,
    C::Bar: IntoBar<C::Instrument>,
    C::Trade: IntoTick<C::Instrument>,
{
    /// Run every configured loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let mut tasks = JoinSet::new();
        for (instrument, interval) in self.config.backfill.iter().cloned() {
            let this = self.clone();
            tasks.spawn(async move { this.backfill_loop(instrument, interval).await });
        }
        for instrument in self.config.live.iter().cloned() {
            let this = self.clone();
            tasks.spawn(async move { this.stream_loop(instrument).await });
        }
        info!(
            venue = self.source.venue(),
            backfill = self.config.backfill.len(),
            live = self.config.live.len(),
            "collector started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "collector task failed");
            }
        }
        info!(venue = self.source.venue(), "collector stopped");
    }

    /// One fetch-normalize-persist pass.
    pub async fn backfill_once(
        &self,
        instrument: &C::Instrument,
        request: &HistoryRequest,
    ) -> Result<u64, CollectorError> {
        let rows = self.source.fetch_ohlcv(instrument, request).await?;
        let fetched = rows.len();
        let bars: Vec<Bar> = rows
            .into_iter()
            .filter_map(|row| match row.into_bar(instrument, request.interval) {
                Ok(bar) => Some(bar),
                Err(e) => {
                    warn!(%instrument, error = %e, "skipping bar");
                    None
                }
            })
            .collect();
        let written = self.persist_bars(&bars).await?;
        debug!(%instrument, interval = %request.interval, fetched, written, "backfill pass");
        Ok(written)
    }

    async fn backfill_loop(&self, instrument: C::Instrument, interval: Interval) {
        let mut stop = self.stop.subscribe();
        let request = HistoryRequest::latest(interval, self.config.lookback);
        info!(%instrument, %interval, "backfill loop started");

        while !self.stop.is_stopped() {
            if let Err(e) = self.backfill_once(&instrument, &request).await {
                warn!(%instrument, %interval, error = %e, "backfill failed");
            }
            if pause(&mut stop, self.config.poll_interval).await {
                break;
            }
        }
        info!(%instrument, %interval, "backfill loop stopped");
    }

    async fn stream_loop(&self, instrument: C::Instrument) {
        let mut stop = self.stop.subscribe();
        let batch_size = self.config.tick_batch_size.max(1);
        info!(%instrument, "stream loop started");

        'session: while !self.stop.is_stopped() {
            let mut trades = match self.source.stream_trades(&instrument).await {
                Ok(trades) => trades,
                Err(e) => {
                    warn!(%instrument, error = %e, "could not open trade stream");
                    if pause(&mut stop, self.config.stream_restart_delay).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let first = tokio::select! {
                    _ = stopped(&mut stop) => break 'session,
                    trade = trades.recv() => trade,
                };
                let Some(first) = first else {
                    warn!(%instrument, "trade stream ended");
                    break;
                };

                let mut batch = vec![first];
                while batch.len() < batch_size {
                    match trades.try_recv() {
                        Ok(trade) => batch.push(trade),
                        Err(_) => break,
                    }
                }

                let ticks: Vec<Tick> = batch
                    .into_iter()
                    .filter_map(|trade| match trade.into_tick(&instrument) {
                        Ok(tick) => tick,
                        Err(e) => {
                            warn!(%instrument, error = %e, "skipping trade");
                            None
                        }
                    })
                    .collect();
                self.ingest_ticks(&ticks).await;
            }

            if pause(&mut stop, self.config.stream_restart_delay).await {
                break;
            }
        }
        info!(%instrument, "stream loop stopped");
    }
}
