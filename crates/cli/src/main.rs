use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use feedhub_collector::{Collector, CollectorConfig, Downstream};
use feedhub_connectors_binance::{BinanceConfig, BinanceConnector};
use feedhub_core::{HistoryRequest, Interval, MarketDataSink};
use feedhub_data::{MemorySink, PostgresSink};
use feedhub_dtc::{DtcClient, DtcConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "feedhub")]
#[command(about = "Market data ingestion: Binance history and trades into Postgres, optionally relayed over DTC")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Keep everything in memory instead of writing to Postgres
    #[arg(long)]
    memory: bool,

    #[command(flatten)]
    binance: BinanceArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BinanceArgs {
    /// Binance REST base URL
    #[arg(long, env = "BINANCE_REST_BASE")]
    binance_rest: Option<String>,

    /// Binance WebSocket base URL
    #[arg(long, env = "BINANCE_WS_BASE")]
    binance_ws: Option<String>,
}

#[derive(Args)]
struct DtcArgs {
    /// DTC server host; the relay is disabled when unset
    #[arg(long, env = "DTC_HOST")]
    dtc_host: Option<String>,

    #[arg(long, env = "DTC_PORT", default_value = "11099")]
    dtc_port: u16,

    #[arg(long, env = "DTC_USER", default_value = "")]
    dtc_user: String,

    #[arg(long, env = "DTC_PASSWORD", default_value = "", hide_env_values = true)]
    dtc_password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll history and stream trades until interrupted
    Collect {
        /// Symbols to backfill (e.g. "BTCUSDT,ETHUSDT")
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Bar intervals to backfill for every symbol
        #[arg(short, long, value_delimiter = ',', default_value = "1m")]
        intervals: Vec<Interval>,

        /// Symbols whose trades are streamed
        #[arg(long, value_delimiter = ',')]
        live: Vec<String>,

        /// Seconds between backfill polls
        #[arg(long, default_value = "60")]
        poll_secs: u64,

        /// Bars requested per poll
        #[arg(long, default_value = "500")]
        lookback: u32,

        /// Maximum ticks per write
        #[arg(long, default_value = "500")]
        batch_size: usize,

        #[command(flatten)]
        dtc: DtcArgs,
    },

    /// Fetch one batch of history per symbol and interval, then exit
    Backfill {
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        #[arg(short, long, value_delimiter = ',', default_value = "1m")]
        intervals: Vec<Interval>,

        /// Bars per symbol and interval
        #[arg(long, default_value = "500")]
        lookback: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let binance = binance_connector(&cli.binance)?;

    if cli.memory {
        let sink = Arc::new(MemorySink::new());
        run_command(cli.command, binance, sink.clone()).await?;
        println!(
            "Collected {} bars and {} ticks in memory",
            sink.bars().await.len(),
            sink.ticks().await.len()
        );
    } else {
        let database_url = cli
            .database_url
            .context("DATABASE_URL is required unless --memory is given")?;
        let sink = Arc::new(PostgresSink::connect(&database_url, 5).await?);
        run_command(cli.command, binance, sink).await?;
    }

    Ok(())
}

fn binance_connector(args: &BinanceArgs) -> Result<Arc<BinanceConnector>> {
    let defaults = BinanceConfig::default();
    let config = BinanceConfig {
        rest_base: args.binance_rest.clone().unwrap_or(defaults.rest_base.clone()),
        ws_base: args.binance_ws.clone().unwrap_or(defaults.ws_base.clone()),
        ..defaults
    };
    Ok(Arc::new(BinanceConnector::new(config)?))
}

async fn run_command<S: MarketDataSink + 'static>(
    command: Commands,
    binance: Arc<BinanceConnector>,
    sink: Arc<S>,
) -> Result<()> {
    match command {
        Commands::Collect {
            symbols,
            intervals,
            live,
            poll_secs,
            lookback,
            batch_size,
            dtc,
        } => {
            let config = CollectorConfig {
                backfill: pairs(&symbols, &intervals),
                live,
                poll_interval: Duration::from_secs(poll_secs),
                lookback,
                tick_batch_size: batch_size,
                ..Default::default()
            };
            if config.backfill.is_empty() && config.live.is_empty() {
                anyhow::bail!("nothing to collect: pass --symbols and/or --live");
            }
            collect(binance, sink, config, dtc).await
        }
        Commands::Backfill {
            symbols,
            intervals,
            lookback,
        } => {
            let collector = Collector::new(binance, sink, CollectorConfig::default());
            for (symbol, interval) in pairs(&symbols, &intervals) {
                let request = HistoryRequest::latest(interval, lookback);
                let written = collector.backfill_once(&symbol, &request).await?;
                tracing::info!(symbol = %symbol, interval = %interval, written, "Backfill complete");
                println!("{} {}: {} bars", symbol, interval, written);
            }
            Ok(())
        }
    }
}

fn pairs(symbols: &[String], intervals: &[Interval]) -> Vec<(String, Interval)> {
    symbols
        .iter()
        .flat_map(|s| intervals.iter().map(move |i| (s.to_uppercase(), *i)))
        .collect()
}

async fn collect<S: MarketDataSink + 'static>(
    binance: Arc<BinanceConnector>,
    sink: Arc<S>,
    config: CollectorConfig<String>,
    dtc: DtcArgs,
) -> Result<()> {
    let mut collector = Collector::new(binance, sink, config);

    let relay = dtc.dtc_host.map(|host| {
        Arc::new(DtcClient::new(DtcConfig {
            host,
            port: dtc.dtc_port,
            username: dtc.dtc_user,
            password: dtc.dtc_password,
            ..Default::default()
        }))
    });
    if let Some(client) = &relay {
        tracing::info!(host = %client.config().host, port = client.config().port, "DTC relay enabled");
        collector = collector.with_downstream(client.clone() as Arc<dyn Downstream>);
    }

    let stop = collector.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            stop.stop();
        }
    });

    collector.run().await;

    if let Some(client) = relay {
        client.close().await;
    }
    Ok(())
}
