use anyhow::Context;
use backpocket::analysis::IndicatorEngine;
use backpocket::db::PostgresPersistence;
use backpocket::exchange::{BinanceExchange, ExchangeAdapter};
use backpocket::execution::{CandleBuffer, CandleKey, PositionManager};
use backpocket::ingestion::{Coordinator, Ingestor};
use backpocket::models::{Market, PairKey, Status};
use backpocket::notify::{self, NotificationSender};
use backpocket::persistence::{PersistSender, PersistWriter, RedisCandleCache};
use backpocket::registry::Registries;
use backpocket::settings::{Settings, DEFAULT_CONFIG_FILE};
use backpocket::strategy::OpportunityDetector;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "backpocket")]
#[command(about = "Market streaming, technical analysis and stop-loss automation for Binance")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline (default)
    Run {
        /// Stream and analyze without the account feed or order automation
        #[arg(long)]
        read_only: bool,
    },
    /// Backfill one pair and print its Summary
    Analyze {
        #[arg(long)]
        pair: String,
        #[arg(long, default_value = "1m")]
        interval: String,
    },
    /// List markets, or enable/disable one (a running pipeline picks it up on its next refresh)
    Markets {
        #[arg(long)]
        pair: Option<String>,
        #[arg(long, conflicts_with = "disable", requires = "pair")]
        enable: bool,
        #[arg(long, requires = "pair")]
        disable: bool,
        /// Base asset when adding a new market
        #[arg(long, requires = "quote")]
        base: Option<String>,
        /// Quote asset when adding a new market
        #[arg(long, requires = "base")]
        quote: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load(path, true)?,
        None => Settings::load(&PathBuf::from(DEFAULT_CONFIG_FILE), false)?,
    };

    match cli.command.unwrap_or(Command::Run { read_only: false }) {
        Command::Run { read_only } => run(settings, read_only).await,
        Command::Analyze { pair, interval } => analyze(settings, &pair, &interval).await,
        Command::Markets {
            pair,
            enable,
            disable,
            base,
            quote,
        } => markets(settings, pair, enable, disable, base.zip(quote)).await,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("backpocket=info")),
        )
        .init();
}

async fn connect_to_postgres(settings: &Settings) -> Option<PostgresPersistence> {
    let database_url = settings.database_url.as_deref()?;

    match PostgresPersistence::new(database_url).await {
        Ok(p) => {
            tracing::info!("Postgres persistence enabled");
            Some(p)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            None
        }
    }
}

async fn connect_to_redis(settings: &Settings) -> Option<RedisCandleCache> {
    let redis_url = settings.redis_url.as_deref()?;

    match RedisCandleCache::new(redis_url).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!("Failed to connect to Redis ({}), candle cache disabled", e);
            None
        }
    }
}

/// Fill the registries from Postgres
async fn load_state(db: &PostgresPersistence, registries: &Registries) {
    match db.load_markets().await {
        Ok(markets) => {
            tracing::info!("✓ Loaded {} markets from Postgres", markets.len());
            for market in markets {
                registries.markets.upsert(market);
            }
        }
        Err(e) => tracing::warn!("Failed to load markets from Postgres: {}", e),
    }

    match db.load_orders().await {
        Ok(orders) => {
            tracing::info!("✓ Loaded {} orders from Postgres", orders.len());
            for order in orders {
                registries.orders.upsert(order);
            }
        }
        Err(e) => tracing::warn!("Failed to load orders from Postgres: {}", e),
    }

    match db.load_assets().await {
        Ok(assets) => {
            tracing::info!("✓ Loaded {} assets from Postgres", assets.len());
            for asset in assets {
                registries.assets.upsert(asset);
            }
        }
        Err(e) => tracing::warn!("Failed to load assets from Postgres: {}", e),
    }
}

/// Seed the candle history from Redis, then refresh it over REST
async fn warm_up(
    engine: &IndicatorEngine,
    adapter: &dyn ExchangeAdapter,
    redis: Option<RedisCandleCache>,
    registries: &Registries,
    limit: usize,
) {
    let markets = registries.enabled_markets(adapter.name());

    if let Some(mut cache) = redis {
        for market in &markets {
            let key = market.key();
            for interval in engine.intervals() {
                let candle_key = CandleKey::new(&key, interval);
                match cache.load_candles(&candle_key, limit).await {
                    Ok(candles) if !candles.is_empty() => {
                        if let Err(e) = engine.ingest_history(&key, interval, candles) {
                            tracing::warn!(pair = %key, interval = %interval, error = %e, "Failed to seed history");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(pair = %key, interval = %interval, error = %e, "Failed to load cached candles"),
                }
            }
        }
    }

    for market in &markets {
        let key = market.key();
        let loaded = engine.backfill(adapter, &key, limit).await;
        tracing::info!(pair = %key, "Backfilled {}/{} intervals", loaded, engine.intervals().len());

        if let Err(e) = engine.recompute(&key) {
            tracing::warn!(pair = %key, error = %e, "Initial recompute failed");
        }
    }
}

async fn run(settings: Settings, read_only: bool) -> anyhow::Result<()> {
    tracing::info!("🚀 Backpocket starting");

    if !read_only && !settings.binance.has_credentials() {
        anyhow::bail!(
            "Binance credentials missing: set BACKPOCKET__BINANCE__API_KEY and BACKPOCKET__BINANCE__SECRET_KEY or pass --read-only"
        );
    }

    let registries = Registries::new();
    let postgres = connect_to_postgres(&settings).await;
    let redis = connect_to_redis(&settings).await;

    if let Some(db) = &postgres {
        load_state(db, &registries).await;
    }

    let feeds = &settings.feeds;
    let (persist, persist_rx) = PersistSender::channel(feeds.persist_capacity);
    let (notifier, notify_rx) = NotificationSender::channel(feeds.notification_capacity);
    let (kline_tx, kline_rx) = mpsc::channel(feeds.trigger_capacity.max(1));
    let (book_tx, book_rx) = mpsc::channel(feeds.orderbook_capacity.max(1));
    let (detector_tx, detector_rx) = mpsc::channel(feeds.trigger_capacity.max(1));

    let binance = BinanceExchange::new(settings.binance.clone(), &feeds.kline_interval)
        .context("Failed to create Binance client")?;
    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(binance);

    let engine = IndicatorEngine::new(
        registries.clone(),
        CandleBuffer::new(settings.analysis.history_limit),
        settings.analysis.indicator.clone(),
        settings.tracked_intervals()?,
        &feeds.kline_interval,
    );

    let limit = settings.analysis.history_limit;
    warm_up(&engine, adapter.as_ref(), redis.clone(), &registries, limit).await;

    let detector = OpportunityDetector::new(
        registries.clone(),
        settings.opportunity.clone(),
        notifier.clone(),
        persist.clone(),
    );

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Markets: {}", registries.enabled_markets(adapter.name()).len());
    tracing::info!("  Intervals: {:?}", engine.intervals());
    tracing::info!("  Timeframes: {:?}", settings.opportunity.timeframes);
    tracing::info!("  Automation: {}", if read_only { "off" } else { "on" });

    let market_db = postgres.clone();
    let writer = tokio::spawn(PersistWriter::new(postgres, redis, limit).run(persist_rx));
    let sink = tokio::spawn(notify::run_sink(notify_rx));
    let engine_task = tokio::spawn(engine.clone().run(kline_rx, detector_tx));
    let detector_task = tokio::spawn(detector.run(detector_rx));
    let refresh_task = tokio::spawn(engine.refresh_loop(
        Arc::clone(&adapter),
        Duration::from_secs(settings.analysis.refresh_secs.max(1)),
        limit,
    ));

    let manager_task = if read_only {
        drop(book_rx);
        None
    } else {
        let manager = PositionManager::new(
            Arc::clone(&adapter),
            registries.clone(),
            settings.automation.clone(),
            persist.clone(),
            notifier.clone(),
        );
        Some(tokio::spawn(manager.run(book_rx)))
    };

    let ingestor = Ingestor::new(adapter.name(), registries.clone(), persist.clone(), notifier, kline_tx, book_tx);
    let (coordinator, feed_tasks) = Coordinator::spawn(Arc::clone(&adapter), ingestor, registries, persist, feeds);

    // Feeds stop once the coordinator is dropped
    let market_sync = async {
        match market_db {
            Some(db) => {
                coordinator
                    .sync_loop(db, Duration::from_secs(settings.analysis.refresh_secs.max(1)))
                    .await
            }
            None => {
                tracing::info!("No database, market changes need a restart");
                let _coordinator = coordinator;
                std::future::pending().await
            }
        }
    };

    tracing::info!("✅ All tasks spawned ({} feed tasks)", feed_tasks.len());
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let manager_exit = async {
        match manager_task {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = engine_task => {
            tracing::error!("Indicator engine exited: {:?}", result);
        }
        result = detector_task => {
            tracing::error!("Opportunity detector exited: {:?}", result);
        }
        result = refresh_task => {
            tracing::error!("Refresh loop exited: {:?}", result);
        }
        result = manager_exit => {
            tracing::error!("Position manager exited: {:?}", result);
        }
        result = writer => {
            tracing::error!("Persistence writer exited: {:?}", result);
        }
        result = sink => {
            tracing::error!("Notification sink exited: {:?}", result);
        }
        _ = market_sync => {
            tracing::error!("Market sync exited");
        }
    }

    tracing::info!("👋 Backpocket stopped");
    Ok(())
}

async fn analyze(settings: Settings, pair: &str, interval: &str) -> anyhow::Result<()> {
    let adapter = BinanceExchange::new(settings.binance.clone(), interval)
        .context("Failed to create Binance client")?;
    let registries = Registries::new();
    let engine = IndicatorEngine::new(
        registries,
        CandleBuffer::new(settings.analysis.history_limit),
        settings.analysis.indicator.clone(),
        vec![interval.to_string()],
        interval,
    );

    let key = PairKey::new(pair, adapter.name());
    if engine.backfill(&adapter, &key, settings.analysis.history_limit).await == 0 {
        anyhow::bail!("No klines returned for {} {}", key.pair, interval);
    }

    let analysis = engine
        .recompute(&key)
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .with_context(|| format!("Not enough history to summarize {} {}", key.pair, interval))?;

    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

async fn markets(
    settings: Settings,
    pair: Option<String>,
    enable: bool,
    disable: bool,
    assets: Option<(String, String)>,
) -> anyhow::Result<()> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("database_url is required to manage markets")?;
    let db = PostgresPersistence::new(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Postgres: {}", e))?;
    let exchange = "binance";

    let Some(pair) = pair else {
        let markets = db.load_markets().await.map_err(|e| anyhow::anyhow!("{}", e))?;
        for market in markets {
            println!("{:<12} {:<8} {}", market.pair, market.exchange, market.status.as_str());
        }
        return Ok(());
    };

    let status = if disable { Status::Disabled } else { Status::Enabled };
    if !enable && !disable && assets.is_none() {
        anyhow::bail!("Pass --enable, --disable or --base/--quote for {}", pair);
    }

    let updated = db
        .set_market_status(&pair, exchange, status)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    if !updated {
        let Some((base, quote)) = assets else {
            anyhow::bail!("Unknown market {}; pass --base and --quote to add it", pair);
        };
        let mut market = Market::new(&pair, exchange, &base, &quote);
        market.status = status;
        db.save_market(&market).await.map_err(|e| anyhow::anyhow!("{}", e))?;
        println!("Added {} ({})", market.pair, status.as_str());
        return Ok(());
    }

    println!("{} is now {}", pair.to_uppercase(), status.as_str());
    Ok(())
}
