use crate::models::{Asset, Market, Opportunity, Order, OrderStatus, Side, Status};
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

/// f64 -> NUMERIC, NaN and infinities stored as zero
fn to_numeric(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

fn from_numeric(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn numeric(row: &PgRow, column: &str) -> f64 {
    from_numeric(row.get(column))
}

/// Postgres mirror of markets, orders, assets and opportunities
///
/// In-memory registries stay authoritative; this is only read at startup.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Connect to Postgres
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    pub async fn save_market(&self, market: &Market) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO markets (
                pair, exchange, base_asset, quote_asset, status,
                open, high, low, close, volume, quote_volume,
                last_price, price, upper_band, middle_band, lower_band,
                rsi, num_of_trades
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (pair, exchange) DO UPDATE SET
                base_asset = EXCLUDED.base_asset,
                quote_asset = EXCLUDED.quote_asset,
                status = EXCLUDED.status,
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                quote_volume = EXCLUDED.quote_volume,
                last_price = EXCLUDED.last_price,
                price = EXCLUDED.price,
                upper_band = EXCLUDED.upper_band,
                middle_band = EXCLUDED.middle_band,
                lower_band = EXCLUDED.lower_band,
                rsi = EXCLUDED.rsi,
                num_of_trades = EXCLUDED.num_of_trades,
                updated_at = NOW()
            "#,
        )
        .bind(&market.pair)
        .bind(&market.exchange)
        .bind(&market.base_asset)
        .bind(&market.quote_asset)
        .bind(market.status.as_str())
        .bind(to_numeric(market.open))
        .bind(to_numeric(market.high))
        .bind(to_numeric(market.low))
        .bind(to_numeric(market.close))
        .bind(to_numeric(market.volume))
        .bind(to_numeric(market.quote_volume))
        .bind(to_numeric(market.last_price))
        .bind(to_numeric(market.price))
        .bind(to_numeric(market.upper_band))
        .bind(to_numeric(market.middle_band))
        .bind(to_numeric(market.lower_band))
        .bind(to_numeric(market.rsi))
        .bind(market.num_of_trades as i64)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved market {}-{} to Postgres", market.pair, market.exchange);

        Ok(())
    }

    pub async fn load_markets(&self) -> Result<Vec<Market>> {
        let rows = sqlx::query(
            r#"
            SELECT pair, exchange, base_asset, quote_asset, status,
                   open, high, low, close, volume, quote_volume,
                   last_price, price, upper_band, middle_band, lower_band,
                   rsi, num_of_trades
            FROM markets
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let markets: Vec<Market> = rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                let num_of_trades: i64 = row.get("num_of_trades");
                Market {
                    pair: row.get("pair"),
                    exchange: row.get("exchange"),
                    base_asset: row.get("base_asset"),
                    quote_asset: row.get("quote_asset"),
                    status: Status::parse(&status),
                    open: numeric(row, "open"),
                    high: numeric(row, "high"),
                    low: numeric(row, "low"),
                    close: numeric(row, "close"),
                    volume: numeric(row, "volume"),
                    quote_volume: numeric(row, "quote_volume"),
                    last_price: numeric(row, "last_price"),
                    price: numeric(row, "price"),
                    upper_band: numeric(row, "upper_band"),
                    middle_band: numeric(row, "middle_band"),
                    lower_band: numeric(row, "lower_band"),
                    rsi: numeric(row, "rsi"),
                    num_of_trades: num_of_trades.max(0) as u64,
                    closed: false,
                }
            })
            .collect();

        tracing::info!("Loaded {} markets from Postgres", markets.len());

        Ok(markets)
    }

    /// Flip a market's status; returns `false` when the market is unknown
    pub async fn set_market_status(&self, pair: &str, exchange: &str, status: Status) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE markets
            SET status = $3, updated_at = NOW()
            WHERE pair = $1 AND exchange = $2
            "#,
        )
        .bind(pair.to_uppercase())
        .bind(exchange.to_lowercase())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn save_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, exchange, pair, side, status, price, quantity, total,
                stoploss, takeprofit, ref_enabled, ref_side, ref_tripped,
                ref_order_id, auto_repeat, auto_repeat_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (order_id, exchange) DO UPDATE SET
                status = EXCLUDED.status,
                price = EXCLUDED.price,
                quantity = EXCLUDED.quantity,
                total = EXCLUDED.total,
                stoploss = EXCLUDED.stoploss,
                takeprofit = EXCLUDED.takeprofit,
                ref_enabled = EXCLUDED.ref_enabled,
                ref_side = EXCLUDED.ref_side,
                ref_tripped = EXCLUDED.ref_tripped,
                ref_order_id = EXCLUDED.ref_order_id,
                auto_repeat = EXCLUDED.auto_repeat,
                auto_repeat_id = EXCLUDED.auto_repeat_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(order.order_id as i64)
        .bind(&order.exchange)
        .bind(&order.pair)
        .bind(order.side.as_str())
        .bind(order.status.as_str())
        .bind(to_numeric(order.price))
        .bind(to_numeric(order.quantity))
        .bind(to_numeric(order.total))
        .bind(to_numeric(order.stoploss))
        .bind(to_numeric(order.takeprofit))
        .bind(order.ref_enabled)
        .bind(order.ref_side.map(Side::as_str))
        .bind(order.ref_tripped.as_deref())
        .bind(order.ref_order_id as i64)
        .bind(order.auto_repeat as i32)
        .bind(order.auto_repeat_id as i64)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved order {} ({}) to Postgres", order.order_id, order.exchange);

        Ok(())
    }

    pub async fn load_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, exchange, pair, side, status, price, quantity, total,
                   stoploss, takeprofit, ref_enabled, ref_side, ref_tripped,
                   ref_order_id, auto_repeat, auto_repeat_id, created_at, updated_at
            FROM orders
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut orders = Vec::with_capacity(rows.len());

        for row in rows {
            let order_id: i64 = row.get("order_id");
            let side_str: String = row.get("side");
            let status_str: String = row.get("status");
            let ref_side: Option<String> = row.get("ref_side");
            let ref_order_id: i64 = row.get("ref_order_id");
            let auto_repeat: i32 = row.get("auto_repeat");
            let auto_repeat_id: i64 = row.get("auto_repeat_id");
            let created_at: DateTime<Utc> = row.get("created_at");
            let updated_at: DateTime<Utc> = row.get("updated_at");

            let side = Side::parse(&side_str).ok_or("Invalid order side")?;
            let status = OrderStatus::parse(&status_str).ok_or("Invalid order status")?;

            orders.push(Order {
                order_id: order_id as u64,
                pair: row.get("pair"),
                exchange: row.get("exchange"),
                side,
                status,
                price: numeric(&row, "price"),
                quantity: numeric(&row, "quantity"),
                total: numeric(&row, "total"),
                stoploss: numeric(&row, "stoploss"),
                takeprofit: numeric(&row, "takeprofit"),
                ref_enabled: row.get("ref_enabled"),
                ref_side: ref_side.as_deref().and_then(Side::parse),
                ref_tripped: row.get("ref_tripped"),
                ref_order_id: ref_order_id as u64,
                auto_repeat: auto_repeat.max(0) as u32,
                auto_repeat_id: auto_repeat_id as u64,
                created_at,
                updated_at,
            });
        }

        tracing::info!("Loaded {} orders from Postgres", orders.len());

        Ok(orders)
    }

    pub async fn save_asset(&self, asset: &Asset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assets (symbol, exchange, free, locked, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (symbol, exchange) DO UPDATE SET
                free = EXCLUDED.free,
                locked = EXCLUDED.locked,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(&asset.symbol)
        .bind(&asset.exchange)
        .bind(to_numeric(asset.free))
        .bind(to_numeric(asset.locked))
        .bind(asset.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_assets(&self) -> Result<Vec<Asset>> {
        let rows = sqlx::query("SELECT symbol, exchange, free, locked, status FROM assets")
            .fetch_all(&self.pool)
            .await?;

        let assets: Vec<Asset> = rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                Asset {
                    symbol: row.get("symbol"),
                    exchange: row.get("exchange"),
                    free: numeric(row, "free"),
                    locked: numeric(row, "locked"),
                    status: Status::parse(&status),
                }
            })
            .collect();

        tracing::info!("Loaded {} assets from Postgres", assets.len());

        Ok(assets)
    }

    /// Append a fired opportunity to the audit trail
    pub async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<()> {
        let analysis = serde_json::to_string(&opportunity.analysis)?;

        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, pair, exchange, timeframe, action, price, stoploss, takeprofit, analysis, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(opportunity.id)
        .bind(&opportunity.pair)
        .bind(&opportunity.exchange)
        .bind(&opportunity.timeframe)
        .bind(opportunity.action.map(Side::as_str))
        .bind(to_numeric(opportunity.price))
        .bind(to_numeric(opportunity.stoploss))
        .bind(to_numeric(opportunity.takeprofit))
        .bind(analysis)
        .bind(opportunity.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved {} opportunity for {}-{} to Postgres",
            opportunity.timeframe,
            opportunity.pair,
            opportunity.exchange
        );

        Ok(())
    }

    #[cfg(test)]
    pub async fn count_opportunities(&self, pair: &str, exchange: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM opportunities WHERE pair = $1 AND exchange = $2")
            .bind(pair)
            .bind(exchange)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("count"))
    }

    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<()> {
        for table in ["markets", "orders", "assets", "opportunities"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }
}
