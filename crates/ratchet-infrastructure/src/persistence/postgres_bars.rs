use super::validate_table_name;
use chrono::{DateTime, Utc};
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use ratchet_domain::repositories::bar_store::BarRepository;
use ratchet_domain::value_objects::bar::Bar;
use std::time::Instant;

type PgPool = Pool<PostgresConnectionManager<NoTls>>;

#[derive(Debug, Clone)]
pub struct PostgresBarRepository {
    pool: PgPool,
    pub bars_table: String,
}

impl PostgresBarRepository {
    pub fn new(db_url: &str, bars_table: String, pool_max_size: u32) -> Result<Self, String> {
        if let Err(err) = validate_table_name(&bars_table) {
            return Err(format!("invalid bars_table '{bars_table}': {err}"));
        }

        let config = db_url
            .parse::<postgres::Config>()
            .map_err(|err| format!("invalid postgres db url: {err}"))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_max_size)
            .build(manager)
            .map_err(|err| format!("failed to build postgres pool: {err}"))?;

        Ok(Self { pool, bars_table })
    }

    /// Creates the bar table and its idempotency key if missing.
    pub fn ensure_schema(&self) -> Result<(), String> {
        let mut client = checkout(&self.pool, "ensure_schema")?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
               symbol TEXT NOT NULL, \
               period_label TEXT NOT NULL, \
               period_end TIMESTAMPTZ NOT NULL, \
               open NUMERIC(18,4) NOT NULL, \
               high NUMERIC(18,4) NOT NULL, \
               low NUMERIC(18,4) NOT NULL, \
               close NUMERIC(18,4) NOT NULL, \
               volume BIGINT NOT NULL CHECK (volume >= 0), \
               PRIMARY KEY (symbol, period_label, period_end))",
            table = self.bars_table
        );
        client
            .batch_execute(&ddl)
            .map_err(|err| format!("failed to create bar table {}: {err}", self.bars_table))
    }
}

impl BarRepository for PostgresBarRepository {
    fn insert_bars(&self, bars: &[Bar]) -> Result<usize, String> {
        insert_postgres(&self.pool, &self.bars_table, bars)
    }

    fn load_bars(&self, symbol: &str, period_label: &str, limit: usize) -> Result<Vec<Bar>, String> {
        load_postgres(&self.pool, &self.bars_table, symbol, period_label, limit)
    }
}

fn checkout(
    pool: &PgPool,
    op: &'static str,
) -> Result<r2d2::PooledConnection<PostgresConnectionManager<NoTls>>, String> {
    let get_start = Instant::now();
    match pool.get() {
        Ok(client) => {
            metrics::histogram!("ratchet.infra.postgres.pool.get_ms")
                .record(get_start.elapsed().as_secs_f64() * 1000.0);
            Ok(client)
        }
        Err(err) => {
            metrics::counter!("ratchet.infra.postgres.errors_total", "op" => op, "stage" => "pool_get")
                .increment(1);
            tracing::error!(error = %err, op, "failed to checkout postgres connection");
            Err(format!("failed to checkout postgres connection: {err}"))
        }
    }
}

/// Writes bars in one transaction. Existing keys are left untouched, so a
/// retried boundary never overwrites the first write.
pub fn insert_postgres(pool: &PgPool, table: &str, bars: &[Bar]) -> Result<usize, String> {
    let overall_start = Instant::now();
    let span = tracing::info_span!("infra.postgres.insert_bars", table = %table, bars = bars.len());
    let _enter = span.enter();

    if let Err(err) = validate_table_name(table) {
        metrics::counter!("ratchet.infra.postgres.errors_total", "op" => "insert_bars", "stage" => "validate_table")
            .increment(1);
        tracing::warn!(error = %err, "invalid table name");
        return Err(err);
    }
    if bars.is_empty() {
        return Ok(0);
    }

    let mut client = checkout(pool, "insert_bars")?;
    let mut tx = client.transaction().map_err(|err| {
        metrics::counter!("ratchet.infra.postgres.errors_total", "op" => "insert_bars", "stage" => "begin")
            .increment(1);
        format!("failed to begin transaction: {err}")
    })?;

    // NUMERIC columns are bound through float8 and cast server-side.
    let statement = format!(
        "INSERT INTO {table} (symbol, period_label, period_end, open, high, low, close, volume) \
         VALUES ($1, $2, $3, $4::float8::numeric, $5::float8::numeric, $6::float8::numeric, $7::float8::numeric, $8) \
         ON CONFLICT (symbol, period_label, period_end) DO NOTHING"
    );
    let mut inserted = 0usize;
    for bar in bars {
        let period_end = DateTime::<Utc>::from_timestamp(bar.period_end, 0)
            .ok_or_else(|| format!("bar period_end out of range: {}", bar.period_end))?;
        let rows = tx
            .execute(
                &statement,
                &[
                    &bar.symbol,
                    &bar.period_label,
                    &period_end,
                    &bar.open,
                    &bar.high,
                    &bar.low,
                    &bar.close,
                    &bar.volume,
                ],
            )
            .map_err(|err| {
                metrics::counter!("ratchet.infra.postgres.errors_total", "op" => "insert_bars", "stage" => "execute")
                    .increment(1);
                tracing::error!(error = %err, symbol = %bar.symbol, "failed to insert bar");
                format!("failed to insert bar for {}: {err}", bar.symbol)
            })?;
        inserted += rows as usize;
    }
    tx.commit().map_err(|err| {
        metrics::counter!("ratchet.infra.postgres.errors_total", "op" => "insert_bars", "stage" => "commit")
            .increment(1);
        format!("failed to commit bars: {err}")
    })?;

    metrics::histogram!("ratchet.infra.postgres.insert_bars_ms")
        .record(overall_start.elapsed().as_secs_f64() * 1000.0);
    metrics::counter!("ratchet.infra.postgres.bars_inserted_total").increment(inserted as u64);
    metrics::counter!("ratchet.infra.postgres.bars_duplicate_total")
        .increment((bars.len() - inserted) as u64);
    tracing::debug!(bars = bars.len(), inserted, "inserted bars");
    Ok(inserted)
}

pub fn load_postgres(
    pool: &PgPool,
    table: &str,
    symbol: &str,
    period_label: &str,
    limit: usize,
) -> Result<Vec<Bar>, String> {
    let span = tracing::info_span!(
        "infra.postgres.load_bars",
        table = %table,
        symbol = %symbol,
        period_label = %period_label
    );
    let _enter = span.enter();
    validate_table_name(table)?;

    let mut client = checkout(pool, "load_bars")?;
    let query = format!(
        "SELECT period_end, open::float8, high::float8, low::float8, close::float8, volume FROM {table} \
         WHERE symbol=$1 AND period_label=$2 ORDER BY period_end DESC LIMIT $3"
    );
    let query_start = Instant::now();
    let rows = client
        .query(&query, &[&symbol, &period_label, &(limit as i64)])
        .map_err(|err| {
            metrics::counter!("ratchet.infra.postgres.errors_total", "op" => "load_bars", "stage" => "query")
                .increment(1);
            tracing::error!(error = %err, "failed to query bars");
            format!("failed to query bars: {err}")
        })?;
    metrics::histogram!("ratchet.infra.postgres.query_ms")
        .record(query_start.elapsed().as_secs_f64() * 1000.0);

    Ok(rows
        .into_iter()
        .map(|row| {
            let period_end: DateTime<Utc> = row.get(0);
            Bar {
                symbol: symbol.to_string(),
                period_label: period_label.to_string(),
                period_end: period_end.timestamp(),
                open: row.get(1),
                high: row.get(2),
                low: row.get(3),
                close: row.get(4),
                volume: row.get(5),
            }
        })
        .collect())
}
