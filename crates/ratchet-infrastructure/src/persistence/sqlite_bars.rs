use super::validate_table_name;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use ratchet_domain::repositories::bar_store::BarRepository;
use ratchet_domain::value_objects::bar::Bar;
use rusqlite::params;
use std::path::Path;
use std::time::Instant;

/// Bar store for single-host deployments and tests.
#[derive(Clone, Debug)]
pub struct SqliteBarRepository {
    pool: Pool<SqliteConnectionManager>,
    table: String,
}

impl SqliteBarRepository {
    pub fn open(path: &Path, table: String, pool_max_size: u32) -> Result<Self, String> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_max_size.max(1))
            .build(manager)
            .map_err(|err| format!("failed to open sqlite bar store {}: {err}", path.display()))?;
        Self::with_pool(pool, table)
    }

    /// One pooled connection that is never recycled, so every checkout sees
    /// the same database.
    pub fn in_memory(table: String) -> Result<Self, String> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())
            .map_err(|err| format!("failed to open in-memory sqlite: {err}"))?;
        Self::with_pool(pool, table)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>, table: String) -> Result<Self, String> {
        if let Err(err) = validate_table_name(&table) {
            return Err(format!("invalid bars_table '{table}': {err}"));
        }
        if table.contains('.') {
            return Err(format!("sqlite bars_table cannot be schema-qualified: {table}"));
        }
        let repo = Self { pool, table };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn ensure_schema(&self) -> Result<(), String> {
        let conn = self
            .pool
            .get()
            .map_err(|err| format!("failed to checkout sqlite connection: {err}"))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                symbol TEXT NOT NULL,
                period_label TEXT NOT NULL,
                period_end INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL CHECK (volume >= 0),
                PRIMARY KEY (symbol, period_label, period_end)
             );",
            table = self.table
        ))
        .map_err(|err| format!("failed to create bar table {}: {err}", self.table))
    }
}

impl BarRepository for SqliteBarRepository {
    fn insert_bars(&self, bars: &[Bar]) -> Result<usize, String> {
        if bars.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut conn = self.pool.get().map_err(|err| {
            metrics::counter!("ratchet.infra.sqlite.errors_total", "op" => "insert_bars", "stage" => "pool_get")
                .increment(1);
            format!("failed to checkout sqlite connection: {err}")
        })?;
        let tx = conn
            .transaction()
            .map_err(|err| format!("failed to begin transaction: {err}"))?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR IGNORE INTO {} (symbol, period_label, period_end, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    self.table
                ))
                .map_err(|err| format!("failed to prepare bar insert: {err}"))?;
            for bar in bars {
                inserted += stmt
                    .execute(params![
                        bar.symbol,
                        bar.period_label,
                        bar.period_end,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume
                    ])
                    .map_err(|err| {
                        metrics::counter!("ratchet.infra.sqlite.errors_total", "op" => "insert_bars", "stage" => "execute")
                            .increment(1);
                        format!("failed to insert bar for {}: {err}", bar.symbol)
                    })?;
            }
        }
        tx.commit()
            .map_err(|err| format!("failed to commit bars: {err}"))?;

        metrics::histogram!("ratchet.infra.sqlite.insert_bars_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("ratchet.infra.sqlite.bars_inserted_total").increment(inserted as u64);
        tracing::debug!(bars = bars.len(), inserted, table = %self.table, "inserted bars");
        Ok(inserted)
    }

    fn load_bars(&self, symbol: &str, period_label: &str, limit: usize) -> Result<Vec<Bar>, String> {
        let conn = self
            .pool
            .get()
            .map_err(|err| format!("failed to checkout sqlite connection: {err}"))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT period_end, open, high, low, close, volume FROM {}
                 WHERE symbol = ?1 AND period_label = ?2
                 ORDER BY period_end DESC LIMIT ?3",
                self.table
            ))
            .map_err(|err| format!("failed to prepare bar query: {err}"))?;
        let rows = stmt
            .query_map(params![symbol, period_label, limit as i64], |row| {
                Ok(Bar {
                    symbol: symbol.to_string(),
                    period_label: period_label.to_string(),
                    period_end: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            })
            .map_err(|err| format!("failed to query bars: {err}"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("failed to read bar row: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(period_end: i64, close: f64) -> Bar {
        Bar {
            symbol: "INFY".to_string(),
            period_label: "15m".to_string(),
            period_end,
            open: 100.0,
            high: 100.1,
            low: 99.95,
            close,
            volume: 0,
        }
    }

    #[test]
    fn duplicate_keys_keep_the_first_write() {
        let repo = SqliteBarRepository::in_memory("bars_15m".to_string()).expect("repo");
        assert_eq!(repo.insert_bars(&[bar(900, 100.05)]).expect("insert"), 1);
        assert_eq!(
            repo.insert_bars(&[bar(900, 101.0), bar(1800, 100.2)])
                .expect("insert"),
            1
        );

        let bars = repo.load_bars("INFY", "15m", 10).expect("load");
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].period_end, 1800);
        assert_eq!(bars[1].close, 100.05);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bars.sqlite");
        {
            let repo = SqliteBarRepository::open(&path, "bars_15m".to_string(), 2).expect("open");
            repo.insert_bars(&[bar(900, 100.05)]).expect("insert");
        }
        let repo = SqliteBarRepository::open(&path, "bars_15m".to_string(), 2).expect("reopen");
        assert_eq!(repo.load_bars("INFY", "15m", 1).expect("load").len(), 1);
    }

    #[test]
    fn rejects_schema_qualified_tables() {
        let err = SqliteBarRepository::in_memory("market.bars".to_string()).expect_err("schema");
        assert!(err.contains("schema-qualified"));
    }
}
