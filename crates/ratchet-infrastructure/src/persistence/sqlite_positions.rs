use parking_lot::Mutex;
use ratchet_domain::repositories::position_store::{LedgerEvent, PositionRepository};
use ratchet_domain::value_objects::position::{Position, PositionStatus};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS positions (
    trade_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    slot INTEGER NOT NULL,
    entry_price REAL,
    quantity INTEGER NOT NULL,
    stop_price REAL,
    target_price REAL,
    stop_fraction REAL NOT NULL,
    target_fraction REAL,
    broker_order_id TEXT,
    protective_order_id TEXT,
    status TEXT NOT NULL,
    opened_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    closed_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS positions_live_slot
    ON positions(symbol, slot) WHERE status NOT LIKE 'CLOSED%';
CREATE INDEX IF NOT EXISTS positions_status ON positions(status);
CREATE TABLE IF NOT EXISTS position_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    at INTEGER NOT NULL,
    detail TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS position_events_trade ON position_events(trade_id);
";

const COLUMNS: &str = "trade_id, symbol, slot, entry_price, quantity, stop_price, target_price, \
    stop_fraction, target_fraction, broker_order_id, protective_order_id, status, opened_at, \
    updated_at, closed_at";

/// Durable ledger store. Every save writes the row and its journal event in
/// one transaction; a partial unique index keeps one live position per slot.
pub struct SqlitePositionRepository {
    conn: Mutex<Connection>,
}

impl SqlitePositionRepository {
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create ledger dir {}: {err}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| format!("failed to open ledger {}: {err}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(|err| format!("failed to enable WAL on ledger: {err}"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|err| format!("failed to open in-memory ledger: {err}"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(SCHEMA)
            .map_err(|err| format!("failed to create ledger schema: {err}"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_positions(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Position>, String> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|err| format!("failed to prepare ledger query: {err}"))?;
        let rows = stmt
            .query_map(args, read_position)
            .map_err(|err| format!("failed to query ledger: {err}"))?;
        let mut positions = Vec::new();
        for row in rows {
            let position = row.map_err(|err| format!("failed to read ledger row: {err}"))?;
            positions.push(position?);
        }
        Ok(positions)
    }
}

type RowResult = Result<Position, String>;

fn read_position(row: &Row<'_>) -> rusqlite::Result<RowResult> {
    let status: String = row.get(11)?;
    let slot: i64 = row.get(2)?;
    let position = Position {
        trade_id: row.get(0)?,
        symbol: row.get(1)?,
        slot: 0,
        entry_price: row.get(3)?,
        quantity: row.get(4)?,
        stop_price: row.get(5)?,
        target_price: row.get(6)?,
        stop_fraction: row.get(7)?,
        target_fraction: row.get(8)?,
        broker_order_id: row.get(9)?,
        protective_order_id: row.get(10)?,
        status: PositionStatus::Open,
        opened_at: row.get(12)?,
        updated_at: row.get(13)?,
        closed_at: row.get(14)?,
    };
    Ok(finish_position(position, slot, &status))
}

fn finish_position(mut position: Position, slot: i64, status: &str) -> RowResult {
    position.slot = u8::try_from(slot)
        .map_err(|_| format!("slot {slot} out of range for {}", position.trade_id))?;
    position.status = PositionStatus::parse(status)?;
    Ok(position)
}

impl PositionRepository for SqlitePositionRepository {
    fn save(&self, position: &Position, event: &LedgerEvent) -> Result<(), String> {
        let detail = serde_json::to_string(&event.detail)
            .map_err(|err| format!("failed to encode event detail: {err}"))?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|err| format!("failed to begin ledger transaction: {err}"))?;
        tx.execute(
            &format!(
                "INSERT INTO positions ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(trade_id) DO UPDATE SET
                    entry_price = excluded.entry_price,
                    quantity = excluded.quantity,
                    stop_price = excluded.stop_price,
                    target_price = excluded.target_price,
                    broker_order_id = excluded.broker_order_id,
                    protective_order_id = excluded.protective_order_id,
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    closed_at = excluded.closed_at"
            ),
            params![
                position.trade_id,
                position.symbol,
                position.slot as i64,
                position.entry_price,
                position.quantity,
                position.stop_price,
                position.target_price,
                position.stop_fraction,
                position.target_fraction,
                position.broker_order_id,
                position.protective_order_id,
                position.status.as_str(),
                position.opened_at,
                position.updated_at,
                position.closed_at,
            ],
        )
        .map_err(|err| {
            metrics::counter!("ratchet.infra.ledger.errors_total", "stage" => "upsert").increment(1);
            format!("failed to save position {}: {err}", position.trade_id)
        })?;
        tx.execute(
            "INSERT INTO position_events (trade_id, from_status, to_status, at, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.trade_id,
                event.from_status.map(|s| s.as_str()),
                event.to_status.as_str(),
                event.at,
                detail,
            ],
        )
        .map_err(|err| format!("failed to journal event for {}: {err}", event.trade_id))?;
        tx.commit()
            .map_err(|err| format!("failed to commit ledger transaction: {err}"))
    }

    fn get(&self, trade_id: &str) -> Result<Option<Position>, String> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM positions WHERE trade_id = ?1"),
                params![trade_id],
                read_position,
            )
            .optional()
            .map_err(|err| format!("failed to load position {trade_id}: {err}"))?;
        found.transpose()
    }

    fn find_by_symbol(&self, symbol: &str) -> Result<Vec<Position>, String> {
        self.query_positions(
            &format!("SELECT {COLUMNS} FROM positions WHERE symbol = ?1 ORDER BY opened_at, slot"),
            params![symbol],
        )
    }

    fn find_live_slot(&self, symbol: &str, slot: u8) -> Result<Option<Position>, String> {
        let mut found = self.query_positions(
            &format!(
                "SELECT {COLUMNS} FROM positions
                 WHERE symbol = ?1 AND slot = ?2 AND status NOT LIKE 'CLOSED%'"
            ),
            params![symbol, slot as i64],
        )?;
        Ok(found.pop())
    }

    fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>, String> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{i}")).collect();
        self.query_positions(
            &format!(
                "SELECT {COLUMNS} FROM positions WHERE status IN ({}) ORDER BY symbol, slot",
                placeholders.join(", ")
            ),
            params_from_iter(statuses.iter().map(|s| s.as_str())),
        )
    }

    fn events(&self, trade_id: &str) -> Result<Vec<LedgerEvent>, String> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT from_status, to_status, at, detail FROM position_events
                 WHERE trade_id = ?1 ORDER BY id",
            )
            .map_err(|err| format!("failed to prepare event query: {err}"))?;
        let rows = stmt
            .query_map(params![trade_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|err| format!("failed to query events: {err}"))?;

        let mut events = Vec::new();
        for row in rows {
            let (from, to, at, detail) =
                row.map_err(|err| format!("failed to read event row: {err}"))?;
            events.push(LedgerEvent {
                trade_id: trade_id.to_string(),
                from_status: from.as_deref().map(PositionStatus::parse).transpose()?,
                to_status: PositionStatus::parse(&to)?,
                at,
                detail: serde_json::from_str(&detail)
                    .map_err(|err| format!("invalid event detail for {trade_id}: {err}"))?,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(position: &Position, from: Option<PositionStatus>) -> LedgerEvent {
        LedgerEvent {
            trade_id: position.trade_id.clone(),
            from_status: from,
            to_status: position.status,
            at: position.updated_at,
            detail: json!({ "slot": position.slot }),
        }
    }

    #[test]
    fn save_round_trips_rows_and_journal() {
        let repo = SqlitePositionRepository::in_memory().expect("repo");
        let mut position = Position::pending("INFY", 1, 10, 0.01, Some(0.02), 1_000);
        repo.save(&position, &event(&position, None)).expect("insert");

        position.transition(PositionStatus::Open, 1_010).expect("open");
        position.entry_price = Some(1500.25);
        repo.save(&position, &event(&position, Some(PositionStatus::PendingEntry)))
            .expect("update");

        let loaded = repo.get(&position.trade_id).expect("get").expect("row");
        assert_eq!(loaded, position);
        assert_eq!(
            repo.find_live_slot("INFY", 1).expect("slot").map(|p| p.trade_id),
            Some(position.trade_id.clone())
        );
        assert_eq!(repo.find_by_status(&[PositionStatus::Open]).expect("status").len(), 1);

        let events = repo.events(&position.trade_id).expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].from_status, Some(PositionStatus::PendingEntry));
        assert_eq!(events[1].detail, json!({ "slot": 1 }));
    }

    #[test]
    fn only_one_live_position_per_slot() {
        let repo = SqlitePositionRepository::in_memory().expect("repo");
        let first = Position::pending("INFY", 1, 10, 0.01, None, 1_000);
        repo.save(&first, &event(&first, None)).expect("first");
        let second = Position::pending("INFY", 1, 10, 0.01, None, 2_000);
        assert!(repo.save(&second, &event(&second, None)).is_err());
        // The failed transaction journals nothing.
        assert!(repo.events(&second.trade_id).expect("events").is_empty());

        let mut closed = first.clone();
        closed
            .transition(PositionStatus::ClosedManual, 1_500)
            .expect("close");
        repo.save(&closed, &event(&closed, Some(PositionStatus::PendingEntry)))
            .expect("close");
        repo.save(&second, &event(&second, None)).expect("slot freed");
        assert_eq!(repo.find_by_symbol("INFY").expect("symbol").len(), 2);
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("ledger.sqlite");
        let position = Position::pending("TCS", 1, 5, 0.01, None, 1_000);
        {
            let repo = SqlitePositionRepository::open(&path).expect("open");
            repo.save(&position, &event(&position, None)).expect("save");
        }
        let repo = SqlitePositionRepository::open(&path).expect("reopen");
        assert_eq!(repo.get(&position.trade_id).expect("get"), Some(position));
    }
}
