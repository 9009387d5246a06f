use crate::value_objects::position::{Position, PositionStatus};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEvent {
    pub trade_id: String,
    pub from_status: Option<PositionStatus>,
    pub to_status: PositionStatus,
    pub at: i64,
    pub detail: serde_json::Value,
}

pub trait PositionRepository: Send + Sync {
    /// Inserts or replaces the position row and appends `event` in one transaction.
    fn save(&self, position: &Position, event: &LedgerEvent) -> Result<(), String>;

    fn get(&self, trade_id: &str) -> Result<Option<Position>, String>;

    /// All rows for the symbol, including closed audit rows.
    fn find_by_symbol(&self, symbol: &str) -> Result<Vec<Position>, String>;

    /// The non-closed position holding `slot`, if any.
    fn find_live_slot(&self, symbol: &str, slot: u8) -> Result<Option<Position>, String>;

    fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>, String>;

    fn events(&self, trade_id: &str) -> Result<Vec<LedgerEvent>, String>;
}
