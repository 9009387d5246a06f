use parking_lot::Mutex;
use ratchet_domain::repositories::position_store::{LedgerEvent, PositionRepository};
use ratchet_domain::services::ladder::{LadderPolicy, LadderRejection};
use ratchet_domain::value_objects::position::{
    CloseReason, Position, PositionStatus, TransitionError,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ladder rejected entry: {0}")]
    Ladder(#[from] LadderRejection),
    #[error("position {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("position {trade_id} moved on: expected protective order {expected:?}, found {found:?}")]
    Stale {
        trade_id: String,
        expected: Option<String>,
        found: Option<String>,
    },
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Sole writer of ladder positions. Mutations for one symbol are serialized;
/// each one validates the state machine and persists row + event atomically.
pub struct PositionLedger {
    store: Arc<dyn PositionRepository>,
    policy: LadderPolicy,
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn PositionRepository>, policy: LadderPolicy) -> Self {
        Self {
            store,
            policy,
            symbol_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> LadderPolicy {
        self.policy
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Reserves `slot` for a new PENDING_ENTRY position if the ladder allows it.
    pub fn open_slot(
        &self,
        symbol: &str,
        slot: u8,
        quantity: i64,
        stop_fraction: f64,
        target_fraction: Option<f64>,
        now: i64,
    ) -> Result<Position, LedgerError> {
        let lock = self.symbol_lock(symbol);
        let _guard = lock.lock();

        let existing = self.store.find_by_symbol(symbol).map_err(LedgerError::Storage)?;
        if let Err(rejection) = self.policy.check(slot, &existing, now) {
            metrics::counter!("ratchet.ledger.rejections_total").increment(1);
            tracing::info!(symbol, slot, reason = %rejection, "ladder entry rejected");
            return Err(rejection.into());
        }

        let mut position =
            Position::pending(symbol, slot, quantity, stop_fraction, target_fraction, now);
        let base_id = position.trade_id.clone();
        let mut suffix = 1;
        while existing.iter().any(|p| p.trade_id == position.trade_id) {
            suffix += 1;
            position.trade_id = format!("{base_id}-{suffix}");
        }

        let event = LedgerEvent {
            trade_id: position.trade_id.clone(),
            from_status: None,
            to_status: PositionStatus::PendingEntry,
            at: now,
            detail: json!({
                "slot": slot,
                "quantity": quantity,
                "stop_fraction": stop_fraction,
                "target_fraction": target_fraction,
            }),
        };
        self.store
            .save(&position, &event)
            .map_err(LedgerError::Storage)?;
        metrics::counter!("ratchet.ledger.transitions_total", "to" => "PENDING_ENTRY").increment(1);
        tracing::info!(trade_id = %position.trade_id, symbol, slot, quantity, "ladder slot opened");
        Ok(position)
    }

    pub fn record_entry_order(
        &self,
        trade_id: &str,
        order_id: &str,
        now: i64,
    ) -> Result<Position, LedgerError> {
        self.mutate(
            trade_id,
            PositionStatus::PendingEntry,
            now,
            json!({ "broker_order_id": order_id }),
            |position| {
                position.broker_order_id = Some(order_id.to_string());
                Ok(())
            },
        )
    }

    pub fn confirm_entry(
        &self,
        trade_id: &str,
        entry_price: f64,
        quantity: i64,
        now: i64,
    ) -> Result<Position, LedgerError> {
        self.mutate(
            trade_id,
            PositionStatus::Open,
            now,
            json!({ "entry_price": entry_price, "quantity": quantity }),
            |position| {
                position.entry_price = Some(entry_price);
                position.quantity = quantity;
                Ok(())
            },
        )
    }

    pub fn attach_protection(
        &self,
        trade_id: &str,
        protective_order_id: &str,
        stop_price: f64,
        target_price: Option<f64>,
        now: i64,
    ) -> Result<Position, LedgerError> {
        self.mutate(
            trade_id,
            PositionStatus::Trailing,
            now,
            json!({
                "protective_order_id": protective_order_id,
                "stop_price": stop_price,
                "target_price": target_price,
            }),
            |position| {
                position.protective_order_id = Some(protective_order_id.to_string());
                position.stop_price = Some(stop_price);
                position.target_price = target_price;
                Ok(())
            },
        )
    }

    /// Records a trailing raise. Refused unless the row still references
    /// `expected_protective_id`, so a concurrent close or re-protection wins.
    pub fn record_trail(
        &self,
        trade_id: &str,
        expected_protective_id: &str,
        protective_order_id: &str,
        stop_price: f64,
        target_price: Option<f64>,
        now: i64,
    ) -> Result<Position, LedgerError> {
        self.mutate(
            trade_id,
            PositionStatus::Trailing,
            now,
            json!({
                "protective_order_id": protective_order_id,
                "stop_price": stop_price,
                "target_price": target_price,
            }),
            |position| {
                expect_protective(position, expected_protective_id)?;
                position.protective_order_id = Some(protective_order_id.to_string());
                position.stop_price = Some(stop_price);
                position.target_price = target_price;
                Ok(())
            },
        )
    }

    /// TRAILING -> OPEN when the protective order vanished at the broker.
    pub fn detach_protection(
        &self,
        trade_id: &str,
        expected_protective_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<Position, LedgerError> {
        self.mutate(
            trade_id,
            PositionStatus::Open,
            now,
            json!({ "lost_protective_order_id": expected_protective_id, "reason": reason }),
            |position| {
                expect_protective(position, expected_protective_id)?;
                position.protective_order_id = None;
                Ok(())
            },
        )
    }

    pub fn close(
        &self,
        trade_id: &str,
        reason: CloseReason,
        now: i64,
        detail: serde_json::Value,
    ) -> Result<Position, LedgerError> {
        self.mutate(trade_id, reason.status(), now, detail, |_| Ok(()))
    }

    pub fn get(&self, trade_id: &str) -> Result<Option<Position>, LedgerError> {
        self.store.get(trade_id).map_err(LedgerError::Storage)
    }

    pub fn positions_for(&self, symbol: &str) -> Result<Vec<Position>, LedgerError> {
        self.store
            .find_by_symbol(symbol)
            .map_err(LedgerError::Storage)
    }

    pub fn with_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>, LedgerError> {
        self.store
            .find_by_status(statuses)
            .map_err(LedgerError::Storage)
    }

    pub fn live_positions(&self) -> Result<Vec<Position>, LedgerError> {
        self.with_status(&[
            PositionStatus::PendingEntry,
            PositionStatus::Open,
            PositionStatus::Trailing,
        ])
    }

    pub fn events(&self, trade_id: &str) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.store.events(trade_id).map_err(LedgerError::Storage)
    }

    fn load(&self, trade_id: &str) -> Result<Position, LedgerError> {
        self.store
            .get(trade_id)
            .map_err(LedgerError::Storage)?
            .ok_or_else(|| LedgerError::NotFound(trade_id.to_string()))
    }

    fn mutate<F>(
        &self,
        trade_id: &str,
        next: PositionStatus,
        now: i64,
        detail: serde_json::Value,
        apply: F,
    ) -> Result<Position, LedgerError>
    where
        F: FnOnce(&mut Position) -> Result<(), LedgerError>,
    {
        let symbol = self.load(trade_id)?.symbol;
        let lock = self.symbol_lock(&symbol);
        let _guard = lock.lock();

        let mut position = self.load(trade_id)?;
        let from = position.status;
        position.transition(next, now)?;
        apply(&mut position)?;

        let event = LedgerEvent {
            trade_id: position.trade_id.clone(),
            from_status: Some(from),
            to_status: next,
            at: now,
            detail,
        };
        self.store
            .save(&position, &event)
            .map_err(LedgerError::Storage)?;
        metrics::counter!("ratchet.ledger.transitions_total", "to" => next.as_str()).increment(1);
        if from != next {
            tracing::info!(trade_id, from = %from, to = %next, "position transition");
        } else {
            tracing::debug!(trade_id, status = %next, "position updated");
        }
        Ok(position)
    }
}

fn expect_protective(position: &Position, expected: &str) -> Result<(), LedgerError> {
    if position.protective_order_id.as_deref() == Some(expected) {
        return Ok(());
    }
    Err(LedgerError::Stale {
        trade_id: position.trade_id.clone(),
        expected: Some(expected.to_string()),
        found: position.protective_order_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct MemoryPositions {
        rows: Mutex<HashMap<String, Position>>,
        events: Mutex<Vec<LedgerEvent>>,
    }

    impl PositionRepository for MemoryPositions {
        fn save(&self, position: &Position, event: &LedgerEvent) -> Result<(), String> {
            self.rows
                .lock()
                .insert(position.trade_id.clone(), position.clone());
            self.events.lock().push(event.clone());
            Ok(())
        }

        fn get(&self, trade_id: &str) -> Result<Option<Position>, String> {
            Ok(self.rows.lock().get(trade_id).cloned())
        }

        fn find_by_symbol(&self, symbol: &str) -> Result<Vec<Position>, String> {
            Ok(self
                .rows
                .lock()
                .values()
                .filter(|p| p.symbol == symbol)
                .cloned()
                .collect())
        }

        fn find_live_slot(&self, symbol: &str, slot: u8) -> Result<Option<Position>, String> {
            Ok(self
                .rows
                .lock()
                .values()
                .find(|p| p.symbol == symbol && p.slot == slot && !p.status.is_closed())
                .cloned())
        }

        fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>, String> {
            Ok(self
                .rows
                .lock()
                .values()
                .filter(|p| statuses.contains(&p.status))
                .cloned()
                .collect())
        }

        fn events(&self, trade_id: &str) -> Result<Vec<LedgerEvent>, String> {
            Ok(self
                .events
                .lock()
                .iter()
                .filter(|e| e.trade_id == trade_id)
                .cloned()
                .collect())
        }
    }

    fn ledger() -> PositionLedger {
        PositionLedger::new(Arc::new(MemoryPositions::default()), LadderPolicy::default())
    }

    fn trailing(ledger: &PositionLedger, symbol: &str, slot: u8, now: i64) -> Position {
        let p = ledger
            .open_slot(symbol, slot, 10, 0.01, None, now)
            .expect("open");
        ledger.confirm_entry(&p.trade_id, 100.0, 10, now).expect("fill");
        ledger
            .attach_protection(&p.trade_id, &format!("gtt-{slot}"), 99.0, None, now)
            .expect("protect")
    }

    #[test]
    fn full_lifecycle_is_journaled() {
        let ledger = ledger();
        let p = trailing(&ledger, "INFY", 1, 1_000);
        let p = ledger
            .record_trail(&p.trade_id, "gtt-1", "gtt-9", 99.5, None, 1_010)
            .expect("trail");
        assert_eq!(p.protective_order_id.as_deref(), Some("gtt-9"));
        let p = ledger
            .close(&p.trade_id, CloseReason::Stop, 1_020, json!({}))
            .expect("close");
        assert_eq!(p.status, PositionStatus::ClosedStop);
        assert_eq!(p.closed_at, Some(1_020));

        let statuses: Vec<PositionStatus> = ledger
            .events(&p.trade_id)
            .expect("events")
            .iter()
            .map(|e| e.to_status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                PositionStatus::PendingEntry,
                PositionStatus::Open,
                PositionStatus::Trailing,
                PositionStatus::Trailing,
                PositionStatus::ClosedStop,
            ]
        );
    }

    #[test]
    fn closed_positions_are_terminal() {
        let ledger = ledger();
        let p = trailing(&ledger, "INFY", 1, 1_000);
        ledger
            .close(&p.trade_id, CloseReason::Manual, 1_001, json!({}))
            .expect("close");
        let err = ledger
            .record_trail(&p.trade_id, "gtt-1", "gtt-2", 99.5, None, 1_002)
            .expect_err("closed");
        assert!(matches!(err, LedgerError::Transition(_)));
    }

    #[test]
    fn trail_with_outdated_protective_id_is_stale() {
        let ledger = ledger();
        let p = trailing(&ledger, "INFY", 1, 1_000);
        let err = ledger
            .record_trail(&p.trade_id, "gtt-old", "gtt-2", 99.5, None, 1_001)
            .expect_err("stale");
        assert!(matches!(err, LedgerError::Stale { .. }));
        let unchanged = ledger.get(&p.trade_id).expect("get").expect("row");
        assert_eq!(unchanged.protective_order_id.as_deref(), Some("gtt-1"));
    }

    #[test]
    fn ladder_gates_slots_and_cooldown() {
        let ledger = ledger();
        let first = ledger.open_slot("TCS", 1, 5, 0.01, None, 0).expect("slot 1");
        assert!(matches!(
            ledger.open_slot("TCS", 2, 5, 0.01, None, 1),
            Err(LedgerError::Ladder(LadderRejection::LowerSlotNotFilled { .. }))
        ));
        ledger.confirm_entry(&first.trade_id, 10.0, 5, 2).expect("fill");
        assert!(ledger.open_slot("TCS", 2, 5, 0.01, None, 3).is_ok());

        ledger
            .close(&first.trade_id, CloseReason::Error, 4, json!({}))
            .expect("close");
        let stopped = ledger.open_slot("TCS", 1, 5, 0.01, None, 5).expect("reopen");
        ledger.confirm_entry(&stopped.trade_id, 10.0, 5, 6).expect("fill");
        ledger
            .attach_protection(&stopped.trade_id, "g", 9.9, None, 7)
            .expect("protect");
        ledger
            .close(&stopped.trade_id, CloseReason::Stop, 100, json!({}))
            .expect("stop");
        assert!(matches!(
            ledger.open_slot("TCS", 1, 5, 0.01, None, 100 + 60),
            Err(LedgerError::Ladder(LadderRejection::CoolingDown { .. }))
        ));
        assert!(ledger.open_slot("TCS", 1, 5, 0.01, None, 100 + 1_800).is_ok());
    }

    #[test]
    fn concurrent_entries_on_one_symbol_take_one_slot() {
        let ledger = Arc::new(ledger());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || ledger.open_slot("SBIN", 1, 1, 0.01, None, 42).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
