use crate::ledger::{LedgerError, PositionLedger};
use crate::prices::PriceStore;
use crate::trailing::{trail_state_for, TrailBook};
use parking_lot::Mutex;
use ratchet_domain::repositories::broker::{BrokerError, BrokerGateway};
use ratchet_domain::services::instruments::InstrumentMap;
use ratchet_domain::services::tick_size::TickBand;
use ratchet_domain::services::trailing::initial_levels;
use ratchet_domain::value_objects::position::{CloseReason, Position, PositionStatus};
use ratchet_domain::value_objects::protective::ProtectiveOrderRequest;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ProtectionError {
    #[error("position {0} has no entry price or live price to protect from")]
    NoReference(String),
    #[error("invalid protective order: {0}")]
    Invalid(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub protected: usize,
    pub failed: usize,
    pub gave_up: usize,
}

/// Places protective orders for OPEN positions and gives up on a position
/// after `retry_budget` consecutive failures (CLOSED_ERROR).
pub struct ProtectionSupervisor {
    broker: Arc<dyn BrokerGateway>,
    ledger: Arc<PositionLedger>,
    book: Arc<TrailBook>,
    prices: Arc<PriceStore>,
    instruments: Arc<InstrumentMap>,
    bands: Vec<TickBand>,
    retry_budget: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl ProtectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        ledger: Arc<PositionLedger>,
        book: Arc<TrailBook>,
        prices: Arc<PriceStore>,
        instruments: Arc<InstrumentMap>,
        bands: Vec<TickBand>,
        retry_budget: u32,
    ) -> Self {
        Self {
            broker,
            ledger,
            book,
            prices,
            instruments,
            bands,
            retry_budget: retry_budget.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn failures_for(&self, trade_id: &str) -> u32 {
        self.failures.lock().get(trade_id).copied().unwrap_or(0)
    }

    /// OPEN -> TRAILING: places the protective order and starts trailing it.
    /// A stop already on record (a position that lost its order) is kept
    /// rather than recomputed from the entry.
    pub fn protect(&self, position: &Position, now: i64) -> Result<Position, ProtectionError> {
        let reference = position
            .entry_price
            .or_else(|| self.prices.read(&position.symbol))
            .ok_or_else(|| ProtectionError::NoReference(position.trade_id.clone()))?;
        let tick = self
            .instruments
            .tick_size(&position.symbol, reference, &self.bands);
        let (initial_stop, initial_target) =
            initial_levels(reference, position.stop_fraction, position.target_fraction, tick);
        let stop = position
            .stop_price
            .map(|stop| stop.max(initial_stop))
            .unwrap_or(initial_stop);
        let target = position.target_price.or(initial_target);

        let request = ProtectiveOrderRequest::for_long(
            &position.symbol,
            position.quantity,
            reference,
            stop,
            target,
        )
        .map_err(ProtectionError::Invalid)?;

        let protective_id = self.broker.place_protective_order(&request)?;
        let updated = match self.ledger.attach_protection(
            &position.trade_id,
            &protective_id,
            stop,
            target,
            now,
        ) {
            Ok(updated) => updated,
            Err(err) => {
                if let Err(delete_err) = self.broker.delete_protective_order(&protective_id) {
                    tracing::error!(
                        trade_id = %position.trade_id,
                        protective_order_id = %protective_id,
                        error = %delete_err,
                        "failed to delete protective order the ledger refused"
                    );
                }
                return Err(err.into());
            }
        };

        if let Some(state) = trail_state_for(&updated, &self.instruments, &self.bands) {
            self.book.insert(state);
        }
        self.failures.lock().remove(&position.trade_id);
        metrics::counter!("ratchet.protection.placed_total").increment(1);
        tracing::info!(
            trade_id = %updated.trade_id,
            protective_order_id = %protective_id,
            stop,
            target = ?target,
            "position protected"
        );
        Ok(updated)
    }

    /// Counts a failed attempt; returns true when the budget is exhausted and
    /// the position was closed.
    pub fn record_failure(&self, position: &Position, error: &str, now: i64) -> bool {
        let attempts = {
            let mut failures = self.failures.lock();
            let entry = failures.entry(position.trade_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        metrics::counter!("ratchet.protection.failures_total").increment(1);
        tracing::warn!(
            trade_id = %position.trade_id,
            attempts,
            budget = self.retry_budget,
            error,
            "protective order placement failed"
        );
        if attempts < self.retry_budget {
            return false;
        }

        self.failures.lock().remove(&position.trade_id);
        match self.ledger.close(
            &position.trade_id,
            CloseReason::Error,
            now,
            json!({ "reason": "protection retry budget exhausted", "attempts": attempts, "last_error": error }),
        ) {
            Ok(_) => {
                metrics::counter!("ratchet.protection.gave_up_total").increment(1);
                tracing::error!(trade_id = %position.trade_id, attempts, "position left unprotected; closed with error");
                true
            }
            Err(err) => {
                tracing::error!(trade_id = %position.trade_id, error = %err, "failed to close unprotected position");
                false
            }
        }
    }

    /// One supervision pass over every OPEN position without protection.
    pub fn run_cycle(&self, now: i64) -> SupervisorReport {
        let mut report = SupervisorReport::default();
        let open = match self.ledger.with_status(&[PositionStatus::Open]) {
            Ok(open) => open,
            Err(err) => {
                tracing::error!(error = %err, "failed to list open positions");
                return report;
            }
        };
        for position in open.iter().filter(|p| p.needs_protection()) {
            match self.protect(position, now) {
                Ok(_) => report.protected += 1,
                Err(err) => {
                    report.failed += 1;
                    if self.record_failure(position, &err.to_string(), now) {
                        report.gave_up += 1;
                    }
                }
            }
        }
        report
    }
}
