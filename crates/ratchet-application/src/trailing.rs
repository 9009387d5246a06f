use crate::ledger::{LedgerError, PositionLedger};
use crate::prices::PriceStore;
use crate::runtime::{run_loop, Clock, Ticker};
use parking_lot::Mutex;
use ratchet_domain::repositories::broker::{BrokerError, BrokerGateway};
use ratchet_domain::services::instruments::InstrumentMap;
use ratchet_domain::services::session::TradingSession;
use ratchet_domain::services::tick_size::TickBand;
use ratchet_domain::services::trailing::TrailAdjustment;
use ratchet_domain::value_objects::position::{Position, PositionStatus};
use ratchet_domain::value_objects::protective::{ProtectiveOrderKind, ProtectiveOrderRequest};
use ratchet_domain::value_objects::trail_state::TrailState;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::info_span;

/// Live trailing states keyed by protective order id.
#[derive(Debug, Default)]
pub struct TrailBook {
    states: Mutex<HashMap<String, TrailState>>,
}

impl TrailBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: TrailState) {
        self.states
            .lock()
            .insert(state.protective_order_id.clone(), state);
    }

    pub fn remove(&self, protective_order_id: &str) -> Option<TrailState> {
        self.states.lock().remove(protective_order_id)
    }

    pub fn remove_trade(&self, trade_id: &str) -> usize {
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, state| state.trade_id != trade_id);
        before - states.len()
    }

    /// Swaps the entry for `old_id` with `state` (which may carry a new id).
    pub fn replace(&self, old_id: &str, state: TrailState) {
        let mut states = self.states.lock();
        states.remove(old_id);
        states.insert(state.protective_order_id.clone(), state);
    }

    pub fn get(&self, protective_order_id: &str) -> Option<TrailState> {
        self.states.lock().get(protective_order_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<TrailState> {
        let mut states: Vec<TrailState> = self.states.lock().values().cloned().collect();
        states.sort_by(|a, b| a.trade_id.cmp(&b.trade_id));
        states
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    /// Rebuilds the book from every TRAILING position in the ledger.
    pub fn rebuild_from(
        &self,
        ledger: &PositionLedger,
        instruments: &InstrumentMap,
        bands: &[TickBand],
    ) -> Result<usize, LedgerError> {
        let positions = ledger.with_status(&[PositionStatus::Trailing])?;
        let mut rebuilt = HashMap::new();
        for position in &positions {
            match trail_state_for(position, instruments, bands) {
                Some(state) => {
                    rebuilt.insert(state.protective_order_id.clone(), state);
                }
                None => tracing::warn!(
                    trade_id = %position.trade_id,
                    "trailing position lacks protective order or stop; not tracked"
                ),
            }
        }
        let count = rebuilt.len();
        *self.states.lock() = rebuilt;
        metrics::gauge!("ratchet.trailing.states").set(count as f64);
        tracing::info!(states = count, "trail book rebuilt from ledger");
        Ok(count)
    }
}

/// TrailState for a protected position, or None when it has no protective
/// order or stop on record.
pub fn trail_state_for(
    position: &Position,
    instruments: &InstrumentMap,
    bands: &[TickBand],
) -> Option<TrailState> {
    let protective_order_id = position.protective_order_id.clone()?;
    let stop = position.stop_price?;
    let reference = position.entry_price.unwrap_or(stop);
    let order_kind = if position.target_price.is_some() {
        ProtectiveOrderKind::TwoLeg
    } else {
        ProtectiveOrderKind::SingleLeg
    };
    Some(TrailState {
        trade_id: position.trade_id.clone(),
        protective_order_id,
        symbol: position.symbol.clone(),
        quantity: position.quantity,
        stop_fraction: position.stop_fraction,
        tick_increment: instruments.tick_size(&position.symbol, reference, bands),
        current_trigger: stop,
        order_kind,
        target_fraction: position.target_fraction,
        current_target: position.target_price,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct TrailingSettings {
    pub trail_threshold: f64,
    pub market_hours_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailCycleReport {
    pub evaluated: usize,
    pub missing_price: usize,
    pub modified: usize,
    pub replaced: usize,
    pub failed: usize,
    pub dropped: usize,
    pub skipped_closed_market: bool,
}

enum SyncResult {
    Modified,
    Replaced(String),
}

/// Ratchets protective triggers upward and pushes each raise to the broker.
pub struct TrailingEngine {
    broker: Arc<dyn BrokerGateway>,
    ledger: Arc<PositionLedger>,
    book: Arc<TrailBook>,
    prices: Arc<PriceStore>,
    session: TradingSession,
    settings: TrailingSettings,
}

impl TrailingEngine {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        ledger: Arc<PositionLedger>,
        book: Arc<TrailBook>,
        prices: Arc<PriceStore>,
        session: TradingSession,
        settings: TrailingSettings,
    ) -> Self {
        Self {
            broker,
            ledger,
            book,
            prices,
            session,
            settings,
        }
    }

    pub fn run_cycle(&self, now: i64) -> TrailCycleReport {
        let span = info_span!("trailing.cycle", now);
        let _enter = span.enter();
        let mut report = TrailCycleReport::default();

        if self.settings.market_hours_only && !self.session.is_open_at(now) {
            report.skipped_closed_market = true;
            return report;
        }

        let states = self.book.snapshot();
        metrics::gauge!("ratchet.trailing.states").set(states.len() as f64);
        if states.is_empty() {
            return report;
        }

        let prices = self.fetch_prices(&states);
        for state in states {
            report.evaluated += 1;
            let Some(price) = prices.get(&state.symbol).copied() else {
                report.missing_price += 1;
                continue;
            };
            let Some(adjustment) = state.evaluate(price, self.settings.trail_threshold) else {
                continue;
            };
            self.raise(&state, price, &adjustment, now, &mut report);
        }

        metrics::counter!("ratchet.trailing.modified_total").increment(report.modified as u64);
        metrics::counter!("ratchet.trailing.replaced_total").increment(report.replaced as u64);
        metrics::counter!("ratchet.trailing.failed_total").increment(report.failed as u64);
        if report.modified + report.replaced + report.failed > 0 {
            tracing::info!(
                evaluated = report.evaluated,
                modified = report.modified,
                replaced = report.replaced,
                failed = report.failed,
                "trailing cycle finished"
            );
        }
        report
    }

    /// One batched quote call; symbols it cannot price fall back to the
    /// streaming price store.
    fn fetch_prices(&self, states: &[TrailState]) -> HashMap<String, f64> {
        let symbols: Vec<String> = states
            .iter()
            .map(|s| s.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let started = Instant::now();
        let mut prices = match self.broker.last_prices(&symbols) {
            Ok(prices) => {
                metrics::histogram!("ratchet.trailing.quote_ms")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                prices
            }
            Err(err) => {
                metrics::counter!("ratchet.trailing.quote_errors_total", "kind" => err.kind())
                    .increment(1);
                tracing::warn!(error = %err, "batched quote failed; using streamed prices");
                HashMap::new()
            }
        };
        for symbol in symbols {
            if !prices.contains_key(&symbol) {
                if let Some(price) = self.prices.read(&symbol) {
                    prices.insert(symbol, price);
                }
            }
        }
        prices
    }

    fn raise(
        &self,
        state: &TrailState,
        price: f64,
        adjustment: &TrailAdjustment,
        now: i64,
        report: &mut TrailCycleReport,
    ) {
        let request = match ProtectiveOrderRequest::for_long(
            &state.symbol,
            state.quantity,
            price,
            adjustment.new_trigger,
            adjustment.new_target,
        ) {
            Ok(request) => request,
            Err(err) => {
                report.failed += 1;
                tracing::warn!(trade_id = %state.trade_id, error = %err, "cannot build protective order");
                return;
            }
        };

        let synced = match self.sync(state, &request, now) {
            Ok(synced) => synced,
            Err(err) => {
                report.failed += 1;
                tracing::warn!(
                    trade_id = %state.trade_id,
                    protective_order_id = %state.protective_order_id,
                    error = %err,
                    "protective order sync failed; will retry next cycle"
                );
                return;
            }
        };

        let new_id = match &synced {
            SyncResult::Modified => state.protective_order_id.clone(),
            SyncResult::Replaced(id) => id.clone(),
        };
        match self.ledger.record_trail(
            &state.trade_id,
            &state.protective_order_id,
            &new_id,
            adjustment.new_trigger,
            adjustment.new_target,
            now,
        ) {
            Ok(_) => {
                let mut updated = state.clone();
                updated.apply(adjustment, new_id.clone());
                self.book.replace(&state.protective_order_id, updated);
                match synced {
                    SyncResult::Modified => report.modified += 1,
                    SyncResult::Replaced(_) => report.replaced += 1,
                }
                tracing::info!(
                    trade_id = %state.trade_id,
                    price,
                    gap = adjustment.gap,
                    from = state.current_trigger,
                    to = adjustment.new_trigger,
                    protective_order_id = %new_id,
                    "trailing stop raised"
                );
            }
            Err(LedgerError::Storage(err)) if matches!(synced, SyncResult::Modified) => {
                report.failed += 1;
                tracing::error!(trade_id = %state.trade_id, error = %err, "ledger write failed after modify; will retry");
            }
            Err(err) => {
                report.dropped += 1;
                if let SyncResult::Replaced(id) = &synced {
                    if let Err(delete_err) = self.broker.delete_protective_order(id) {
                        tracing::error!(
                            trade_id = %state.trade_id,
                            protective_order_id = %id,
                            error = %delete_err,
                            "failed to delete orphaned replacement order"
                        );
                    }
                }
                self.book.remove(&state.protective_order_id);
                tracing::warn!(trade_id = %state.trade_id, error = %err, "ledger refused trail update; state dropped");
            }
        }
    }

    /// Modify in place when supported; otherwise (or on failure) delete and
    /// recreate. When the delete succeeds but the recreate fails the position
    /// is left unprotected, so it is moved back to OPEN for the supervisor.
    fn sync(
        &self,
        state: &TrailState,
        request: &ProtectiveOrderRequest,
        now: i64,
    ) -> Result<SyncResult, BrokerError> {
        if self.broker.supports_protective_modify() {
            match self
                .broker
                .modify_protective_order(&state.protective_order_id, request)
            {
                Ok(()) => return Ok(SyncResult::Modified),
                Err(err) => tracing::debug!(
                    protective_order_id = %state.protective_order_id,
                    error = %err,
                    "modify failed; replacing order"
                ),
            }
        }

        self.broker
            .delete_protective_order(&state.protective_order_id)?;
        match self.broker.place_protective_order(request) {
            Ok(id) => Ok(SyncResult::Replaced(id)),
            Err(err) => {
                self.book.remove(&state.protective_order_id);
                if let Err(ledger_err) = self.ledger.detach_protection(
                    &state.trade_id,
                    &state.protective_order_id,
                    "replacement failed",
                    now,
                ) {
                    tracing::error!(trade_id = %state.trade_id, error = %ledger_err, "failed to mark position unprotected");
                }
                Err(err)
            }
        }
    }

    pub fn run(&self, clock: &dyn Clock, ticker: &mut dyn Ticker) -> u64 {
        run_loop("trailing", ticker, || {
            self.run_cycle(clock.now_seconds());
        })
    }
}
