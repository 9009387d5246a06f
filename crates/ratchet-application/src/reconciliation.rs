use crate::bounded::BoundedRead;
use crate::ledger::PositionLedger;
use crate::protection::ProtectionSupervisor;
use crate::runtime::{run_loop, Clock, Ticker};
use crate::trailing::TrailBook;
use ratchet_domain::repositories::broker::BrokerGateway;
use ratchet_domain::value_objects::order::{OrderSnapshot, OrderState};
use ratchet_domain::value_objects::position::{CloseReason, Position, PositionStatus};
use ratchet_domain::value_objects::protective::{
    ProtectiveOrderSnapshot, ProtectiveOrderStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info_span;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub closed_target: usize,
    pub closed_stop: usize,
    pub unprotected: usize,
    pub entries_filled: usize,
    pub entries_failed: usize,
    pub protected: usize,
    pub protection_failures: usize,
    pub gave_up: usize,
    pub stale_reads: usize,
}

/// Applies broker-side outcomes (fills, triggers, vanished orders) to the
/// ledger, then runs the protection supervisor.
pub struct Reconciler {
    broker: Arc<dyn BrokerGateway>,
    ledger: Arc<PositionLedger>,
    book: Arc<TrailBook>,
    supervisor: Arc<ProtectionSupervisor>,
    protective_reads: BoundedRead<Vec<ProtectiveOrderSnapshot>>,
    order_reads: BoundedRead<Vec<OrderSnapshot>>,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        ledger: Arc<PositionLedger>,
        book: Arc<TrailBook>,
        supervisor: Arc<ProtectionSupervisor>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            ledger,
            book,
            supervisor,
            protective_reads: BoundedRead::new("protective_orders", read_timeout),
            order_reads: BoundedRead::new("orders", read_timeout),
        }
    }

    pub fn run_cycle(&self, now: i64) -> ReconcileReport {
        let span = info_span!("reconcile.cycle", now);
        let _enter = span.enter();
        let mut report = ReconcileReport::default();

        self.reconcile_trailing(now, &mut report);
        self.reconcile_pending(now, &mut report);

        let supervision = self.supervisor.run_cycle(now);
        report.protected = supervision.protected;
        report.protection_failures = supervision.failed;
        report.gave_up = supervision.gave_up;

        if report != ReconcileReport::default() {
            tracing::info!(
                closed_target = report.closed_target,
                closed_stop = report.closed_stop,
                unprotected = report.unprotected,
                entries_filled = report.entries_filled,
                entries_failed = report.entries_failed,
                protected = report.protected,
                gave_up = report.gave_up,
                stale_reads = report.stale_reads,
                "reconciliation cycle finished"
            );
        }
        report
    }

    fn reconcile_trailing(&self, now: i64, report: &mut ReconcileReport) {
        let trailing = match self.ledger.with_status(&[PositionStatus::Trailing]) {
            Ok(trailing) => trailing,
            Err(err) => {
                tracing::error!(error = %err, "failed to list trailing positions");
                return;
            }
        };
        if trailing.is_empty() {
            return;
        }

        let broker = self.broker.clone();
        let outcome = self.protective_reads.read(move || {
            broker
                .list_protective_orders()
                .map_err(|err| err.to_string())
        });
        let fresh = outcome.is_fresh();
        if !fresh {
            report.stale_reads += 1;
        }
        let Some(listing) = outcome.value() else {
            return;
        };
        let by_id: HashMap<&str, &ProtectiveOrderSnapshot> =
            listing.iter().map(|s| (s.id.as_str(), s)).collect();

        for position in &trailing {
            let Some(protective_id) = position.protective_order_id.as_deref() else {
                continue;
            };
            match by_id.get(protective_id).map(|s| &s.status) {
                Some(ProtectiveOrderStatus::Triggered { leg }) => {
                    let reason = if *leg == Some(1) {
                        CloseReason::Target
                    } else {
                        CloseReason::Stop
                    };
                    self.close_triggered(position, protective_id, reason, now, report);
                }
                Some(status) if status.is_gone() => {
                    let reason = format!("{status:?}").to_lowercase();
                    self.mark_unprotected(position, protective_id, &reason, now, report);
                }
                Some(_) => {}
                // Only a fresh listing proves absence.
                None if fresh => {
                    self.mark_unprotected(position, protective_id, "missing", now, report)
                }
                None => {}
            }
        }
    }

    fn close_triggered(
        &self,
        position: &Position,
        protective_id: &str,
        reason: CloseReason,
        now: i64,
        report: &mut ReconcileReport,
    ) {
        match self.ledger.close(
            &position.trade_id,
            reason,
            now,
            json!({ "protective_order_id": protective_id, "trigger": "broker" }),
        ) {
            Ok(closed) => {
                self.book.remove(protective_id);
                match reason {
                    CloseReason::Target => report.closed_target += 1,
                    _ => report.closed_stop += 1,
                }
                tracing::info!(trade_id = %closed.trade_id, status = %closed.status, "protective order triggered");
            }
            Err(err) => {
                tracing::warn!(trade_id = %position.trade_id, error = %err, "failed to close triggered position")
            }
        }
    }

    fn mark_unprotected(
        &self,
        position: &Position,
        protective_id: &str,
        reason: &str,
        now: i64,
        report: &mut ReconcileReport,
    ) {
        match self
            .ledger
            .detach_protection(&position.trade_id, protective_id, reason, now)
        {
            Ok(_) => {
                self.book.remove(protective_id);
                report.unprotected += 1;
                tracing::warn!(trade_id = %position.trade_id, protective_order_id = %protective_id, reason, "protective order lost at broker");
            }
            Err(err) => {
                tracing::warn!(trade_id = %position.trade_id, error = %err, "failed to mark position unprotected")
            }
        }
    }

    fn reconcile_pending(&self, now: i64, report: &mut ReconcileReport) {
        let pending: Vec<Position> = match self.ledger.with_status(&[PositionStatus::PendingEntry])
        {
            Ok(pending) => pending
                .into_iter()
                .filter(|p| p.broker_order_id.is_some())
                .collect(),
            Err(err) => {
                tracing::error!(error = %err, "failed to list pending positions");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let broker = self.broker.clone();
        let outcome = self
            .order_reads
            .read(move || broker.list_open_orders().map_err(|err| err.to_string()));
        if !outcome.is_fresh() {
            report.stale_reads += 1;
        }
        let Some(orders) = outcome.value() else {
            return;
        };
        let by_id: HashMap<&str, &OrderSnapshot> =
            orders.iter().map(|o| (o.order_id.as_str(), o)).collect();

        for position in &pending {
            let Some(order_id) = position.broker_order_id.as_deref() else {
                continue;
            };
            let Some(order) = by_id.get(order_id) else {
                continue;
            };
            match order.state {
                OrderState::Complete => {
                    let Some(price) = order.average_price.filter(|p| *p > 0.0) else {
                        tracing::warn!(trade_id = %position.trade_id, order_id, "filled order reports no average price");
                        continue;
                    };
                    let quantity = if order.filled_quantity > 0 {
                        order.filled_quantity
                    } else {
                        position.quantity
                    };
                    match self
                        .ledger
                        .confirm_entry(&position.trade_id, price, quantity, now)
                    {
                        Ok(_) => report.entries_filled += 1,
                        Err(err) => {
                            tracing::warn!(trade_id = %position.trade_id, error = %err, "failed to confirm entry")
                        }
                    }
                }
                OrderState::Rejected | OrderState::Cancelled => {
                    match self.ledger.close(
                        &position.trade_id,
                        CloseReason::Error,
                        now,
                        json!({ "broker_order_id": order_id, "order_state": format!("{:?}", order.state) }),
                    ) {
                        Ok(_) => report.entries_failed += 1,
                        Err(err) => {
                            tracing::warn!(trade_id = %position.trade_id, error = %err, "failed to close rejected entry")
                        }
                    }
                }
                OrderState::Open => {}
            }
        }
    }

    pub fn run(&self, clock: &dyn Clock, ticker: &mut dyn Ticker) -> u64 {
        run_loop("reconcile", ticker, || {
            self.run_cycle(clock.now_seconds());
        })
    }
}
