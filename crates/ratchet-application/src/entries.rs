use crate::ledger::{LedgerError, PositionLedger};
use crate::protection::ProtectionSupervisor;
use crate::trailing::TrailBook;
use ratchet_domain::repositories::broker::{BrokerError, BrokerGateway};
use ratchet_domain::value_objects::order::OrderRequest;
use ratchet_domain::value_objects::position::{CloseReason, Position};
use ratchet_domain::value_objects::side::Side;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("invalid entry: {0}")]
    Invalid(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("entry order for {trade_id} failed: {source}")]
    Broker {
        trade_id: String,
        #[source]
        source: BrokerError,
    },
    /// The order may or may not be live at the broker; the slot stays
    /// PENDING_ENTRY until the operator closes or confirms it.
    #[error("entry order for {trade_id} unconfirmed ({source}); left PENDING_ENTRY, check the broker order book")]
    Unconfirmed {
        trade_id: String,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub symbol: String,
    pub slot: u8,
    pub quantity: i64,
    /// Falls back to the ledger defaults when absent.
    pub stop_fraction: Option<f64>,
    pub target_fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOutcome {
    pub position: Position,
    /// Set when protection was attempted and failed; the supervisor retries.
    pub protection_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManualClose {
    pub position: Position,
    pub protective_deleted: bool,
    pub flatten_order_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct EntryDefaults {
    pub stop_fraction: f64,
    pub target_fraction: Option<f64>,
}

/// Entry and exit surface used by strategies and the operator CLI.
pub struct LadderTrader {
    broker: Arc<dyn BrokerGateway>,
    ledger: Arc<PositionLedger>,
    book: Arc<TrailBook>,
    supervisor: Arc<ProtectionSupervisor>,
    defaults: EntryDefaults,
}

impl LadderTrader {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        ledger: Arc<PositionLedger>,
        book: Arc<TrailBook>,
        supervisor: Arc<ProtectionSupervisor>,
        defaults: EntryDefaults,
    ) -> Self {
        Self {
            broker,
            ledger,
            book,
            supervisor,
            defaults,
        }
    }

    pub fn enter(&self, request: &EntryRequest, now: i64) -> Result<EntryOutcome, EntryError> {
        if request.quantity <= 0 {
            return Err(EntryError::Invalid(format!(
                "quantity must be > 0 (got {})",
                request.quantity
            )));
        }
        let stop_fraction = request.stop_fraction.unwrap_or(self.defaults.stop_fraction);
        if !(stop_fraction > 0.0 && stop_fraction < 1.0) {
            return Err(EntryError::Invalid(format!(
                "stop fraction must be in (0, 1) (got {stop_fraction})"
            )));
        }
        let target_fraction = request.target_fraction.or(self.defaults.target_fraction);
        if let Some(fraction) = target_fraction {
            if !(fraction > 0.0 && fraction.is_finite()) {
                return Err(EntryError::Invalid(format!(
                    "target fraction must be > 0 (got {fraction})"
                )));
            }
        }

        let pending = self.ledger.open_slot(
            &request.symbol,
            request.slot,
            request.quantity,
            stop_fraction,
            target_fraction,
            now,
        )?;

        let order = OrderRequest::market(&request.symbol, Side::Buy, request.quantity);
        let ack = match self.broker.place_order(&order) {
            Ok(ack) => ack,
            Err(err) if err.is_retryable() => {
                metrics::counter!("ratchet.entries.unconfirmed_total").increment(1);
                tracing::warn!(
                    trade_id = %pending.trade_id,
                    error = %err,
                    "entry order outcome unknown; slot held in PENDING_ENTRY"
                );
                return Err(EntryError::Unconfirmed {
                    trade_id: pending.trade_id,
                    source: err,
                });
            }
            Err(err) => {
                metrics::counter!("ratchet.entries.failed_total", "kind" => err.kind()).increment(1);
                if let Err(close_err) = self.ledger.close(
                    &pending.trade_id,
                    CloseReason::Error,
                    now,
                    json!({ "reason": "entry order failed", "error": err.to_string() }),
                ) {
                    tracing::error!(trade_id = %pending.trade_id, error = %close_err, "failed to release slot after entry failure");
                }
                return Err(EntryError::Broker {
                    trade_id: pending.trade_id,
                    source: err,
                });
            }
        };

        let position = self
            .ledger
            .record_entry_order(&pending.trade_id, &ack.order_id, now)?;
        let Some(price) = ack.average_price.filter(|p| *p > 0.0) else {
            tracing::info!(trade_id = %position.trade_id, order_id = %ack.order_id, "entry order accepted; awaiting fill");
            return Ok(EntryOutcome {
                position,
                protection_error: None,
            });
        };
        let quantity = ack
            .filled_quantity
            .filter(|q| *q > 0)
            .unwrap_or(request.quantity);
        let position = self
            .ledger
            .confirm_entry(&position.trade_id, price, quantity, now)?;
        metrics::counter!("ratchet.entries.filled_total").increment(1);

        match self.supervisor.protect(&position, now) {
            Ok(protected) => Ok(EntryOutcome {
                position: protected,
                protection_error: None,
            }),
            Err(err) => {
                tracing::warn!(trade_id = %position.trade_id, error = %err, "entry filled but protection failed; left OPEN");
                Ok(EntryOutcome {
                    position,
                    protection_error: Some(err.to_string()),
                })
            }
        }
    }

    /// CLOSED_MANUAL first so no loop acts on the position, then the broker
    /// side is cleaned up.
    pub fn close_manual(
        &self,
        trade_id: &str,
        flatten: bool,
        now: i64,
    ) -> Result<ManualClose, EntryError> {
        let before = self
            .ledger
            .get(trade_id)?
            .ok_or_else(|| LedgerError::NotFound(trade_id.to_string()))?;
        let position = self.ledger.close(
            trade_id,
            CloseReason::Manual,
            now,
            json!({ "flatten": flatten }),
        )?;
        self.book.remove_trade(trade_id);

        let mut protective_deleted = false;
        if let Some(protective_id) = before.protective_order_id.as_deref() {
            match self.broker.delete_protective_order(protective_id) {
                Ok(()) => protective_deleted = true,
                Err(err) => {
                    tracing::warn!(trade_id, protective_order_id = protective_id, error = %err, "failed to delete protective order on manual close")
                }
            }
        }

        let mut flatten_order_id = None;
        if flatten && before.status.is_filled() {
            let order = OrderRequest::market(&before.symbol, Side::Sell, before.quantity);
            let ack = self
                .broker
                .place_order(&order)
                .map_err(|source| EntryError::Broker {
                    trade_id: trade_id.to_string(),
                    source,
                })?;
            flatten_order_id = Some(ack.order_id);
        }

        tracing::info!(
            trade_id,
            protective_deleted,
            flattened = flatten_order_id.is_some(),
            "position closed manually"
        );
        Ok(ManualClose {
            position,
            protective_deleted,
            flatten_order_id,
        })
    }
}
