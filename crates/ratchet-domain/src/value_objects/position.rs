use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    PendingEntry,
    Open,
    Trailing,
    ClosedTarget,
    ClosedStop,
    ClosedManual,
    ClosedError,
}

impl PositionStatus {
    pub const ALL: [PositionStatus; 7] = [
        PositionStatus::PendingEntry,
        PositionStatus::Open,
        PositionStatus::Trailing,
        PositionStatus::ClosedTarget,
        PositionStatus::ClosedStop,
        PositionStatus::ClosedManual,
        PositionStatus::ClosedError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::PendingEntry => "PENDING_ENTRY",
            PositionStatus::Open => "OPEN",
            PositionStatus::Trailing => "TRAILING",
            PositionStatus::ClosedTarget => "CLOSED_TARGET",
            PositionStatus::ClosedStop => "CLOSED_STOP",
            PositionStatus::ClosedManual => "CLOSED_MANUAL",
            PositionStatus::ClosedError => "CLOSED_ERROR",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown position status: {value}"))
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PositionStatus::ClosedTarget
                | PositionStatus::ClosedStop
                | PositionStatus::ClosedManual
                | PositionStatus::ClosedError
        )
    }

    /// OPEN or TRAILING: the slot holds shares at the broker.
    pub fn is_filled(&self) -> bool {
        matches!(self, PositionStatus::Open | PositionStatus::Trailing)
    }

    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (from, _) if from.is_closed() => false,
            (_, ClosedManual) => true,
            (PendingEntry, PendingEntry | Open | ClosedError) => true,
            (Open, Trailing | ClosedError) => true,
            (Trailing, Trailing | Open | ClosedTarget | ClosedStop | ClosedError) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Target,
    Stop,
    Manual,
    Error,
}

impl CloseReason {
    pub fn status(&self) -> PositionStatus {
        match self {
            CloseReason::Target => PositionStatus::ClosedTarget,
            CloseReason::Stop => PositionStatus::ClosedStop,
            CloseReason::Manual => PositionStatus::ClosedManual,
            CloseReason::Error => PositionStatus::ClosedError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid transition for {trade_id}: {from} -> {to}")]
pub struct TransitionError {
    pub trade_id: String,
    pub from: PositionStatus,
    pub to: PositionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trade_id: String,
    pub symbol: String,
    pub slot: u8,
    pub entry_price: Option<f64>,
    pub quantity: i64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub stop_fraction: f64,
    pub target_fraction: Option<f64>,
    pub broker_order_id: Option<String>,
    pub protective_order_id: Option<String>,
    pub status: PositionStatus,
    /// Epoch seconds.
    pub opened_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

impl Position {
    pub fn pending(
        symbol: &str,
        slot: u8,
        quantity: i64,
        stop_fraction: f64,
        target_fraction: Option<f64>,
        now: i64,
    ) -> Self {
        Self {
            trade_id: trade_id_for(symbol, slot, now),
            symbol: symbol.to_string(),
            slot,
            entry_price: None,
            quantity,
            stop_price: None,
            target_price: None,
            stop_fraction,
            target_fraction,
            broker_order_id: None,
            protective_order_id: None,
            status: PositionStatus::PendingEntry,
            opened_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn transition(&mut self, next: PositionStatus, now: i64) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                trade_id: self.trade_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_closed() {
            self.closed_at = Some(now);
        }
        Ok(())
    }

    pub fn needs_protection(&self) -> bool {
        self.status == PositionStatus::Open && self.protective_order_id.is_none()
    }
}

/// Trade ids embed symbol, slot and open time so they stay unique while the
/// ledger forbids two live positions on one slot.
pub fn trade_id_for(symbol: &str, slot: u8, now: i64) -> String {
    format!("{symbol}-S{slot}-{now}")
}
