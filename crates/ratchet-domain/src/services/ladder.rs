use crate::value_objects::position::{Position, PositionStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LadderPolicy {
    pub max_slots: u8,
    pub cooldown_seconds: i64,
}

impl Default for LadderPolicy {
    fn default() -> Self {
        Self {
            max_slots: 3,
            cooldown_seconds: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LadderRejection {
    #[error("slot {slot} is outside the ladder (1..={max_slots})")]
    SlotOutOfRange { slot: u8, max_slots: u8 },
    #[error("slot {slot} is already held by {trade_id}")]
    SlotOccupied { slot: u8, trade_id: String },
    #[error("slot {slot} requires slot {blocking_slot} to be filled first (currently {state})")]
    LowerSlotNotFilled {
        slot: u8,
        blocking_slot: u8,
        state: String,
    },
    #[error("symbol is cooling down after a stop-out ({remaining_seconds}s remaining)")]
    CoolingDown { remaining_seconds: i64 },
}

impl LadderPolicy {
    /// Decides whether `slot` may open given every position ever recorded for
    /// the symbol (closed rows included, for the stop-out cooldown).
    pub fn check(&self, slot: u8, positions: &[Position], now: i64) -> Result<(), LadderRejection> {
        if slot == 0 || slot > self.max_slots {
            return Err(LadderRejection::SlotOutOfRange {
                slot,
                max_slots: self.max_slots,
            });
        }

        let live_in = |s: u8| {
            positions
                .iter()
                .find(|p| p.slot == s && !p.status.is_closed())
        };

        if let Some(existing) = live_in(slot) {
            return Err(LadderRejection::SlotOccupied {
                slot,
                trade_id: existing.trade_id.clone(),
            });
        }

        for lower in 1..slot {
            match live_in(lower) {
                Some(p) if p.status.is_filled() => {}
                Some(p) => {
                    return Err(LadderRejection::LowerSlotNotFilled {
                        slot,
                        blocking_slot: lower,
                        state: p.status.to_string(),
                    })
                }
                None => {
                    return Err(LadderRejection::LowerSlotNotFilled {
                        slot,
                        blocking_slot: lower,
                        state: "EMPTY".to_string(),
                    })
                }
            }
        }

        if let Some(last_stop) = last_stop_out(positions) {
            let elapsed = now - last_stop;
            if elapsed < self.cooldown_seconds {
                return Err(LadderRejection::CoolingDown {
                    remaining_seconds: self.cooldown_seconds - elapsed,
                });
            }
        }
        Ok(())
    }
}

pub fn last_stop_out(positions: &[Position]) -> Option<i64> {
    positions
        .iter()
        .filter(|p| p.status == PositionStatus::ClosedStop)
        .filter_map(|p| p.closed_at)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(slot: u8, status: PositionStatus, closed_at: Option<i64>) -> Position {
        let mut p = Position::pending("X", slot, 1, 0.01, None, 0);
        p.status = status;
        p.closed_at = closed_at;
        p
    }

    #[test]
    fn slot_one_opens_on_an_empty_ladder() {
        assert!(LadderPolicy::default().check(1, &[], 0).is_ok());
    }

    #[test]
    fn slot_two_waits_for_pending_slot_one() {
        let positions = vec![position(1, PositionStatus::PendingEntry, None)];
        let err = LadderPolicy::default().check(2, &positions, 0).unwrap_err();
        assert!(matches!(
            err,
            LadderRejection::LowerSlotNotFilled { blocking_slot: 1, .. }
        ));
    }

    #[test]
    fn slots_fill_strictly_in_order() {
        let policy = LadderPolicy::default();
        let positions = vec![
            position(1, PositionStatus::Trailing, None),
            position(2, PositionStatus::Open, None),
        ];
        assert!(policy.check(3, &positions, 0).is_ok());
        assert!(policy.check(3, &positions[..1], 0).is_err());
        assert!(matches!(
            policy.check(2, &positions, 0),
            Err(LadderRejection::SlotOccupied { slot: 2, .. })
        ));
        assert!(matches!(
            policy.check(4, &positions, 0),
            Err(LadderRejection::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn cooldown_follows_latest_stop_out_on_any_slot() {
        let policy = LadderPolicy {
            max_slots: 3,
            cooldown_seconds: 600,
        };
        let positions = vec![
            position(1, PositionStatus::ClosedStop, Some(1_000)),
            position(2, PositionStatus::ClosedStop, Some(1_300)),
        ];
        assert_eq!(
            policy.check(1, &positions, 1_500),
            Err(LadderRejection::CoolingDown {
                remaining_seconds: 400
            })
        );
        assert!(policy.check(1, &positions, 1_900).is_ok());
    }

    #[test]
    fn target_exits_do_not_start_a_cooldown() {
        let positions = vec![position(1, PositionStatus::ClosedTarget, Some(1_000))];
        assert!(LadderPolicy::default().check(1, &positions, 1_001).is_ok());
    }
}
