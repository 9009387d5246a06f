use crate::value_objects::protective::ProtectiveOrderKind;
use crate::value_objects::trail_state::TrailState;

/// Rounds to the nearest multiple of `tick`, then trims float noise to the
/// tick's decimal precision so 99.9 stays 99.9 and not 99.90000000000001.
pub fn round_to_tick(value: f64, tick: f64) -> f64 {
    if !(tick.is_finite() && tick > 0.0) {
        return value;
    }
    let ticks = (value / tick).round();
    let decimals = tick_decimals(tick);
    let scale = 10f64.powi(decimals);
    (ticks * tick * scale).round() / scale
}

fn tick_decimals(tick: f64) -> i32 {
    let mut decimals = 0;
    let mut scaled = tick;
    while decimals < 8 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Stop trigger for a long position at `price`. Nearest-tick rounding can
/// land on or above `price` when `stop_fraction` is under half a tick, so the
/// result is capped at the last tick strictly below `price`.
pub fn stop_level(price: f64, stop_fraction: f64, tick: f64) -> f64 {
    let candidate = round_to_tick(price * (1.0 - stop_fraction), tick);
    if candidate < price || !(tick.is_finite() && tick > 0.0) {
        return candidate;
    }
    let below = (price / tick - 1e-9).ceil() - 1.0;
    round_to_tick(below * tick, tick)
}

/// Initial protective levels for a long entry.
pub fn initial_levels(
    reference_price: f64,
    stop_fraction: f64,
    target_fraction: Option<f64>,
    tick: f64,
) -> (f64, Option<f64>) {
    let stop = stop_level(reference_price, stop_fraction, tick);
    let target = target_fraction.map(|f| round_to_tick(reference_price * (1.0 + f), tick));
    (stop, target)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailAdjustment {
    pub new_trigger: f64,
    pub new_target: Option<f64>,
    pub gap: f64,
}

impl TrailState {
    /// Ratchet rule: raise only when price has pulled more than `trail_threshold`
    /// away from the trigger and the rounded candidate is strictly higher.
    pub fn evaluate(&self, price: f64, trail_threshold: f64) -> Option<TrailAdjustment> {
        if !(price.is_finite() && price > 0.0) {
            return None;
        }
        let candidate = stop_level(price, self.stop_fraction, self.tick_increment);
        let gap = (price - self.current_trigger) / price;
        if gap <= trail_threshold || candidate <= self.current_trigger {
            return None;
        }
        let new_target = match (self.order_kind, self.target_fraction) {
            (ProtectiveOrderKind::TwoLeg, Some(fraction)) => {
                Some(round_to_tick(price * (1.0 + fraction), self.tick_increment))
            }
            (ProtectiveOrderKind::TwoLeg, None) => self.current_target,
            (ProtectiveOrderKind::SingleLeg, _) => None,
        };
        Some(TrailAdjustment {
            new_trigger: candidate,
            new_target,
            gap,
        })
    }

    pub fn apply(&mut self, adjustment: &TrailAdjustment, protective_order_id: String) {
        self.current_trigger = self.current_trigger.max(adjustment.new_trigger);
        self.current_target = adjustment.new_target;
        self.protective_order_id = protective_order_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(trigger: f64, kind: ProtectiveOrderKind) -> TrailState {
        TrailState {
            trade_id: "X-S1-0".to_string(),
            protective_order_id: "gtt-1".to_string(),
            symbol: "X".to_string(),
            quantity: 10,
            stop_fraction: 0.001,
            tick_increment: 0.05,
            current_trigger: trigger,
            order_kind: kind,
            target_fraction: match kind {
                ProtectiveOrderKind::TwoLeg => Some(0.02),
                ProtectiveOrderKind::SingleLeg => None,
            },
            current_target: None,
        }
    }

    #[test]
    fn candidate_rounds_to_tick_exactly() {
        assert_eq!(round_to_tick(100.00 * 0.999, 0.05), 99.90);
        assert_eq!(round_to_tick(101.23, 0.05), 101.25);
        assert_eq!(round_to_tick(0.1 + 0.2, 0.01), 0.3);
        assert_eq!(round_to_tick(12.5, 0.0), 12.5);
    }

    #[test]
    fn stop_stays_below_price_for_sub_tick_fractions() {
        // 100.00 * 0.9999 = 99.99 would round up to 100.00.
        assert_eq!(stop_level(100.00, 0.0001, 0.05), 99.95);
        assert_eq!(stop_level(100.02, 0.0001, 0.05), 100.0);
        assert_eq!(stop_level(100.00, 0.001, 0.05), 99.90);

        let s = TrailState {
            stop_fraction: 0.0001,
            ..state(99.00, ProtectiveOrderKind::SingleLeg)
        };
        let adj = s.evaluate(100.00, 0.001).expect("raise");
        assert_eq!(adj.new_trigger, 99.95);
    }

    #[test]
    fn raises_trigger_when_gap_exceeds_threshold() {
        let s = state(99.00, ProtectiveOrderKind::SingleLeg);
        let adj = s.evaluate(100.00, 0.001).expect("raise");
        assert_eq!(adj.new_trigger, 99.90);
        assert_eq!(adj.new_target, None);
    }

    #[test]
    fn no_update_when_gap_within_threshold() {
        let s = state(99.95, ProtectiveOrderKind::SingleLeg);
        assert_eq!(s.evaluate(100.00, 0.001), None);
    }

    #[test]
    fn never_lowers_the_trigger() {
        let s = state(99.90, ProtectiveOrderKind::SingleLeg);
        assert_eq!(s.evaluate(95.00, 0.001), None);
        assert_eq!(s.evaluate(99.95, 0.0), None);
    }

    #[test]
    fn two_leg_target_follows_current_price() {
        let s = state(95.00, ProtectiveOrderKind::TwoLeg);
        let adj = s.evaluate(100.00, 0.001).expect("raise");
        assert_eq!(adj.new_trigger, 99.90);
        assert_eq!(adj.new_target, Some(102.00));
    }

    #[test]
    fn apply_keeps_trigger_monotonic() {
        let mut s = state(99.00, ProtectiveOrderKind::SingleLeg);
        let adj = s.evaluate(100.00, 0.001).unwrap();
        s.apply(&adj, "gtt-2".to_string());
        assert_eq!(s.current_trigger, 99.90);
        assert_eq!(s.protective_order_id, "gtt-2");
    }

    #[test]
    fn initial_levels_round_both_legs() {
        let (stop, target) = initial_levels(250.0, 0.01, Some(0.03), 0.05);
        assert_eq!(stop, 247.5);
        assert_eq!(target, Some(257.5));
    }
}
