use crate::value_objects::side::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveOrderKind {
    /// Stop only.
    SingleLeg,
    /// Stop plus target (one-cancels-other).
    TwoLeg,
}

impl ProtectiveOrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectiveOrderKind::SingleLeg => "single",
            ProtectiveOrderKind::TwoLeg => "two-leg",
        }
    }

    pub fn leg_count(&self) -> usize {
        match self {
            ProtectiveOrderKind::SingleLeg => 1,
            ProtectiveOrderKind::TwoLeg => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLeg {
    pub side: Side,
    pub trigger_price: f64,
    pub quantity: i64,
}

/// Leg 0 is always the stop; leg 1, when present, is the target.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveOrderRequest {
    pub symbol: String,
    pub kind: ProtectiveOrderKind,
    /// Last traded price at submission; brokers validate triggers against it.
    pub reference_price: f64,
    pub legs: Vec<ProtectiveLeg>,
}

impl ProtectiveOrderRequest {
    /// Builds the exit order protecting a long holding.
    pub fn for_long(
        symbol: &str,
        quantity: i64,
        reference_price: f64,
        stop: f64,
        target: Option<f64>,
    ) -> Result<Self, String> {
        if quantity <= 0 {
            return Err(format!("protective quantity must be > 0 (got {quantity})"));
        }
        if !(stop.is_finite() && stop > 0.0) {
            return Err(format!("invalid stop trigger {stop} for {symbol}"));
        }
        let mut legs = vec![ProtectiveLeg {
            side: Side::Sell,
            trigger_price: stop,
            quantity,
        }];
        let kind = match target {
            Some(target) => {
                if target <= stop {
                    return Err(format!(
                        "target {target} must be above stop {stop} for {symbol}"
                    ));
                }
                legs.push(ProtectiveLeg {
                    side: Side::Sell,
                    trigger_price: target,
                    quantity,
                });
                ProtectiveOrderKind::TwoLeg
            }
            None => ProtectiveOrderKind::SingleLeg,
        };
        Ok(Self {
            symbol: symbol.to_string(),
            kind,
            reference_price,
            legs,
        })
    }

    pub fn stop_trigger(&self) -> f64 {
        self.legs.first().map(|leg| leg.trigger_price).unwrap_or(0.0)
    }

    pub fn target_trigger(&self) -> Option<f64> {
        self.legs.get(1).map(|leg| leg.trigger_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectiveOrderStatus {
    Active,
    /// Index of the leg that fired, when the broker reports it.
    Triggered { leg: Option<usize> },
    Cancelled,
    Expired,
    Rejected,
    Deleted,
}

impl ProtectiveOrderStatus {
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            ProtectiveOrderStatus::Cancelled
                | ProtectiveOrderStatus::Expired
                | ProtectiveOrderStatus::Rejected
                | ProtectiveOrderStatus::Deleted
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveOrderSnapshot {
    pub id: String,
    pub symbol: String,
    pub status: ProtectiveOrderStatus,
}

#[cfg(test)]
mod tests {
    use super::{ProtectiveOrderKind, ProtectiveOrderRequest};

    #[test]
    fn target_makes_a_two_leg_order() {
        let req = ProtectiveOrderRequest::for_long("INFY", 5, 100.0, 99.0, Some(102.0)).unwrap();
        assert_eq!(req.kind, ProtectiveOrderKind::TwoLeg);
        assert_eq!(req.stop_trigger(), 99.0);
        assert_eq!(req.target_trigger(), Some(102.0));

        let single = ProtectiveOrderRequest::for_long("INFY", 5, 100.0, 99.0, None).unwrap();
        assert_eq!(single.kind, ProtectiveOrderKind::SingleLeg);
        assert_eq!(single.legs.len(), 1);
    }

    #[test]
    fn rejects_inverted_levels_and_empty_quantity() {
        assert!(ProtectiveOrderRequest::for_long("INFY", 5, 100.0, 99.0, Some(98.0)).is_err());
        assert!(ProtectiveOrderRequest::for_long("INFY", 0, 100.0, 99.0, None).is_err());
        assert!(ProtectiveOrderRequest::for_long("INFY", 1, 100.0, f64::NAN, None).is_err());
    }
}
