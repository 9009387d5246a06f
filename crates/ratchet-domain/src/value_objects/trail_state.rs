use crate::value_objects::protective::ProtectiveOrderKind;

/// In-memory trailing bookkeeping for one protective order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailState {
    pub trade_id: String,
    pub protective_order_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub stop_fraction: f64,
    pub tick_increment: f64,
    pub current_trigger: f64,
    pub order_kind: ProtectiveOrderKind,
    pub target_fraction: Option<f64>,
    pub current_target: Option<f64>,
}
