use crate::value_objects::side::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub kind: OrderKind,
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: i64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            kind: OrderKind::Market,
            price: None,
        }
    }
}

/// Acknowledgement returned by the broker on order placement. Brokers that fill
/// synchronously (paper) report the average price immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub average_price: Option<f64>,
    pub filled_quantity: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Open,
    Complete,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "COMPLETE" | "FILLED" => OrderState::Complete,
            "CANCELLED" | "CANCELED" => OrderState::Cancelled,
            "REJECTED" => OrderState::Rejected,
            _ => OrderState::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub symbol: String,
    pub state: OrderState,
    pub filled_quantity: i64,
    pub average_price: Option<f64>,
}
