use crate::value_objects::order::{OrderAck, OrderRequest, OrderSnapshot};
use crate::value_objects::protective::{ProtectiveOrderRequest, ProtectiveOrderSnapshot};
use std::collections::HashMap;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// Network blips, timeouts, rate limits, 5xx. Safe to retry next cycle.
    #[error("retryable broker error: {0}")]
    Retryable(String),
    /// The broker understood and refused the request.
    #[error("broker rejected request: {0}")]
    Rejected(String),
    /// Credentials or session are unusable; retrying will not help.
    #[error("fatal broker error: {0}")]
    Fatal(String),
    #[error("operation not supported by gateway: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Retryable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Retryable(_) => "retryable",
            BrokerError::Rejected(_) => "rejected",
            BrokerError::Fatal(_) => "fatal",
            BrokerError::Unsupported(_) => "unsupported",
        }
    }
}

pub trait BrokerGateway: Send + Sync {
    fn name(&self) -> &str;

    fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck>;

    fn place_protective_order(&self, request: &ProtectiveOrderRequest) -> BrokerResult<String>;

    fn supports_protective_modify(&self) -> bool {
        true
    }

    fn modify_protective_order(
        &self,
        protective_order_id: &str,
        request: &ProtectiveOrderRequest,
    ) -> BrokerResult<()>;

    fn delete_protective_order(&self, protective_order_id: &str) -> BrokerResult<()>;

    /// One call for every symbol; symbols the broker cannot quote are omitted.
    fn last_prices(&self, symbols: &[String]) -> BrokerResult<HashMap<String, f64>>;

    fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>>;

    fn list_protective_orders(&self) -> BrokerResult<Vec<ProtectiveOrderSnapshot>>;
}
