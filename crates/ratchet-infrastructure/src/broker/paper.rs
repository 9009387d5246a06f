use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ratchet_domain::repositories::broker::{BrokerError, BrokerGateway, BrokerResult};
use ratchet_domain::repositories::market_stream::{StreamError, StreamEvent, TickStream};
use ratchet_domain::services::trailing::round_to_tick;
use ratchet_domain::value_objects::order::{OrderAck, OrderRequest, OrderSnapshot, OrderState};
use ratchet_domain::value_objects::protective::{
    ProtectiveOrderRequest, ProtectiveOrderSnapshot, ProtectiveOrderStatus,
};
use ratchet_domain::value_objects::tick::Tick;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct PaperTrigger {
    request: ProtectiveOrderRequest,
    status: ProtectiveOrderStatus,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, f64>,
    orders: Vec<OrderSnapshot>,
    triggers: HashMap<String, PaperTrigger>,
    next_id: u64,
}

impl PaperState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// In-process broker: market orders fill at the last price, protective
/// orders fire when a price update crosses a leg.
#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a price and fires any active trigger it crosses.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock();
        state.prices.insert(symbol.to_string(), price);
        for (id, trigger) in state.triggers.iter_mut() {
            if trigger.request.symbol != symbol || trigger.status != ProtectiveOrderStatus::Active {
                continue;
            }
            let leg = if price <= trigger.request.stop_trigger() {
                Some(0)
            } else if trigger
                .request
                .target_trigger()
                .is_some_and(|target| price >= target)
            {
                Some(1)
            } else {
                None
            };
            if let Some(leg) = leg {
                trigger.status = ProtectiveOrderStatus::Triggered { leg: Some(leg) };
                metrics::counter!("ratchet.paper.triggers_fired_total").increment(1);
                tracing::info!(protective_order_id = %id, symbol, price, leg, "paper trigger fired");
            }
        }
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.state.lock().prices.get(symbol).copied()
    }
}

impl BrokerGateway for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck> {
        if request.quantity <= 0 {
            return Err(BrokerError::Rejected(format!(
                "quantity must be > 0 (got {})",
                request.quantity
            )));
        }
        let mut state = self.state.lock();
        let price = request
            .price
            .or_else(|| state.prices.get(&request.symbol).copied())
            .ok_or_else(|| BrokerError::Rejected(format!("no price for {}", request.symbol)))?;
        let order_id = state.next_id("paper-ord");
        state.orders.push(OrderSnapshot {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            state: OrderState::Complete,
            filled_quantity: request.quantity,
            average_price: Some(price),
        });
        tracing::info!(order_id = %order_id, symbol = %request.symbol, side = request.side.as_str(), quantity = request.quantity, price, "paper order filled");
        Ok(OrderAck {
            order_id,
            average_price: Some(price),
            filled_quantity: Some(request.quantity),
        })
    }

    fn place_protective_order(&self, request: &ProtectiveOrderRequest) -> BrokerResult<String> {
        let mut state = self.state.lock();
        if let Some(last) = state.prices.get(&request.symbol) {
            if request.stop_trigger() >= *last {
                return Err(BrokerError::Rejected(format!(
                    "stop {} is not below last price {last}",
                    request.stop_trigger()
                )));
            }
        }
        let id = state.next_id("paper-gtt");
        state.triggers.insert(
            id.clone(),
            PaperTrigger {
                request: request.clone(),
                status: ProtectiveOrderStatus::Active,
            },
        );
        Ok(id)
    }

    fn modify_protective_order(
        &self,
        protective_order_id: &str,
        request: &ProtectiveOrderRequest,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock();
        match state.triggers.get_mut(protective_order_id) {
            Some(trigger) if trigger.status == ProtectiveOrderStatus::Active => {
                trigger.request = request.clone();
                Ok(())
            }
            Some(trigger) => Err(BrokerError::Rejected(format!(
                "trigger {protective_order_id} is {:?}",
                trigger.status
            ))),
            None => Err(BrokerError::Rejected(format!(
                "unknown trigger {protective_order_id}"
            ))),
        }
    }

    fn delete_protective_order(&self, protective_order_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock();
        match state.triggers.get_mut(protective_order_id) {
            Some(trigger) => {
                trigger.status = ProtectiveOrderStatus::Deleted;
                Ok(())
            }
            None => Err(BrokerError::Rejected(format!(
                "unknown trigger {protective_order_id}"
            ))),
        }
    }

    fn last_prices(&self, symbols: &[String]) -> BrokerResult<HashMap<String, f64>> {
        let state = self.state.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| state.prices.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }

    fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        Ok(self.state.lock().orders.clone())
    }

    fn list_protective_orders(&self) -> BrokerResult<Vec<ProtectiveOrderSnapshot>> {
        Ok(self
            .state
            .lock()
            .triggers
            .iter()
            .map(|(id, trigger)| ProtectiveOrderSnapshot {
                id: id.clone(),
                symbol: trigger.request.symbol.clone(),
                status: trigger.status.clone(),
            })
            .collect())
    }
}

struct Walker {
    instrument_id: u32,
    symbol: String,
    price: f64,
}

/// Seeded random-walk tick feed that also drives the paper broker's prices.
pub struct PaperTickStream {
    broker: Arc<PaperBroker>,
    walkers: Vec<Walker>,
    rng: StdRng,
    interval: Duration,
    tick_size: f64,
    closed: bool,
}

impl PaperTickStream {
    pub fn new(
        broker: Arc<PaperBroker>,
        instruments: Vec<(u32, String)>,
        seed: u64,
        interval: Duration,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let walkers = instruments
            .into_iter()
            .map(|(instrument_id, symbol)| {
                let price = round_to_tick(rng.gen_range(100.0..2000.0), 0.05);
                broker.set_price(&symbol, price);
                Walker {
                    instrument_id,
                    symbol,
                    price,
                }
            })
            .collect();
        Self {
            broker,
            walkers,
            rng,
            interval,
            tick_size: 0.05,
            closed: false,
        }
    }
}

impl TickStream for PaperTickStream {
    fn next_event(&mut self) -> Result<StreamEvent, StreamError> {
        if self.closed {
            return Err(StreamError::Disconnected("paper stream closed".to_string()));
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        let observed_at = chrono::Utc::now().timestamp_millis();
        let mut ticks = Vec::with_capacity(self.walkers.len());
        for walker in &mut self.walkers {
            let step: f64 = self.rng.gen_range(-0.002..0.002);
            let next = round_to_tick(walker.price * (1.0 + step), self.tick_size);
            walker.price = next.max(self.tick_size);
            self.broker.set_price(&walker.symbol, walker.price);
            ticks.push(Tick::new(walker.instrument_id, walker.price, observed_at));
        }
        Ok(StreamEvent::Ticks(ticks))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_domain::value_objects::side::Side;

    #[test]
    fn market_orders_fill_at_the_last_price() {
        let broker = PaperBroker::new();
        assert!(broker
            .place_order(&OrderRequest::market("INFY", Side::Buy, 10))
            .is_err());
        broker.set_price("INFY", 1500.0);
        let ack = broker
            .place_order(&OrderRequest::market("INFY", Side::Buy, 10))
            .expect("fill");
        assert_eq!(ack.average_price, Some(1500.0));
        let orders = broker.list_open_orders().expect("orders");
        assert_eq!(orders[0].state, OrderState::Complete);
    }

    #[test]
    fn triggers_fire_on_the_crossed_leg() {
        let broker = PaperBroker::new();
        broker.set_price("INFY", 1500.0);
        let stop_only = ProtectiveOrderRequest::for_long("INFY", 10, 1500.0, 1485.0, None)
            .expect("request");
        let two_leg = ProtectiveOrderRequest::for_long("INFY", 10, 1500.0, 1470.0, Some(1530.0))
            .expect("request");
        let stop_id = broker.place_protective_order(&stop_only).expect("place");
        let oco_id = broker.place_protective_order(&two_leg).expect("place");

        broker.set_price("INFY", 1531.0);
        broker.set_price("INFY", 1480.0);
        let status: HashMap<String, ProtectiveOrderStatus> = broker
            .list_protective_orders()
            .expect("list")
            .into_iter()
            .map(|s| (s.id, s.status))
            .collect();
        assert_eq!(
            status[&oco_id],
            ProtectiveOrderStatus::Triggered { leg: Some(1) }
        );
        assert_eq!(
            status[&stop_id],
            ProtectiveOrderStatus::Triggered { leg: Some(0) }
        );
        // Fired triggers can no longer be modified.
        assert!(broker.modify_protective_order(&stop_id, &stop_only).is_err());
    }

    #[test]
    fn stop_above_market_is_rejected() {
        let broker = PaperBroker::new();
        broker.set_price("INFY", 100.0);
        let request =
            ProtectiveOrderRequest::for_long("INFY", 1, 100.0, 100.5, None).expect("request");
        assert!(broker.place_protective_order(&request).is_err());
    }

    #[test]
    fn seeded_stream_is_deterministic_and_feeds_the_broker() {
        let instruments = vec![(408065, "INFY".to_string()), (2953217, "TCS".to_string())];
        let first_broker = Arc::new(PaperBroker::new());
        let mut first = PaperTickStream::new(first_broker.clone(), instruments.clone(), 7, Duration::ZERO);
        let mut second =
            PaperTickStream::new(Arc::new(PaperBroker::new()), instruments, 7, Duration::ZERO);

        let a = first.next_event().expect("event");
        let b = second.next_event().expect("event");
        let (StreamEvent::Ticks(a), StreamEvent::Ticks(b)) = (a, b) else {
            panic!("expected ticks");
        };
        assert_eq!(a.len(), 2);
        assert_eq!(
            a.iter().map(|t| t.price).collect::<Vec<_>>(),
            b.iter().map(|t| t.price).collect::<Vec<_>>()
        );
        assert_eq!(first_broker.price("INFY"), Some(a[0].price));

        first.close();
        assert!(first.next_event().is_err());
    }
}
