/// A single last-traded-price observation from the streaming feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub instrument_id: u32,
    pub price: f64,
    /// Epoch milliseconds (UTC).
    pub observed_at: i64,
}

impl Tick {
    pub fn new(instrument_id: u32, price: f64, observed_at: i64) -> Self {
        Self {
            instrument_id,
            price,
            observed_at,
        }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_price(self.price)
    }
}

pub fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}
