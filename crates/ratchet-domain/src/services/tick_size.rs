use serde::{Deserialize, Serialize};

/// Tick size used for prices at or above `min_price` (until the next band).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickBand {
    pub min_price: f64,
    pub tick: f64,
}

/// Guess used when instrument metadata has no tick size. Bands follow the
/// NSE price-linked tick schedule; override them in config for other venues.
pub fn default_tick_bands() -> Vec<TickBand> {
    vec![
        TickBand {
            min_price: 0.0,
            tick: 0.01,
        },
        TickBand {
            min_price: 250.0,
            tick: 0.05,
        },
        TickBand {
            min_price: 1000.0,
            tick: 0.10,
        },
    ]
}

pub fn fallback_tick_size(price: f64, bands: &[TickBand]) -> f64 {
    bands
        .iter()
        .filter(|band| price >= band.min_price)
        .max_by(|a, b| a.min_price.total_cmp(&b.min_price))
        .map(|band| band.tick)
        .unwrap_or(0.05)
}
