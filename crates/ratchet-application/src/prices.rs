use parking_lot::Mutex;
use ratchet_domain::value_objects::tick::is_valid_price;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct PriceMaps {
    by_id: HashMap<u32, f64>,
    by_symbol: HashMap<String, f64>,
}

/// Last traded price per instrument, readable by id or symbol.
#[derive(Debug)]
pub struct PriceStore {
    id_to_symbol: HashMap<u32, String>,
    inner: Mutex<PriceMaps>,
}

impl PriceStore {
    pub fn new(id_to_symbol: HashMap<u32, String>) -> Self {
        Self {
            id_to_symbol,
            inner: Mutex::new(PriceMaps::default()),
        }
    }

    /// Returns false for ids outside the universe and for unusable prices.
    pub fn update(&self, instrument_id: u32, price: f64) -> bool {
        let Some(symbol) = self.id_to_symbol.get(&instrument_id) else {
            return false;
        };
        if !is_valid_price(price) {
            return false;
        }
        let mut maps = self.inner.lock();
        maps.by_id.insert(instrument_id, price);
        if let Some(slot) = maps.by_symbol.get_mut(symbol) {
            *slot = price;
        } else {
            maps.by_symbol.insert(symbol.clone(), price);
        }
        true
    }

    pub fn read(&self, symbol: &str) -> Option<f64> {
        self.inner.lock().by_symbol.get(symbol).copied()
    }

    pub fn read_id(&self, instrument_id: u32) -> Option<f64> {
        self.inner.lock().by_id.get(&instrument_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.inner.lock().by_symbol.clone()
    }

    pub fn symbol_for(&self, instrument_id: u32) -> Option<&str> {
        self.id_to_symbol.get(&instrument_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::PriceStore;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    fn store() -> PriceStore {
        PriceStore::new(HashMap::from([
            (408065, "INFY".to_string()),
            (738561, "RELIANCE".to_string()),
        ]))
    }

    #[test]
    fn updates_both_views() {
        let prices = store();
        assert!(prices.update(408065, 1_512.35));
        assert_eq!(prices.read("INFY"), Some(1_512.35));
        assert_eq!(prices.read_id(408065), Some(1_512.35));
        assert!(prices.read("RELIANCE").is_none());
        assert_eq!(prices.snapshot().len(), 1);
    }

    #[test]
    fn ignores_unknown_ids_and_bad_prices() {
        let prices = store();
        assert!(!prices.update(1, 10.0));
        assert!(!prices.update(408065, f64::NAN));
        assert!(!prices.update(408065, 0.0));
        assert!(prices.snapshot().is_empty());
    }

    #[test]
    fn concurrent_writers_leave_a_written_value() {
        let prices = Arc::new(store());
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let prices = prices.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        prices.update(738561, 2_000.0 + f64::from(n * 1_000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let last = prices.read("RELIANCE").expect("price");
        assert!((2_000.0..6_000.0).contains(&last));
        assert_eq!(prices.read_id(738561), Some(last));
    }
}
