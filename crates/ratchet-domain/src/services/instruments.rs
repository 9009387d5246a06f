use crate::services::tick_size::{fallback_tick_size, TickBand};
use crate::value_objects::instrument::Instrument;
use std::collections::HashMap;

/// Static identifier/symbol lookup for the resolved universe.
#[derive(Debug, Clone, Default)]
pub struct InstrumentMap {
    by_id: HashMap<u32, Instrument>,
    id_by_symbol: HashMap<String, u32>,
}

impl InstrumentMap {
    pub fn new(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        let mut map = Self::default();
        for instrument in instruments {
            map.insert(instrument);
        }
        map
    }

    /// Later entries for the same symbol replace earlier ones.
    pub fn insert(&mut self, instrument: Instrument) {
        if let Some(previous) = self.id_by_symbol.get(&instrument.symbol).copied() {
            self.by_id.remove(&previous);
        }
        self.id_by_symbol
            .insert(instrument.symbol.clone(), instrument.instrument_id);
        self.by_id.insert(instrument.instrument_id, instrument);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, instrument_id: u32) -> Option<&Instrument> {
        self.by_id.get(&instrument_id)
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Instrument> {
        self.id_by_symbol
            .get(symbol)
            .and_then(|id| self.by_id.get(id))
    }

    pub fn symbol_for(&self, instrument_id: u32) -> Option<&str> {
        self.by_id.get(&instrument_id).map(|i| i.symbol.as_str())
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.id_by_symbol.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn id_to_symbol(&self) -> HashMap<u32, String> {
        self.by_id
            .iter()
            .map(|(id, instrument)| (*id, instrument.symbol.clone()))
            .collect()
    }

    /// Instrument tick size, or the banded guess for `reference_price`.
    pub fn tick_size(&self, symbol: &str, reference_price: f64, bands: &[TickBand]) -> f64 {
        self.by_symbol(symbol)
            .and_then(|i| i.tick_size)
            .filter(|tick| tick.is_finite() && *tick > 0.0)
            .unwrap_or_else(|| fallback_tick_size(reference_price, bands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tick_size::default_tick_bands;

    fn instrument(id: u32, symbol: &str, tick: Option<f64>) -> Instrument {
        Instrument {
            instrument_id: id,
            symbol: symbol.to_string(),
            exchange: "NSE".to_string(),
            tick_size: tick,
            lot_size: 1,
        }
    }

    #[test]
    fn resolves_both_directions() {
        let map = InstrumentMap::new(vec![
            instrument(408065, "INFY", Some(0.05)),
            instrument(738561, "RELIANCE", None),
        ]);
        assert_eq!(map.symbol_for(408065), Some("INFY"));
        assert_eq!(map.by_symbol("RELIANCE").map(|i| i.instrument_id), Some(738561));
        assert_eq!(map.ids(), vec![408065, 738561]);
        assert!(map.symbol_for(1).is_none());
    }

    #[test]
    fn tick_size_falls_back_to_bands() {
        let map = InstrumentMap::new(vec![
            instrument(1, "A", Some(0.05)),
            instrument(2, "B", None),
            instrument(3, "C", Some(0.0)),
        ]);
        let bands = default_tick_bands();
        assert_eq!(map.tick_size("A", 50.0, &bands), 0.05);
        assert_eq!(map.tick_size("B", 50.0, &bands), 0.01);
        assert_eq!(map.tick_size("C", 2_000.0, &bands), 0.10);
        assert_eq!(map.tick_size("UNKNOWN", 500.0, &bands), 0.05);
    }

    #[test]
    fn reinserting_a_symbol_replaces_its_id() {
        let mut map = InstrumentMap::new(vec![instrument(1, "A", None)]);
        map.insert(instrument(9, "A", None));
        assert_eq!(map.len(), 1);
        assert!(map.get(1).is_none());
        assert_eq!(map.symbol_for(9), Some("A"));
    }
}
