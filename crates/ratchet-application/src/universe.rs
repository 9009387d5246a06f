use ratchet_domain::services::instruments::InstrumentMap;
use ratchet_domain::value_objects::instrument::Instrument;
use std::collections::{BTreeMap, HashMap};

pub const ALL_UNIVERSE: &str = "all";

/// Resolves a universe selector against the instrument dump for one exchange.
/// `all` takes every instrument; any other selector must name a configured
/// symbol list. Unknown symbols are skipped; an empty result is an error.
pub fn resolve_universe(
    selector: &str,
    universes: &BTreeMap<String, Vec<String>>,
    instruments: &[Instrument],
    exchange: &str,
) -> Result<InstrumentMap, String> {
    let on_exchange: Vec<&Instrument> = instruments
        .iter()
        .filter(|i| i.exchange.eq_ignore_ascii_case(exchange))
        .collect();

    let selected: Vec<Instrument> = if selector == ALL_UNIVERSE {
        on_exchange.into_iter().cloned().collect()
    } else {
        let symbols = universes.get(selector).ok_or_else(|| {
            let known: Vec<&str> = universes.keys().map(String::as_str).collect();
            format!(
                "unknown universe `{selector}` (configured: {}; or `{ALL_UNIVERSE}`)",
                known.join(", ")
            )
        })?;
        let by_symbol: HashMap<&str, &Instrument> = on_exchange
            .iter()
            .map(|i| (i.symbol.as_str(), *i))
            .collect();
        let mut selected = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match by_symbol.get(symbol.trim()) {
                Some(instrument) => selected.push((*instrument).clone()),
                None => {
                    tracing::warn!(universe = selector, symbol = %symbol, exchange, "symbol not in instrument dump; skipped")
                }
            }
        }
        selected
    };

    let map = InstrumentMap::new(selected);
    if map.is_empty() {
        return Err(format!(
            "universe `{selector}` resolved no instruments on {exchange}"
        ));
    }
    metrics::gauge!("ratchet.universe.instruments").set(map.len() as f64);
    tracing::info!(universe = selector, exchange, instruments = map.len(), "universe resolved");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(id: u32, symbol: &str, exchange: &str) -> Instrument {
        Instrument {
            instrument_id: id,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            tick_size: Some(0.05),
            lot_size: 1,
        }
    }

    fn dump() -> Vec<Instrument> {
        vec![
            instrument(408065, "INFY", "NSE"),
            instrument(341249, "HDFCBANK", "NSE"),
            instrument(500209, "INFY", "BSE"),
        ]
    }

    fn universes() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            "it".to_string(),
            vec!["INFY".to_string(), "TCS".to_string()],
        )])
    }

    #[test]
    fn named_universe_skips_unknown_symbols() {
        let map = resolve_universe("it", &universes(), &dump(), "NSE").expect("resolve");
        assert_eq!(map.symbols(), vec!["INFY".to_string()]);
        assert_eq!(map.by_symbol("INFY").map(|i| i.instrument_id), Some(408065));
    }

    #[test]
    fn all_selects_the_whole_exchange() {
        let map = resolve_universe("all", &universes(), &dump(), "nse").expect("resolve");
        assert_eq!(map.ids(), vec![341249, 408065]);
    }

    #[test]
    fn empty_or_unknown_universe_is_fatal() {
        let err = resolve_universe("banks", &universes(), &dump(), "NSE").expect_err("unknown");
        assert!(err.contains("unknown universe"));
        let err = resolve_universe("it", &universes(), &dump(), "MCX").expect_err("empty");
        assert!(err.contains("resolved no instruments"));
    }
}
