use ratchet_domain::value_objects::instrument::Instrument;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One row of the broker's instrument dump. Columns the pipeline never uses
/// are still declared so a reordered dump fails loudly instead of shifting.
#[derive(Debug, Deserialize)]
pub struct InstrumentRecord {
    pub instrument_token: u32,
    pub exchange_token: Option<String>,
    pub tradingsymbol: String,
    pub name: Option<String>,
    pub last_price: Option<f64>,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub tick_size: Option<f64>,
    pub lot_size: Option<i64>,
    pub instrument_type: Option<String>,
    pub segment: Option<String>,
    pub exchange: String,
}

impl InstrumentRecord {
    fn into_instrument(self) -> Instrument {
        Instrument {
            instrument_id: self.instrument_token,
            symbol: self.tradingsymbol,
            exchange: self.exchange,
            tick_size: self.tick_size.filter(|t| t.is_finite() && *t > 0.0),
            lot_size: self.lot_size.filter(|l| *l > 0).unwrap_or(1),
        }
    }
}

pub fn load_instruments_csv(path: &Path) -> Result<Vec<Instrument>, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open instruments CSV {}: {}", path.display(), err))?;
    let instruments = read_instruments(file)?;
    tracing::info!(path = %path.display(), instruments = instruments.len(), "loaded instrument dump");
    Ok(instruments)
}

/// Malformed rows are skipped and counted; an unreadable header is an error.
pub fn read_instruments<R: Read>(reader: R) -> Result<Vec<Instrument>, String> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    reader
        .headers()
        .map_err(|err| format!("failed to read instruments header: {err}"))?;

    let mut instruments = Vec::new();
    let mut skipped = 0usize;
    for (idx, result) in reader.deserialize::<InstrumentRecord>().enumerate() {
        match result {
            Ok(record) => instruments.push(record.into_instrument()),
            Err(err) => {
                skipped += 1;
                if skipped <= 5 {
                    tracing::warn!(row = idx + 2, error = %err, "skipping malformed instrument row");
                }
            }
        }
    }
    if skipped > 0 {
        metrics::counter!("ratchet.infra.instruments.skipped_total").increment(skipped as u64);
        tracing::warn!(skipped, "instrument rows skipped");
    }
    Ok(instruments)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
408065,1594,INFY,INFOSYS,0,,0,0.05,1,EQ,NSE,NSE
341249,1333,HDFCBANK,HDFC BANK,0,,0,0,1,EQ,NSE,NSE
bad,1,BROKEN,,0,,0,0.05,1,EQ,NSE,NSE
";

    #[test]
    fn parses_dump_and_skips_bad_rows() {
        let instruments = read_instruments(DUMP.as_bytes()).expect("parse");
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0].symbol, "INFY");
        assert_eq!(instruments[0].tick_size, Some(0.05));
        // A zero tick size falls back to the banded guess later.
        assert_eq!(instruments[1].tick_size, None);
        assert_eq!(instruments[1].lot_size, 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_instruments_csv(Path::new("/nonexistent/instruments.csv"))
            .expect_err("missing");
        assert!(err.contains("failed to open instruments CSV"));
    }
}
