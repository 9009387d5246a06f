use crate::value_objects::bar::Bar;

pub trait BarRepository: Send + Sync {
    /// Inserts bars, ignoring any whose (symbol, period_label, period_end) key
    /// already exists. Returns the number of rows actually written.
    fn insert_bars(&self, bars: &[Bar]) -> Result<usize, String>;

    /// Most recent bars first, up to `limit`.
    fn load_bars(&self, symbol: &str, period_label: &str, limit: usize)
        -> Result<Vec<Bar>, String>;
}
