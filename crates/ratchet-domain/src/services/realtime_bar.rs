use crate::value_objects::bar::Bar;
use crate::value_objects::tick::is_valid_price;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct BarAggregationReport {
    pub ticks_accepted: u64,
    pub invalid_ticks: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct WorkingBar {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

/// Per-symbol OHLC accumulator for the bar currently being built.
#[derive(Debug, Clone)]
pub struct BarAggregator {
    period_label: String,
    working: BTreeMap<String, WorkingBar>,
    report: BarAggregationReport,
}

impl BarAggregator {
    pub fn new(period_label: impl Into<String>) -> Self {
        Self {
            period_label: period_label.into(),
            working: BTreeMap::new(),
            report: BarAggregationReport::default(),
        }
    }

    pub fn period_label(&self) -> &str {
        &self.period_label
    }

    pub fn report(&self) -> &BarAggregationReport {
        &self.report
    }

    pub fn tracked_symbols(&self) -> usize {
        self.working.len()
    }

    /// Returns false when the price is unusable; the tick is counted and dropped.
    pub fn on_tick(&mut self, symbol: &str, price: f64) -> bool {
        if !is_valid_price(price) {
            self.report.invalid_ticks = self.report.invalid_ticks.saturating_add(1);
            return false;
        }
        self.report.ticks_accepted = self.report.ticks_accepted.saturating_add(1);

        match self.working.get_mut(symbol) {
            Some(bar) => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
            }
            None => {
                self.working.insert(
                    symbol.to_string(),
                    WorkingBar {
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                    },
                );
            }
        }
        true
    }

    pub fn snapshot(&self, period_end: i64, placeholder_volume: i64) -> Vec<Bar> {
        self.working
            .iter()
            .map(|(symbol, bar)| Bar {
                symbol: symbol.clone(),
                period_label: self.period_label.clone(),
                period_end,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: placeholder_volume.max(0),
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.working.clear();
        self.report.resets = self.report.resets.saturating_add(1);
    }

    /// Snapshot followed by reset.
    pub fn drain(&mut self, period_end: i64, placeholder_volume: i64) -> Vec<Bar> {
        let bars = self.snapshot(period_end, placeholder_volume);
        self.reset();
        bars
    }
}
