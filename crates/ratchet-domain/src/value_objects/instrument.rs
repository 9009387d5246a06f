#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub instrument_id: u32,
    pub symbol: String,
    pub exchange: String,
    /// Missing when the instrument dump carried no usable tick size.
    pub tick_size: Option<f64>,
    pub lot_size: i64,
}
