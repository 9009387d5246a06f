pub mod broker;
pub mod instruments;
pub mod market_stream;
pub mod persistence;
