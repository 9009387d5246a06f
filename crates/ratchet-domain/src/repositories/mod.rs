pub mod bar_store;
pub mod broker;
pub mod market_stream;
pub mod position_store;
