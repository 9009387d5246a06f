pub mod kite_ticker;
