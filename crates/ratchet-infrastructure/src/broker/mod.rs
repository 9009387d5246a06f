pub mod kite_rest;
pub mod paper;
