pub mod bar_persister;
pub mod bounded;
pub mod config;
pub mod entries;
pub mod ledger;
pub mod prices;
pub mod protection;
pub mod reconciliation;
pub mod runtime;
pub mod ticks;
pub mod trailing;
pub mod universe;
