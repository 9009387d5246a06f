pub mod instruments;
pub mod ladder;
pub mod realtime_bar;
pub mod session;
pub mod tick_size;
pub mod trailing;
