pub mod bar;
pub mod instrument;
pub mod order;
pub mod position;
pub mod protective;
pub mod side;
pub mod tick;
pub mod timeframe;
pub mod trail_state;
