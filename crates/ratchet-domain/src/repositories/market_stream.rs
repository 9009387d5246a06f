use crate::value_objects::tick::Tick;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ticks(Vec<Tick>),
    /// Keep-alive from the feed; lets readers observe shutdown between ticks.
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    Disconnected(String),
    Protocol(String),
    InvalidData(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            StreamError::Protocol(msg) => write!(f, "protocol: {msg}"),
            StreamError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

pub trait TickStream: Send {
    fn next_event(&mut self) -> Result<StreamEvent, StreamError>;

    /// Closes the underlying connection. Called once on shutdown.
    fn close(&mut self) {}
}
