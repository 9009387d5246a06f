use crate::prices::PriceStore;
use crate::runtime::ShutdownSignal;
use parking_lot::Mutex;
use ratchet_domain::repositories::market_stream::{StreamError, StreamEvent, TickStream};
use ratchet_domain::services::realtime_bar::{BarAggregationReport, BarAggregator};
use ratchet_domain::value_objects::bar::Bar;
use ratchet_domain::value_objects::tick::Tick;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

const CONSUMER_POLL: Duration = Duration::from_millis(200);

/// Bar aggregator shared between the tick consumer and the persist loop.
#[derive(Debug)]
pub struct SharedAggregator {
    inner: Mutex<BarAggregator>,
}

impl SharedAggregator {
    pub fn new(period_label: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(BarAggregator::new(period_label)),
        }
    }

    pub fn on_tick(&self, symbol: &str, price: f64) -> bool {
        self.inner.lock().on_tick(symbol, price)
    }

    /// Snapshot and reset under one lock hold, so a tick lands either in the
    /// drained bars or in the next period, never in neither.
    pub fn drain(&self, period_end: i64, placeholder_volume: i64) -> Vec<Bar> {
        self.inner.lock().drain(period_end, placeholder_volume)
    }

    pub fn snapshot(&self, period_end: i64, placeholder_volume: i64) -> Vec<Bar> {
        self.inner.lock().snapshot(period_end, placeholder_volume)
    }

    pub fn report(&self) -> BarAggregationReport {
        self.inner.lock().report().clone()
    }

    pub fn tracked_symbols(&self) -> usize {
        self.inner.lock().tracked_symbols()
    }
}

/// Fans one tick out to the price store and the bar aggregator.
pub struct TickSink {
    prices: Arc<PriceStore>,
    bars: Arc<SharedAggregator>,
}

impl TickSink {
    pub fn new(prices: Arc<PriceStore>, bars: Arc<SharedAggregator>) -> Self {
        Self { prices, bars }
    }

    pub fn apply(&self, tick: &Tick) -> bool {
        if !tick.is_valid() {
            metrics::counter!("ratchet.ticks.invalid_total").increment(1);
            tracing::warn!(
                instrument_id = tick.instrument_id,
                price = tick.price,
                "dropping malformed tick"
            );
            return false;
        }
        let Some(symbol) = self.prices.symbol_for(tick.instrument_id) else {
            metrics::counter!("ratchet.ticks.unknown_total").increment(1);
            return false;
        };
        self.prices.update(tick.instrument_id, tick.price);
        self.bars.on_tick(symbol, tick.price)
    }
}

/// Producer half of the bounded tick channel. Never blocks the stream reader.
#[derive(Clone)]
pub struct TickSender {
    tx: SyncSender<Tick>,
    dropped: Arc<AtomicU64>,
}

impl TickSender {
    /// Returns false when the tick was dropped (channel full or consumer gone).
    pub fn send(&self, tick: Tick) -> bool {
        match self.tx.try_send(tick) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ratchet.ticks.dropped_total").increment(1);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn tick_channel(capacity: usize) -> (TickSender, Receiver<Tick>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        TickSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Drains the channel into `sink` until shutdown or until every sender is gone.
/// Returns the number of ticks applied.
pub fn run_tick_consumer(rx: Receiver<Tick>, sink: &TickSink, shutdown: &ShutdownSignal) -> u64 {
    let mut applied: u64 = 0;
    loop {
        match rx.recv_timeout(CONSUMER_POLL) {
            Ok(tick) => {
                if sink.apply(&tick) {
                    applied = applied.saturating_add(1);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.is_triggered() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::info!(applied, "tick consumer stopped");
    applied
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStatus {
    pub connected: bool,
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub ticks_forwarded: u64,
    pub ticks_dropped: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

/// Reads the stream into `sender`, reconnecting with exponential backoff.
/// Runs until shutdown; the stream is closed on the way out.
pub fn run_stream(
    connect: &mut dyn FnMut() -> Result<Box<dyn TickStream>, String>,
    sender: &TickSender,
    backoff: Backoff,
    shutdown: &ShutdownSignal,
    on_status: &mut dyn FnMut(&StreamStatus),
) -> StreamStatus {
    let mut status = StreamStatus::default();
    let mut delay = backoff.initial;
    let mut stream: Option<Box<dyn TickStream>> = None;

    while !shutdown.is_triggered() {
        if stream.is_none() {
            match connect() {
                Ok(new_stream) => {
                    stream = Some(new_stream);
                    delay = backoff.initial;
                    status.connected = true;
                    status.last_error = None;
                    metrics::gauge!("ratchet.stream.connected").set(1.0);
                    tracing::info!(reconnects = status.reconnects, "tick stream connected");
                    on_status(&status);
                }
                Err(err) => {
                    status.connected = false;
                    status.last_error = Some(err.clone());
                    tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "tick stream connect failed");
                    on_status(&status);
                    if !shutdown.sleep(delay) {
                        break;
                    }
                    delay = (delay * 2).min(backoff.max);
                }
            }
            continue;
        }
        let Some(active) = stream.as_mut() else {
            continue;
        };

        match active.next_event() {
            Ok(StreamEvent::Ticks(ticks)) => {
                for tick in ticks {
                    if sender.send(tick) {
                        status.ticks_forwarded = status.ticks_forwarded.saturating_add(1);
                    }
                }
                status.ticks_dropped = sender.dropped();
            }
            Ok(StreamEvent::Heartbeat) => {}
            Err(err @ (StreamError::Protocol(_) | StreamError::InvalidData(_))) => {
                // A bad frame costs only its own ticks; the connection stays up.
                status.malformed_frames = status.malformed_frames.saturating_add(1);
                metrics::counter!("ratchet.ticks.malformed_total").increment(1);
                tracing::warn!(error = %err, malformed = status.malformed_frames, "skipping malformed frame");
            }
            Err(err @ StreamError::Disconnected(_)) => {
                active.close();
                stream = None;
                status.connected = false;
                status.reconnects = status.reconnects.saturating_add(1);
                status.last_error = Some(err.to_string());
                metrics::gauge!("ratchet.stream.connected").set(0.0);
                metrics::counter!("ratchet.stream.reconnects_total").increment(1);
                tracing::warn!(error = %err, reconnects = status.reconnects, "tick stream lost");
                on_status(&status);
                if !shutdown.sleep(delay) {
                    break;
                }
                delay = (delay * 2).min(backoff.max);
            }
        }
    }

    if let Some(mut active) = stream {
        active.close();
    }
    status.connected = false;
    status.ticks_dropped = sender.dropped();
    on_status(&status);
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sink() -> (TickSink, Arc<PriceStore>, Arc<SharedAggregator>) {
        let prices = Arc::new(PriceStore::new(HashMap::from([(7, "X".to_string())])));
        let bars = Arc::new(SharedAggregator::new("15m"));
        (TickSink::new(prices.clone(), bars.clone()), prices, bars)
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let (sender, rx) = tick_channel(2);
        assert!(sender.send(Tick::new(7, 1.0, 0)));
        assert!(sender.send(Tick::new(7, 2.0, 0)));
        assert!(!sender.send(Tick::new(7, 3.0, 0)));
        assert_eq!(sender.dropped(), 1);
        drop(rx);
        assert!(!sender.send(Tick::new(7, 4.0, 0)));
        assert_eq!(sender.dropped(), 1);
    }

    #[test]
    fn consumer_feeds_prices_and_bars_until_senders_drop() {
        let (sink, prices, bars) = sink();
        let (sender, rx) = tick_channel(16);
        for price in [100.0, 100.1, 99.95, 100.05] {
            sender.send(Tick::new(7, price, 0));
        }
        sender.send(Tick::new(99, 5.0, 0));
        sender.send(Tick::new(7, -1.0, 0));
        drop(sender);

        let applied = run_tick_consumer(rx, &sink, &ShutdownSignal::new());
        assert_eq!(applied, 4);
        assert_eq!(prices.read("X"), Some(100.05));
        let drained = bars.drain(900, 0);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].high, 100.1);
        assert_eq!(drained[0].low, 99.95);
    }

    struct ScriptedStream {
        events: Vec<Result<StreamEvent, StreamError>>,
        shutdown: ShutdownSignal,
    }

    impl TickStream for ScriptedStream {
        fn next_event(&mut self) -> Result<StreamEvent, StreamError> {
            if self.events.is_empty() {
                self.shutdown.trigger();
                return Ok(StreamEvent::Heartbeat);
            }
            self.events.remove(0)
        }
    }

    #[test]
    fn stream_reconnects_after_disconnect() {
        let shutdown = ShutdownSignal::new();
        let (sender, rx) = tick_channel(16);
        let mut attempts = 0;
        let signal = shutdown.clone();
        let mut connect = || -> Result<Box<dyn TickStream>, String> {
            attempts += 1;
            match attempts {
                1 => Ok(Box::new(ScriptedStream {
                    events: vec![
                        Ok(StreamEvent::Ticks(vec![Tick::new(7, 10.0, 0)])),
                        Err(StreamError::Disconnected("reset".to_string())),
                    ],
                    shutdown: signal.clone(),
                })),
                2 => Err("refused".to_string()),
                _ => Ok(Box::new(ScriptedStream {
                    events: vec![Ok(StreamEvent::Ticks(vec![Tick::new(7, 11.0, 0)]))],
                    shutdown: signal.clone(),
                })),
            }
        };
        let mut statuses = Vec::new();
        let status = run_stream(
            &mut connect,
            &sender,
            Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
            &shutdown,
            &mut |s: &StreamStatus| statuses.push(s.clone()),
        );

        assert_eq!(status.reconnects, 1);
        assert_eq!(status.ticks_forwarded, 2);
        assert!(!status.connected);
        assert!(statuses.iter().any(|s| s.last_error.as_deref() == Some("refused")));
        let received: Vec<f64> = rx.try_iter().map(|t| t.price).collect();
        assert_eq!(received, vec![10.0, 11.0]);
    }

    #[test]
    fn malformed_frame_is_skipped_without_reconnecting() {
        let shutdown = ShutdownSignal::new();
        let (sender, rx) = tick_channel(16);
        let mut attempts = 0;
        let signal = shutdown.clone();
        let mut connect = || -> Result<Box<dyn TickStream>, String> {
            attempts += 1;
            Ok(Box::new(ScriptedStream {
                events: vec![
                    Err(StreamError::Protocol("packet 0 header truncated".to_string())),
                    Err(StreamError::InvalidData("negative price".to_string())),
                    Ok(StreamEvent::Ticks(vec![Tick::new(7, 12.5, 0)])),
                ],
                shutdown: signal.clone(),
            }))
        };
        let status = run_stream(
            &mut connect,
            &sender,
            Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
            &shutdown,
            &mut |_: &StreamStatus| {},
        );

        assert_eq!(attempts, 1);
        assert_eq!(status.reconnects, 0);
        assert_eq!(status.malformed_frames, 2);
        assert_eq!(status.ticks_forwarded, 1);
        let received: Vec<f64> = rx.try_iter().map(|t| t.price).collect();
        assert_eq!(received, vec![12.5]);
    }
}
