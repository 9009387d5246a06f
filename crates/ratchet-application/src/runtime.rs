use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;

    fn now_seconds(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Logical clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn at_seconds(seconds: i64) -> Self {
        Self {
            millis: AtomicI64::new(seconds * 1000),
        }
    }

    pub fn set_seconds(&self, seconds: i64) {
        self.millis.store(seconds * 1000, Ordering::SeqCst);
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.millis.fetch_add(seconds * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Process-wide stop flag. Loops check it between cycles and sleep on it so a
/// trigger wakes them immediately.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for `duration` unless shutdown fires first. Returns false when
    /// the caller should stop.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut stopped = lock.lock();
        while !*stopped {
            if cvar.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }
}

/// Paces a loop. `wait_next` returns false once the loop should exit.
pub trait Ticker: Send {
    fn wait_next(&mut self) -> bool;
}

/// Fires immediately, then every `interval` until shutdown.
pub struct IntervalTicker {
    interval: Duration,
    shutdown: ShutdownSignal,
    fired: bool,
}

impl IntervalTicker {
    pub fn new(interval: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            interval,
            shutdown,
            fired: false,
        }
    }
}

impl Ticker for IntervalTicker {
    fn wait_next(&mut self) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        if !self.fired {
            self.fired = true;
            return true;
        }
        self.shutdown.sleep(self.interval)
    }
}

/// Fires a fixed number of times, advancing a manual clock before each
/// firing after the first.
pub struct ScriptedTicker {
    remaining: usize,
    clock: Option<(Arc<ManualClock>, i64)>,
    fired: bool,
}

impl ScriptedTicker {
    pub fn new(cycles: usize) -> Self {
        Self {
            remaining: cycles,
            clock: None,
            fired: false,
        }
    }

    pub fn advancing(mut self, clock: Arc<ManualClock>, step_seconds: i64) -> Self {
        self.clock = Some((clock, step_seconds));
        self
    }
}

impl Ticker for ScriptedTicker {
    fn wait_next(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        if self.fired {
            if let Some((clock, step)) = &self.clock {
                clock.advance_seconds(*step);
            }
        }
        self.fired = true;
        true
    }
}

/// Drives `cycle` once per tick. Cancellation is only observed between cycles.
pub fn run_loop(name: &'static str, ticker: &mut dyn Ticker, mut cycle: impl FnMut()) -> u64 {
    let mut cycles: u64 = 0;
    tracing::info!(loop_name = name, "loop started");
    while ticker.wait_next() {
        let started = Instant::now();
        cycle();
        cycles = cycles.saturating_add(1);
        metrics::histogram!("ratchet.loop.cycle_ms", "loop" => name)
            .record(started.elapsed().as_secs_f64() * 1000.0);
    }
    tracing::info!(loop_name = name, cycles, "loop stopped");
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn shutdown_wakes_a_sleeping_loop() {
        let shutdown = ShutdownSignal::new();
        let waiter = shutdown.clone();
        let handle = thread::spawn(move || waiter.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        let still_running = handle.join().expect("join");
        assert!(!still_running);
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn sleep_returns_true_when_not_stopped() {
        assert!(ShutdownSignal::new().sleep(Duration::from_millis(1)));
    }

    #[test]
    fn interval_ticker_fires_first_cycle_immediately_and_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let mut ticker = IntervalTicker::new(Duration::from_millis(1), shutdown.clone());
        assert!(ticker.wait_next());
        assert!(ticker.wait_next());
        shutdown.trigger();
        assert!(!ticker.wait_next());
    }

    #[test]
    fn scripted_ticker_advances_the_clock_between_cycles() {
        let clock = Arc::new(ManualClock::at_seconds(100));
        let mut ticker = ScriptedTicker::new(3).advancing(clock.clone(), 5);
        let mut seen = Vec::new();
        let cycles = run_loop("test", &mut ticker, || seen.push(clock.now_seconds()));
        assert_eq!(cycles, 3);
        assert_eq!(seen, vec![100, 105, 110]);
    }
}
