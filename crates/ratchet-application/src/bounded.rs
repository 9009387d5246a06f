use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    Fresh(T),
    /// Last good result; the current call timed out, failed or was already in flight.
    Stale(T),
    Unavailable,
}

impl<T> ReadOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            ReadOutcome::Fresh(value) | ReadOutcome::Stale(value) => Some(value),
            ReadOutcome::Unavailable => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, ReadOutcome::Fresh(_))
    }
}

struct ReadState<T> {
    cached: Option<T>,
    in_flight: bool,
}

/// Runs a slow query on a worker thread and waits at most `timeout` for it.
/// At most one call per query is in flight; callers that arrive meanwhile get
/// the cached result. A call that finishes after its caller gave up still
/// refreshes the cache.
pub struct BoundedRead<T> {
    name: &'static str,
    timeout: Duration,
    state: Arc<Mutex<ReadState<T>>>,
}

impl<T: Clone + Send + 'static> BoundedRead<T> {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            state: Arc::new(Mutex::new(ReadState {
                cached: None,
                in_flight: false,
            })),
        }
    }

    pub fn cached(&self) -> Option<T> {
        self.state.lock().cached.clone()
    }

    pub fn read<F>(&self, fetch: F) -> ReadOutcome<T>
    where
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.in_flight {
                metrics::counter!("ratchet.bounded_read.total", "query" => self.name, "result" => "in_flight")
                    .increment(1);
                return stale_or_unavailable(state.cached.clone());
            }
            state.in_flight = true;
        }

        let (tx, rx) = mpsc::channel();
        let state = self.state.clone();
        let spawned = thread::Builder::new()
            .name(format!("read-{}", self.name))
            .spawn(move || {
                let result = fetch();
                {
                    let mut state = state.lock();
                    state.in_flight = false;
                    if let Ok(value) = &result {
                        state.cached = Some(value.clone());
                    }
                }
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            let mut state = self.state.lock();
            state.in_flight = false;
            tracing::error!(query = self.name, error = %err, "failed to spawn read worker");
            return stale_or_unavailable(state.cached.clone());
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(value)) => {
                metrics::counter!("ratchet.bounded_read.total", "query" => self.name, "result" => "fresh")
                    .increment(1);
                ReadOutcome::Fresh(value)
            }
            Ok(Err(err)) => {
                metrics::counter!("ratchet.bounded_read.total", "query" => self.name, "result" => "error")
                    .increment(1);
                tracing::warn!(query = self.name, error = %err, "broker read failed; serving cached result");
                stale_or_unavailable(self.cached())
            }
            Err(_) => {
                metrics::counter!("ratchet.bounded_read.total", "query" => self.name, "result" => "timeout")
                    .increment(1);
                tracing::warn!(
                    query = self.name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "broker read timed out; serving cached result"
                );
                stale_or_unavailable(self.cached())
            }
        }
    }
}

fn stale_or_unavailable<T>(cached: Option<T>) -> ReadOutcome<T> {
    match cached {
        Some(value) => ReadOutcome::Stale(value),
        None => ReadOutcome::Unavailable,
    }
}
