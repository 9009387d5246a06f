use crate::runtime::{run_loop, Clock, Ticker};
use crate::ticks::SharedAggregator;
use ratchet_domain::repositories::bar_store::BarRepository;
use ratchet_domain::services::session::{decide_boundary, BoundaryAction, TradingSession};
use std::sync::Arc;
use std::time::Instant;
use tracing::info_span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Idle,
    AlreadyHandled {
        period_end: i64,
    },
    Persisted {
        period_end: i64,
        bars: usize,
        inserted: usize,
    },
    Skipped {
        period_end: i64,
        discarded: usize,
    },
    Failed {
        period_end: i64,
        bars: usize,
        error: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct PersistSettings {
    pub step_seconds: i64,
    pub grace_seconds: i64,
    pub placeholder_volume: i64,
}

/// Finalizes the in-progress bars at each period boundary.
pub struct BarPersister {
    aggregator: Arc<SharedAggregator>,
    repo: Arc<dyn BarRepository>,
    session: TradingSession,
    settings: PersistSettings,
    last_handled: Option<i64>,
}

impl BarPersister {
    pub fn new(
        aggregator: Arc<SharedAggregator>,
        repo: Arc<dyn BarRepository>,
        session: TradingSession,
        settings: PersistSettings,
    ) -> Self {
        Self {
            aggregator,
            repo,
            session,
            settings,
            last_handled: None,
        }
    }

    pub fn last_handled(&self) -> Option<i64> {
        self.last_handled
    }

    /// One wake-up of the persist loop at wall-clock `now` (epoch seconds).
    /// The aggregator is reset whenever a boundary is handled, whether the
    /// write succeeded, failed or was skipped.
    pub fn run_cycle(&mut self, now: i64) -> PersistOutcome {
        let action = decide_boundary(
            now,
            self.settings.step_seconds,
            self.settings.grace_seconds,
            self.last_handled,
            &self.session,
        );
        match action {
            BoundaryAction::Idle => PersistOutcome::Idle,
            BoundaryAction::AlreadyHandled { period_end } => {
                PersistOutcome::AlreadyHandled { period_end }
            }
            BoundaryAction::Skip { period_end } => {
                self.last_handled = Some(period_end);
                let discarded = self
                    .aggregator
                    .drain(period_end, self.settings.placeholder_volume)
                    .len();
                metrics::counter!("ratchet.bars.boundaries_total", "result" => "skipped")
                    .increment(1);
                tracing::debug!(period_end, discarded, "boundary outside session, bars discarded");
                PersistOutcome::Skipped {
                    period_end,
                    discarded,
                }
            }
            BoundaryAction::Persist { period_end } => {
                self.last_handled = Some(period_end);
                self.persist(period_end)
            }
        }
    }

    fn persist(&self, period_end: i64) -> PersistOutcome {
        let span = info_span!("bars.persist", period_end);
        let _enter = span.enter();

        let bars = self
            .aggregator
            .drain(period_end, self.settings.placeholder_volume);
        if bars.is_empty() {
            metrics::counter!("ratchet.bars.boundaries_total", "result" => "empty").increment(1);
            return PersistOutcome::Persisted {
                period_end,
                bars: 0,
                inserted: 0,
            };
        }

        let started = Instant::now();
        match self.repo.insert_bars(&bars) {
            Ok(inserted) => {
                metrics::counter!("ratchet.bars.boundaries_total", "result" => "persisted")
                    .increment(1);
                metrics::counter!("ratchet.bars.inserted_total").increment(inserted as u64);
                metrics::histogram!("ratchet.bars.persist_ms")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                if inserted < bars.len() {
                    tracing::warn!(
                        bars = bars.len(),
                        inserted,
                        "some bars already existed; duplicates ignored"
                    );
                } else {
                    tracing::info!(bars = bars.len(), inserted, "bars persisted");
                }
                PersistOutcome::Persisted {
                    period_end,
                    bars: bars.len(),
                    inserted,
                }
            }
            Err(err) => {
                metrics::counter!("ratchet.bars.boundaries_total", "result" => "failed")
                    .increment(1);
                tracing::error!(error = %err, bars = bars.len(), "failed to persist bars");
                PersistOutcome::Failed {
                    period_end,
                    bars: bars.len(),
                    error: err,
                }
            }
        }
    }

    pub fn run(&mut self, clock: &dyn Clock, ticker: &mut dyn Ticker) -> u64 {
        run_loop("bar_persister", ticker, || {
            self.run_cycle(clock.now_seconds());
        })
    }
}
