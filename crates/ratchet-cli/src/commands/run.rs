use super::validate::print_config_summary;
use super::RunArgs;
use crate::infra::{self, BrokerDeps};
use crate::obs::install_ctrl_c;
use ratchet_application::bar_persister::{BarPersister, PersistSettings};
use ratchet_application::config::load_config;
use ratchet_application::ledger::PositionLedger;
use ratchet_application::prices::PriceStore;
use ratchet_application::protection::ProtectionSupervisor;
use ratchet_application::reconciliation::Reconciler;
use ratchet_application::runtime::{IntervalTicker, ShutdownSignal, SystemClock};
use ratchet_application::ticks::{
    run_stream, run_tick_consumer, tick_channel, Backoff, SharedAggregator, StreamStatus,
    TickSink,
};
use ratchet_application::trailing::{TrailBook, TrailingEngine, TrailingSettings};
use std::sync::Arc;
use std::thread;

pub(super) fn run_service(args: RunArgs) -> Result<(), String> {
    let config = load_config(&args.config)?;
    print_config_summary("run", &config)?;

    let timeframe = config.timeframe()?;
    let session = config.session()?;
    let runtime = config.runtime();
    let bands = config.tick_bands();

    let universe = infra::build_universe(&config, &args.universe)?;
    let bars_repo = infra::build_bar_repository(&config)?;
    let ledger = Arc::new(PositionLedger::new(
        infra::build_position_store(&config)?,
        config.ladder_policy(),
    ));
    let BrokerDeps {
        gateway,
        mut connect,
    } = infra::build_broker(&config, args.mode, &universe)?;

    let prices = Arc::new(PriceStore::new(universe.id_to_symbol()));
    let aggregator = Arc::new(SharedAggregator::new(timeframe.label.clone()));
    let book = Arc::new(TrailBook::new());
    book.rebuild_from(&ledger, &universe, &bands)
        .map_err(|err| format!("failed to rebuild trail book: {err}"))?;

    let supervisor = Arc::new(ProtectionSupervisor::new(
        gateway.clone(),
        ledger.clone(),
        book.clone(),
        prices.clone(),
        universe.clone(),
        bands,
        runtime.protection_retry_budget,
    ));
    let engine = TrailingEngine::new(
        gateway.clone(),
        ledger.clone(),
        book.clone(),
        prices.clone(),
        session.clone(),
        TrailingSettings {
            trail_threshold: runtime.trail_threshold,
            market_hours_only: runtime.trail_market_hours_only,
        },
    );
    let reconciler = Reconciler::new(
        gateway.clone(),
        ledger,
        book,
        supervisor,
        runtime.read_timeout,
    );
    let mut persister = BarPersister::new(
        aggregator.clone(),
        bars_repo,
        session,
        PersistSettings {
            step_seconds: timeframe.step_seconds,
            grace_seconds: runtime.grace_seconds,
            placeholder_volume: runtime.placeholder_volume,
        },
    );

    let shutdown = ShutdownSignal::new();
    install_ctrl_c(shutdown.clone())?;
    let (sender, rx) = tick_channel(runtime.channel_capacity);
    let sink = TickSink::new(prices, aggregator.clone());
    let backoff = Backoff {
        initial: runtime.backoff_initial,
        max: runtime.backoff_max,
    };

    tracing::info!(
        mode = ?args.mode,
        broker = gateway.name(),
        universe = %args.universe,
        instruments = universe.len(),
        period = %timeframe.label,
        "ratchet service starting"
    );

    let clock = SystemClock;
    thread::scope(|scope| {
        scope.spawn(|| {
            let status = run_stream(
                &mut connect,
                &sender,
                backoff,
                &shutdown,
                &mut |status: &StreamStatus| {
                    metrics::gauge!("ratchet.stream.ticks_dropped").set(status.ticks_dropped as f64);
                },
            );
            tracing::info!(
                reconnects = status.reconnects,
                forwarded = status.ticks_forwarded,
                dropped = status.ticks_dropped,
                "tick stream stopped"
            );
        });
        scope.spawn(|| run_tick_consumer(rx, &sink, &shutdown));
        scope.spawn(|| {
            let mut ticker = IntervalTicker::new(runtime.poll_interval, shutdown.clone());
            persister.run(&clock, &mut ticker)
        });
        scope.spawn(|| {
            let mut ticker = IntervalTicker::new(runtime.trail_interval, shutdown.clone());
            engine.run(&clock, &mut ticker)
        });
        scope.spawn(|| {
            let mut ticker = IntervalTicker::new(runtime.reconcile_interval, shutdown.clone());
            reconciler.run(&clock, &mut ticker)
        });
    });

    let report = aggregator.report();
    tracing::info!(
        ticks = report.ticks_accepted,
        invalid_ticks = report.invalid_ticks,
        unfinished_symbols = aggregator.tracked_symbols(),
        "ratchet service stopped"
    );
    Ok(())
}
