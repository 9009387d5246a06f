use ratchet_application::config::{load_config, Config, StorageBackend};
use std::path::PathBuf;

pub(super) fn print_config_summary(command: &str, config: &Config) -> Result<(), String> {
    let timeframe = config.timeframe()?;
    let runtime = config.runtime();
    let policy = config.ladder_policy();
    println!(
        "ratchet cli: {} (exchange={}, period={}, session={}-{} {})",
        command,
        config.venue.exchange,
        timeframe.label,
        config.venue.session_open,
        config.venue.session_close,
        config.venue.utc_offset
    );
    println!(
        "storage: backend={}, table={}, target={}",
        match config.storage.backend {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Sqlite => "sqlite",
        },
        config.storage.bars_table.as_deref().unwrap_or("bars"),
        match config.storage.backend {
            StorageBackend::Postgres => config.storage.url.as_deref().unwrap_or("$RATCHET_DB_URL"),
            StorageBackend::Sqlite => config.storage.sqlite_path.as_deref().unwrap_or("-"),
        }
    );
    println!(
        "bars: poll_s={}, grace_s={}, placeholder_volume={}",
        runtime.poll_interval.as_secs(),
        runtime.grace_seconds,
        runtime.placeholder_volume
    );
    println!(
        "ladder: ledger={}, max_slots={}, cooldown_s={}, stop_fraction={}, target_fraction={}",
        config.ledger.path,
        policy.max_slots,
        policy.cooldown_seconds,
        config.ledger.stop_fraction,
        config
            .ledger
            .target_fraction
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "trailing: interval_s={}, threshold={}, market_hours_only={}; reconcile: interval_s={}, read_timeout_ms={}, retry_budget={}",
        runtime.trail_interval.as_secs(),
        runtime.trail_threshold,
        runtime.trail_market_hours_only,
        runtime.reconcile_interval.as_secs(),
        runtime.read_timeout.as_millis(),
        runtime.protection_retry_budget
    );
    Ok(())
}

pub(super) fn run_validate(config_path: PathBuf, universe: &str) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("validate", &config)?;

    let instruments = crate::infra::build_universe(&config, universe)?;
    let missing_tick = instruments
        .symbols()
        .iter()
        .filter(|symbol| {
            instruments
                .by_symbol(symbol)
                .is_some_and(|i| i.tick_size.is_none())
        })
        .count();
    println!(
        "universe: {} instruments={} without_tick_size={}",
        universe,
        instruments.len(),
        missing_tick
    );
    Ok(())
}
