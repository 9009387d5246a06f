use super::EnterArgs;
use crate::infra;
use ratchet_application::config::{load_config, Config};
use ratchet_application::entries::{EntryDefaults, EntryRequest, LadderTrader};
use ratchet_application::ledger::PositionLedger;
use ratchet_application::prices::PriceStore;
use ratchet_application::protection::ProtectionSupervisor;
use ratchet_application::trailing::TrailBook;
use ratchet_application::universe::ALL_UNIVERSE;
use ratchet_domain::value_objects::position::{Position, PositionStatus};
use std::path::PathBuf;
use std::sync::Arc;

fn open_ledger(config: &Config) -> Result<Arc<PositionLedger>, String> {
    let store = infra::build_position_store(config)?;
    Ok(Arc::new(PositionLedger::new(store, config.ladder_policy())))
}

/// Trader wired to the live gateway. Fills and protection retries are left to
/// the reconcile loop of a running service.
fn live_trader(config: &Config) -> Result<LadderTrader, String> {
    let ledger = open_ledger(config)?;
    let gateway = infra::build_live_gateway(config)?;
    let instruments = infra::build_universe(config, ALL_UNIVERSE)?;
    let prices = Arc::new(PriceStore::new(instruments.id_to_symbol()));
    let book = Arc::new(TrailBook::new());
    let runtime = config.runtime();
    let supervisor = Arc::new(ProtectionSupervisor::new(
        gateway.clone(),
        ledger.clone(),
        book.clone(),
        prices,
        instruments,
        config.tick_bands(),
        runtime.protection_retry_budget,
    ));
    Ok(LadderTrader::new(
        gateway,
        ledger,
        book,
        supervisor,
        EntryDefaults {
            stop_fraction: config.ledger.stop_fraction,
            target_fraction: config.ledger.target_fraction,
        },
    ))
}

fn fmt_price(value: Option<f64>) -> String {
    value
        .map(|p| format!("{p:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

fn print_position(position: &Position) {
    println!(
        "{}\t{}\tslot={}\t{}\tqty={}\tentry={}\tstop={}\ttarget={}\tprotective={}",
        position.trade_id,
        position.symbol,
        position.slot,
        position.status,
        position.quantity,
        fmt_price(position.entry_price),
        fmt_price(position.stop_price),
        fmt_price(position.target_price),
        position.protective_order_id.as_deref().unwrap_or("-")
    );
}

pub(super) fn run_positions(
    config_path: PathBuf,
    symbol: Option<&str>,
    all: bool,
    json: bool,
) -> Result<(), String> {
    let config = load_config(&config_path)?;
    let ledger = open_ledger(&config)?;
    let mut positions = match symbol {
        Some(symbol) => ledger.positions_for(symbol),
        None if all => ledger.with_status(&PositionStatus::ALL),
        None => ledger.live_positions(),
    }
    .map_err(|err| err.to_string())?;
    if !all {
        positions.retain(|p| !p.status.is_closed());
    }
    positions.sort_by(|a, b| (&a.symbol, a.slot, a.opened_at).cmp(&(&b.symbol, b.slot, b.opened_at)));

    if json {
        let line = serde_json::to_string(&positions)
            .map_err(|err| format!("failed to serialize positions: {err}"))?;
        println!("{line}");
        return Ok(());
    }
    if positions.is_empty() {
        println!("no positions");
    }
    for position in &positions {
        print_position(position);
    }
    Ok(())
}

pub(super) fn run_enter(args: EnterArgs) -> Result<(), String> {
    let config = load_config(&args.config)?;
    let trader = live_trader(&config)?;
    let request = EntryRequest {
        symbol: args.symbol,
        slot: args.slot,
        quantity: args.quantity,
        stop_fraction: args.stop_fraction,
        target_fraction: args.target_fraction,
    };
    let outcome = trader
        .enter(&request, chrono::Utc::now().timestamp())
        .map_err(|err| err.to_string())?;
    print_position(&outcome.position);
    if let Some(err) = outcome.protection_error {
        println!("protection pending: {err}");
    }
    Ok(())
}

pub(super) fn run_close(config_path: PathBuf, trade_id: &str, flatten: bool) -> Result<(), String> {
    let config = load_config(&config_path)?;
    let trader = live_trader(&config)?;
    let closed = trader
        .close_manual(trade_id, flatten, chrono::Utc::now().timestamp())
        .map_err(|err| err.to_string())?;
    print_position(&closed.position);
    println!(
        "protective_deleted={} flatten_order={}",
        closed.protective_deleted,
        closed.flatten_order_id.as_deref().unwrap_or("-")
    );
    Ok(())
}
