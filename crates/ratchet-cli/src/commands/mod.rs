mod positions;
mod run;
mod validate;

use crate::infra::Mode;
use std::path::PathBuf;

pub struct RunArgs {
    pub config: PathBuf,
    pub universe: String,
    pub mode: Mode,
}

pub struct EnterArgs {
    pub config: PathBuf,
    pub symbol: String,
    pub slot: u8,
    pub quantity: i64,
    pub stop_fraction: Option<f64>,
    pub target_fraction: Option<f64>,
}

pub enum Command {
    Run(RunArgs),
    Validate {
        config: PathBuf,
        universe: String,
    },
    Positions {
        config: PathBuf,
        symbol: Option<String>,
        all: bool,
        json: bool,
    },
    Enter(EnterArgs),
    Close {
        config: PathBuf,
        trade_id: String,
        flatten: bool,
    },
}

pub fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Run(args) => run::run_service(args),
        Command::Validate { config, universe } => validate::run_validate(config, &universe),
        Command::Positions {
            config,
            symbol,
            all,
            json,
        } => positions::run_positions(config, symbol.as_deref(), all, json),
        Command::Enter(args) => positions::run_enter(args),
        Command::Close {
            config,
            trade_id,
            flatten,
        } => positions::run_close(config, &trade_id, flatten),
    }
}

#[cfg(test)]
mod tests {
    use super::{run, Command};
    use ratchet_application::config::load_config;
    use ratchet_application::ledger::PositionLedger;
    use std::fs;
    use std::path::{Path, PathBuf};

    const INSTRUMENTS: &str = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
408065,1594,INFY,INFOSYS,0,,0,0.05,1,EQ,NSE,NSE
341249,1333,HDFCBANK,HDFC BANK,0,,0,0.05,1,EQ,NSE,NSE
1270529,4963,ICICIBANK,ICICI BANK,0,,0,0.05,1,EQ,NSE,NSE
";

    fn sample_config(dir: &Path) -> PathBuf {
        let instruments = dir.join("instruments.csv");
        fs::write(&instruments, INSTRUMENTS).expect("write instruments");
        let config_path = dir.join("config.toml");
        let contents = format!(
            r#"
[venue]
exchange = "NSE"
utc_offset = "+05:30"
session_open = "09:15"
session_close = "15:30"

[bars]
period = "15m"

[storage]
backend = "sqlite"
sqlite_path = "{bars}"

[ledger]
path = "{ledger}"
stop_fraction = 0.01

[instruments]
path = "{instruments}"

[universes]
banks = ["HDFCBANK", "ICICIBANK"]
"#,
            bars = dir.join("bars.sqlite").display(),
            ledger = dir.join("ledger.sqlite").display(),
            instruments = instruments.display(),
        );
        fs::write(&config_path, contents).expect("write config");
        config_path
    }

    #[test]
    fn validate_resolves_a_configured_universe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sample_config(dir.path());
        run(Command::Validate {
            config: config.clone(),
            universe: "banks".to_string(),
        })
        .expect("validate");
        let err = run(Command::Validate {
            config,
            universe: "metals".to_string(),
        })
        .expect_err("unknown universe");
        assert!(err.contains("unknown universe"));
    }

    #[test]
    fn positions_lists_the_ledger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = sample_config(dir.path());
        let config = load_config(&config_path).expect("config");
        let ledger = PositionLedger::new(
            crate::infra::build_position_store(&config).expect("store"),
            config.ladder_policy(),
        );
        ledger
            .open_slot("INFY", 1, 10, 0.01, None, 1_792_040_000)
            .expect("open slot");
        drop(ledger);

        for (all, json) in [(false, false), (true, true)] {
            run(Command::Positions {
                config: config_path.clone(),
                symbol: None,
                all,
                json,
            })
            .expect("positions");
        }
        run(Command::Positions {
            config: config_path,
            symbol: Some("INFY".to_string()),
            all: false,
            json: false,
        })
        .expect("positions by symbol");
    }

    #[test]
    fn live_commands_need_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sample_config(dir.path());
        if std::env::var("RATCHET_API_KEY").is_ok() {
            return;
        }
        let err = run(Command::Close {
            config,
            trade_id: "INFY-S1-1".to_string(),
            flatten: false,
        })
        .expect_err("missing credentials");
        assert!(err.contains("RATCHET_API_KEY"));
    }
}
