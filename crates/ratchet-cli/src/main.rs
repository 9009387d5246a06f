mod commands;
mod infra;
mod obs;

use clap::{Args, Parser, Subcommand};
use commands::{Command, EnterArgs, RunArgs};
use infra::Mode;
use obs::LogFormat;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ratchet")]
#[command(about = "Ratchet: live bars, ladder entries and trailing protection", version, arg_required_else_help = true)]
#[command(
    after_help = "Examples:\n  ratchet run --config configs/sample.toml --universe banks --mode paper\n  ratchet validate --config configs/sample.toml\n  ratchet positions --config configs/sample.toml --all\n  ratchet enter --config configs/sample.toml --symbol INFY --slot 1 --quantity 10\n  ratchet close --config configs/sample.toml --trade-id INFY-S1-1792040000 --flatten\n"
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Args)]
struct LoggingArgs {
    /// Log filter; RATCHET_LOG overrides it.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Stream ticks, persist bars and keep positions protected until Ctrl-C.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Universe name from the config, or `all`.
        #[arg(long, default_value = "all")]
        universe: String,
        #[arg(long, value_enum, default_value_t = Mode::Live)]
        mode: Mode,
        /// Serve Prometheus metrics on host:port.
        #[arg(long, value_name = "HOST:PORT")]
        metrics_addr: Option<SocketAddr>,
    },
    /// Check the config and resolve a universe without connecting anywhere.
    Validate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "all")]
        universe: String,
    },
    /// List ladder positions from the ledger.
    Positions {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        symbol: Option<String>,
        /// Include closed positions.
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Print a single JSON line instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Open a ladder slot with a market buy on Kite.
    Enter {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        slot: u8,
        #[arg(long)]
        quantity: i64,
        /// Overrides ledger.stop_fraction.
        #[arg(long)]
        stop_fraction: Option<f64>,
        /// Overrides ledger.target_fraction.
        #[arg(long)]
        target_fraction: Option<f64>,
    },
    /// Close a position manually, cancelling its protective order.
    Close {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        trade_id: String,
        /// Also sell the filled quantity at market.
        #[arg(long, default_value_t = false)]
        flatten: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = obs::init_tracing(&cli.logging.log_level, cli.logging.log_format) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }

    let command = match cli.command {
        CliCommand::Run {
            config,
            universe,
            mode,
            metrics_addr,
        } => {
            if let Err(err) = obs::init_metrics(metrics_addr) {
                eprintln!("error: {}", err);
                std::process::exit(1);
            }
            Command::Run(RunArgs {
                config,
                universe,
                mode,
            })
        }
        CliCommand::Validate { config, universe } => Command::Validate { config, universe },
        CliCommand::Positions {
            config,
            symbol,
            all,
            json,
        } => Command::Positions {
            config,
            symbol,
            all,
            json,
        },
        CliCommand::Enter {
            config,
            symbol,
            slot,
            quantity,
            stop_fraction,
            target_fraction,
        } => Command::Enter(EnterArgs {
            config,
            symbol,
            slot,
            quantity,
            stop_fraction,
            target_fraction,
        }),
        CliCommand::Close {
            config,
            trade_id,
            flatten,
        } => Command::Close {
            config,
            trade_id,
            flatten,
        },
    };

    if let Err(err) = commands::run(command) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_to_live_and_all() {
        let cli = Cli::try_parse_from(["ratchet", "run", "--config", "c.toml"]).expect("parse");
        match cli.command {
            CliCommand::Run { universe, mode, .. } => {
                assert_eq!(universe, "all");
                assert_eq!(mode, Mode::Live);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.logging.log_level, "info");
    }

    #[test]
    fn paper_mode_parses() {
        let cli = Cli::try_parse_from([
            "ratchet", "run", "--config", "c.toml", "--mode", "paper", "--log-format", "json",
        ])
        .expect("parse");
        assert!(matches!(cli.command, CliCommand::Run { mode: Mode::Paper, .. }));
        assert_eq!(cli.logging.log_format, LogFormat::Json);
    }

    #[test]
    fn metrics_addr_must_be_host_and_port() {
        let cli = Cli::try_parse_from([
            "ratchet", "run", "--config", "c.toml", "--metrics-addr", "127.0.0.1:9464",
        ])
        .expect("parse");
        match cli.command {
            CliCommand::Run { metrics_addr, .. } => {
                assert_eq!(metrics_addr, Some("127.0.0.1:9464".parse().expect("addr")));
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from([
            "ratchet", "run", "--config", "c.toml", "--metrics-addr", "9464",
        ])
        .is_err());
    }
}
