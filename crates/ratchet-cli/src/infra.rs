use clap::ValueEnum;
use ratchet_application::config::{Config, StorageBackend};
use ratchet_application::universe::resolve_universe;
use ratchet_domain::repositories::bar_store::BarRepository;
use ratchet_domain::repositories::broker::BrokerGateway;
use ratchet_domain::repositories::market_stream::TickStream;
use ratchet_domain::repositories::position_store::PositionRepository;
use ratchet_domain::services::instruments::InstrumentMap;
use ratchet_infrastructure::broker::kite_rest::{KiteRestGateway, KiteSettings, DEFAULT_BASE_URL};
use ratchet_infrastructure::broker::paper::{PaperBroker, PaperTickStream};
use ratchet_infrastructure::instruments::load_instruments_csv;
use ratchet_infrastructure::persistence::postgres_bars::PostgresBarRepository;
use ratchet_infrastructure::persistence::sqlite_bars::SqliteBarRepository;
use ratchet_infrastructure::persistence::sqlite_positions::SqlitePositionRepository;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BARS_TABLE: &str = "bars";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Kite Connect REST plus the binary ticker.
    Live,
    /// In-process broker fed by a seeded random walk.
    Paper,
}

pub type StreamConnector = Box<dyn FnMut() -> Result<Box<dyn TickStream>, String> + Send>;

pub struct BrokerDeps {
    pub gateway: Arc<dyn BrokerGateway>,
    pub connect: StreamConnector,
}

#[derive(Debug, Clone)]
struct KiteCredentials {
    api_key: String,
    access_token: String,
}

impl KiteCredentials {
    fn from_env() -> Result<Self, String> {
        let api_key = env::var("RATCHET_API_KEY")
            .map_err(|_| "env RATCHET_API_KEY is not set".to_string())?;
        let access_token = env::var("RATCHET_ACCESS_TOKEN")
            .map_err(|_| "env RATCHET_ACCESS_TOKEN is not set".to_string())?;
        Ok(Self {
            api_key,
            access_token,
        })
    }
}

fn resolve_db_url(config: &Config) -> Result<String, String> {
    match config.storage.url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
        _ => env::var("RATCHET_DB_URL").map_err(|_| {
            "missing storage.url in config and env RATCHET_DB_URL is not set".to_string()
        }),
    }
}

pub fn build_bar_repository(config: &Config) -> Result<Arc<dyn BarRepository>, String> {
    let table = config
        .storage
        .bars_table
        .clone()
        .unwrap_or_else(|| DEFAULT_BARS_TABLE.to_string());
    let pool_max_size = config.storage.pool_max_size.unwrap_or(4);
    match config.storage.backend {
        StorageBackend::Postgres => {
            let db_url = resolve_db_url(config)?;
            let repo = PostgresBarRepository::new(&db_url, table, pool_max_size)?;
            repo.ensure_schema()?;
            Ok(Arc::new(repo))
        }
        StorageBackend::Sqlite => {
            let path = config
                .storage
                .sqlite_path
                .as_deref()
                .ok_or_else(|| "storage.sqlite_path is required for the sqlite backend".to_string())?;
            Ok(Arc::new(SqliteBarRepository::open(
                Path::new(path),
                table,
                pool_max_size,
            )?))
        }
    }
}

pub fn build_position_store(config: &Config) -> Result<Arc<dyn PositionRepository>, String> {
    Ok(Arc::new(SqlitePositionRepository::open(Path::new(
        &config.ledger.path,
    ))?))
}

pub fn build_universe(config: &Config, selector: &str) -> Result<Arc<InstrumentMap>, String> {
    let instruments = load_instruments_csv(Path::new(&config.instruments.path))?;
    let universe = resolve_universe(
        selector,
        &config.universes,
        &instruments,
        config.instruments_exchange(),
    )?;
    Ok(Arc::new(universe))
}

fn kite_settings(config: &Config, credentials: &KiteCredentials) -> KiteSettings {
    let broker = config.broker.clone().unwrap_or_default();
    KiteSettings {
        base_url: broker
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        api_key: credentials.api_key.clone(),
        access_token: credentials.access_token.clone(),
        exchange: config.venue.exchange.clone(),
        product: broker.product.unwrap_or_else(|| "CNC".to_string()),
        timeout: Duration::from_millis(broker.timeout_ms.unwrap_or(5_000)),
        read_retries: broker.retries.unwrap_or(2),
    }
}

/// Kite gateway alone, for one-shot commands that never stream.
pub fn build_live_gateway(config: &Config) -> Result<Arc<dyn BrokerGateway>, String> {
    let credentials = KiteCredentials::from_env()?;
    Ok(Arc::new(KiteRestGateway::new(kite_settings(
        config,
        &credentials,
    ))?))
}

pub fn build_broker(
    config: &Config,
    mode: Mode,
    universe: &InstrumentMap,
) -> Result<BrokerDeps, String> {
    match mode {
        Mode::Live => {
            let credentials = KiteCredentials::from_env()?;
            let gateway = Arc::new(KiteRestGateway::new(kite_settings(config, &credentials))?);
            let url = config
                .stream
                .as_ref()
                .and_then(|stream| stream.url.clone());
            Ok(BrokerDeps {
                gateway,
                connect: live_connector(url, credentials, universe.ids())?,
            })
        }
        Mode::Paper => {
            let broker = config.broker.clone().unwrap_or_default();
            let seed = broker.paper_seed.unwrap_or(42);
            let interval = Duration::from_millis(broker.paper_tick_interval_ms.unwrap_or(1_000));
            let paper = Arc::new(PaperBroker::new());
            let instruments: Vec<(u32, String)> = universe
                .ids()
                .into_iter()
                .filter_map(|id| universe.symbol_for(id).map(|symbol| (id, symbol.to_string())))
                .collect();
            let stream_broker = paper.clone();
            let connect: StreamConnector = Box::new(move || {
                let stream = PaperTickStream::new(
                    stream_broker.clone(),
                    instruments.clone(),
                    seed,
                    interval,
                );
                Ok(Box::new(stream) as Box<dyn TickStream>)
            });
            Ok(BrokerDeps {
                gateway: paper,
                connect,
            })
        }
    }
}

#[cfg(feature = "realtime-kite")]
fn live_connector(
    url: Option<String>,
    credentials: KiteCredentials,
    tokens: Vec<u32>,
) -> Result<StreamConnector, String> {
    use ratchet_infrastructure::market_stream::kite_ticker::{
        KiteTickerStream, DEFAULT_TICKER_URL,
    };

    let url = url.unwrap_or_else(|| DEFAULT_TICKER_URL.to_string());
    Ok(Box::new(move || {
        let stream = KiteTickerStream::connect(
            &url,
            &credentials.api_key,
            &credentials.access_token,
            &tokens,
        )?;
        Ok(Box::new(stream) as Box<dyn TickStream>)
    }))
}

#[cfg(not(feature = "realtime-kite"))]
fn live_connector(
    _url: Option<String>,
    _credentials: KiteCredentials,
    _tokens: Vec<u32>,
) -> Result<StreamConnector, String> {
    Err("live market stream requires ratchet-cli feature `realtime-kite`".to_string())
}
