use chrono::NaiveDate;
use ratchet_domain::services::ladder::LadderPolicy;
use ratchet_domain::services::session::{
    parse_session_time, parse_utc_offset, parse_weekday, TradingSession,
};
use ratchet_domain::services::tick_size::{default_tick_bands, TickBand};
use ratchet_domain::value_objects::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Sqlite,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub venue: VenueConfig,
    pub bars: BarsConfig,
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub trailing: Option<TrailingConfig>,
    pub reconcile: Option<ReconcileConfig>,
    pub broker: Option<BrokerConfig>,
    pub stream: Option<StreamConfig>,
    pub instruments: InstrumentsConfig,
    #[serde(default)]
    pub universes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct VenueConfig {
    pub exchange: String,
    /// Fixed UTC offset of the venue, e.g. "+05:30".
    pub utc_offset: String,
    pub session_open: String,
    pub session_close: String,
    pub trading_days: Option<Vec<String>>,
    pub holidays: Option<Vec<NaiveDate>>,
    pub tick_bands: Option<Vec<TickBand>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BarsConfig {
    pub period: String,
    pub poll_seconds: Option<u64>,
    pub grace_seconds: Option<i64>,
    pub placeholder_volume: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: Option<String>,
    pub bars_table: Option<String>,
    pub sqlite_path: Option<String>,
    pub pool_max_size: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    pub path: String,
    pub max_slots: Option<u8>,
    pub cooldown_minutes: Option<i64>,
    pub stop_fraction: f64,
    pub target_fraction: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TrailingConfig {
    pub interval_seconds: Option<u64>,
    pub trail_threshold: Option<f64>,
    pub market_hours_only: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    pub interval_seconds: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub protection_retry_budget: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    /// Kite product code; CNC when unset.
    pub product: Option<String>,
    pub paper_seed: Option<u64>,
    pub paper_tick_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub url: Option<String>,
    pub channel_capacity: Option<usize>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct InstrumentsConfig {
    pub path: String,
    /// Keep only rows from this exchange; defaults to `venue.exchange`.
    pub exchange: Option<String>,
}

/// Effective knobs after defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub grace_seconds: i64,
    pub placeholder_volume: i64,
    pub trail_interval: Duration,
    pub trail_threshold: f64,
    pub trail_market_hours_only: bool,
    pub reconcile_interval: Duration,
    pub read_timeout: Duration,
    pub protection_retry_budget: u32,
    pub channel_capacity: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Config {
    pub fn timeframe(&self) -> Result<Timeframe, String> {
        Timeframe::parse(&self.bars.period)
    }

    pub fn session(&self) -> Result<TradingSession, String> {
        let offset = parse_utc_offset(&self.venue.utc_offset)?;
        let open = parse_session_time(&self.venue.session_open)?;
        let close = parse_session_time(&self.venue.session_close)?;
        let trading_days = match &self.venue.trading_days {
            Some(days) => days
                .iter()
                .map(|day| parse_weekday(day))
                .collect::<Result<Vec<_>, _>>()?,
            None => ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|day| parse_weekday(day))
                .collect::<Result<Vec<_>, _>>()?,
        };
        let holidays: BTreeSet<NaiveDate> = self
            .venue
            .holidays
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        TradingSession::new(offset, open, close, trading_days, holidays)
    }

    pub fn tick_bands(&self) -> Vec<TickBand> {
        self.venue
            .tick_bands
            .clone()
            .filter(|bands| !bands.is_empty())
            .unwrap_or_else(default_tick_bands)
    }

    pub fn ladder_policy(&self) -> LadderPolicy {
        let defaults = LadderPolicy::default();
        LadderPolicy {
            max_slots: self.ledger.max_slots.unwrap_or(defaults.max_slots),
            cooldown_seconds: self
                .ledger
                .cooldown_minutes
                .map(|minutes| minutes * 60)
                .unwrap_or(defaults.cooldown_seconds),
        }
    }

    pub fn instruments_exchange(&self) -> &str {
        self.instruments
            .exchange
            .as_deref()
            .unwrap_or(&self.venue.exchange)
    }

    pub fn runtime(&self) -> RuntimeSettings {
        let trailing = self.trailing.clone().unwrap_or_default();
        let reconcile = self.reconcile.clone().unwrap_or_default();
        let stream = self.stream.clone().unwrap_or_default();
        RuntimeSettings {
            poll_interval: Duration::from_secs(self.bars.poll_seconds.unwrap_or(5)),
            grace_seconds: self.bars.grace_seconds.unwrap_or(10),
            placeholder_volume: self.bars.placeholder_volume.unwrap_or(0),
            trail_interval: Duration::from_secs(trailing.interval_seconds.unwrap_or(30)),
            trail_threshold: trailing.trail_threshold.unwrap_or(0.001),
            trail_market_hours_only: trailing.market_hours_only.unwrap_or(false),
            reconcile_interval: Duration::from_secs(reconcile.interval_seconds.unwrap_or(60)),
            read_timeout: Duration::from_millis(reconcile.read_timeout_ms.unwrap_or(3_000)),
            protection_retry_budget: reconcile.protection_retry_budget.unwrap_or(3),
            channel_capacity: stream.channel_capacity.unwrap_or(10_000),
            backoff_initial: Duration::from_millis(stream.backoff_initial_ms.unwrap_or(250)),
            backoff_max: Duration::from_millis(stream.backoff_max_ms.unwrap_or(10_000)),
        }
    }

    /// Rejects configurations the loops cannot run with. Called once at startup.
    pub fn validate(&self) -> Result<(), String> {
        let timeframe = self.timeframe()?;
        self.session()?;

        let runtime = self.runtime();
        if runtime.poll_interval.is_zero() {
            return Err("bars.poll_seconds must be > 0".to_string());
        }
        if runtime.grace_seconds <= 0 || runtime.grace_seconds >= timeframe.step_seconds {
            return Err(format!(
                "bars.grace_seconds must be in 1..{} (got {})",
                timeframe.step_seconds, runtime.grace_seconds
            ));
        }
        if runtime.poll_interval.as_secs() as i64 >= runtime.grace_seconds {
            return Err(format!(
                "bars.poll_seconds ({}) must be shorter than bars.grace_seconds ({}) or boundaries can be missed",
                runtime.poll_interval.as_secs(),
                runtime.grace_seconds
            ));
        }
        if runtime.placeholder_volume < 0 {
            return Err("bars.placeholder_volume must be >= 0".to_string());
        }
        if !(self.ledger.stop_fraction > 0.0 && self.ledger.stop_fraction < 1.0) {
            return Err(format!(
                "ledger.stop_fraction must be in (0, 1) (got {})",
                self.ledger.stop_fraction
            ));
        }
        if let Some(target) = self.ledger.target_fraction {
            if !(target > 0.0 && target.is_finite()) {
                return Err(format!("ledger.target_fraction must be > 0 (got {target})"));
            }
        }
        if self.ladder_policy().max_slots == 0 {
            return Err("ledger.max_slots must be >= 1".to_string());
        }
        if !(runtime.trail_threshold >= 0.0 && runtime.trail_threshold < 1.0) {
            return Err(format!(
                "trailing.trail_threshold must be in [0, 1) (got {})",
                runtime.trail_threshold
            ));
        }
        if runtime.trail_interval.is_zero() || runtime.reconcile_interval.is_zero() {
            return Err("trailing/reconcile intervals must be > 0".to_string());
        }
        if runtime.read_timeout.is_zero() {
            return Err("reconcile.read_timeout_ms must be > 0".to_string());
        }
        if runtime.protection_retry_budget == 0 {
            return Err("reconcile.protection_retry_budget must be >= 1".to_string());
        }
        if runtime.channel_capacity == 0 {
            return Err("stream.channel_capacity must be >= 1".to_string());
        }
        if runtime.backoff_initial > runtime.backoff_max {
            return Err("stream.backoff_initial_ms must not exceed stream.backoff_max_ms".to_string());
        }
        for band in self.tick_bands() {
            if !(band.tick > 0.0 && band.tick.is_finite()) {
                return Err(format!("venue.tick_bands: invalid tick {}", band.tick));
            }
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_none() {
            return Err("storage.sqlite_path is required for the sqlite backend".to_string());
        }
        for (name, symbols) in &self.universes {
            if name.eq_ignore_ascii_case("all") {
                return Err("universe name `all` is reserved".to_string());
            }
            if symbols.is_empty() {
                return Err(format!("universe `{name}` lists no symbols"));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {}", path.display(), err))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|err| format!("failed to parse TOML {}: {}", path.display(), err))?;
    config
        .validate()
        .map_err(|err| format!("invalid config {}: {}", path.display(), err))?;
    Ok(config)
}
