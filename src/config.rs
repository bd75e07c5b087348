use anyhow::{anyhow, bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::coint::MIN_COINT_OBS;
use crate::ports::exchange::Exchange;
use crate::positions::Thresholds;

const DEFAULT_EXCHANGE_ID: &str = "kraken";
const DEFAULT_SYMBOL_Y: &str = "BTC/USD";
const DEFAULT_SYMBOL_X: &str = "ETH/USD";
const DEFAULT_TIMEFRAME: &str = "1h";
const DEFAULT_LIMIT: usize = 1500;
const DEFAULT_LOOKBACK_BETA: usize = 200;
const DEFAULT_LOOKBACK_Z: usize = 200;
const DEFAULT_ENTRY_Z: f64 = 2.0;
const DEFAULT_EXIT_Z: f64 = 0.5;
const DEFAULT_GROSS_LEVERAGE: f64 = 1.0;
const DEFAULT_MAX_HOLDING_BARS: usize = 336;
const DEFAULT_FEE_BPS: f64 = 4.0;
const DEFAULT_SLIPPAGE_BPS: f64 = 2.0;
const DEFAULT_LOOKBACK_COINT: usize = 300;
const DEFAULT_COINT_P_THRESHOLD: f64 = 0.05;
const DEFAULT_LOOKBACK_SPREAD_VOL: usize = 200;
const DEFAULT_TARGET_SPREAD_VOL: f64 = 0.0015;
const DEFAULT_MAX_GROSS_LEVERAGE: f64 = 2.0;
const DEFAULT_MIN_SCALE: f64 = 0.0;
const DEFAULT_MAX_SCALE: f64 = 3.0;
const DEFAULT_SYNTHETIC_SEED: u64 = 42;
const DEFAULT_RESULTS_DIR: &str = "results";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Exchange,
    Replay,
    Synthetic,
}

impl FromStr for DataSource {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exchange" => Ok(DataSource::Exchange),
            "replay" => Ok(DataSource::Replay),
            "synthetic" => Ok(DataSource::Synthetic),
            other => Err(anyhow!("unknown data source '{}'", other)),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataSource::Exchange => write!(f, "exchange"),
            DataSource::Replay => write!(f, "replay"),
            DataSource::Synthetic => write!(f, "synthetic"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BacktestYaml {
    exchange_id: Option<String>,
    symbol_y: Option<String>,
    symbol_x: Option<String>,
    timeframe: Option<String>,
    limit: Option<usize>,
    lookback_beta: Option<usize>,
    lookback_z: Option<usize>,
    entry_z: Option<f64>,
    exit_z: Option<f64>,
    gross_leverage: Option<f64>,
    max_holding_bars: Option<usize>,
    fee_bps: Option<f64>,
    slippage_bps: Option<f64>,
    lookback_coint: Option<usize>,
    coint_p_threshold: Option<f64>,
    lookback_spread_vol: Option<usize>,
    target_spread_vol: Option<f64>,
    max_gross_leverage: Option<f64>,
    min_scale: Option<f64>,
    max_scale: Option<f64>,
    data_source: Option<String>,
    exchange_base_url: Option<String>,
    replay_file: Option<String>,
    synthetic_seed: Option<u64>,
    results_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub exchange_id: String,
    pub symbol_y: String,
    pub symbol_x: String,
    pub timeframe: String,
    pub limit: usize,
    pub lookback_beta: usize,
    pub lookback_z: usize,
    pub entry_z: f64,
    pub exit_z: f64,
    pub gross_leverage: f64,
    pub max_holding_bars: usize,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub lookback_coint: usize,
    pub coint_p_threshold: f64,
    pub lookback_spread_vol: usize,
    pub target_spread_vol: f64,
    pub max_gross_leverage: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub data_source: DataSource,
    pub exchange_base_url: Option<String>,
    pub replay_file: Option<String>,
    pub synthetic_seed: u64,
    pub results_dir: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            exchange_id: DEFAULT_EXCHANGE_ID.to_string(),
            symbol_y: DEFAULT_SYMBOL_Y.to_string(),
            symbol_x: DEFAULT_SYMBOL_X.to_string(),
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            limit: DEFAULT_LIMIT,
            lookback_beta: DEFAULT_LOOKBACK_BETA,
            lookback_z: DEFAULT_LOOKBACK_Z,
            entry_z: DEFAULT_ENTRY_Z,
            exit_z: DEFAULT_EXIT_Z,
            gross_leverage: DEFAULT_GROSS_LEVERAGE,
            max_holding_bars: DEFAULT_MAX_HOLDING_BARS,
            fee_bps: DEFAULT_FEE_BPS,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
            lookback_coint: DEFAULT_LOOKBACK_COINT,
            coint_p_threshold: DEFAULT_COINT_P_THRESHOLD,
            lookback_spread_vol: DEFAULT_LOOKBACK_SPREAD_VOL,
            target_spread_vol: DEFAULT_TARGET_SPREAD_VOL,
            max_gross_leverage: DEFAULT_MAX_GROSS_LEVERAGE,
            min_scale: DEFAULT_MIN_SCALE,
            max_scale: DEFAULT_MAX_SCALE,
            data_source: DataSource::Synthetic,
            exchange_base_url: None,
            replay_file: None,
            synthetic_seed: DEFAULT_SYNTHETIC_SEED,
            results_dir: DEFAULT_RESULTS_DIR.to_string(),
        }
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
        *slot = value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {}='{}': {}", key, value, e))?;
    }
    Ok(())
}

fn override_string<F>(lookup: &F, key: &str, slot: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
        *slot = value;
    }
}

impl BacktestConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRTRADE_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut cfg = Self::from_yaml_file(path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Reads a YAML file without consulting the environment.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to open backtest config {}", path_ref.display()))?;
        let cfg = if raw.trim().is_empty() {
            Self::default()
        } else {
            let yaml: BacktestYaml = serde_yaml::from_str(&raw).with_context(|| {
                format!("failed to parse backtest config {}", path_ref.display())
            })?;
            Self::from_yaml(yaml)?
        };
        log::info!("[CONFIG] loaded {}", path_ref.display());
        Ok(cfg)
    }

    fn from_yaml(yaml: BacktestYaml) -> Result<Self> {
        let defaults = Self::default();
        let data_source = match yaml.data_source.as_deref() {
            Some(value) => value.parse()?,
            None => defaults.data_source,
        };
        Ok(Self {
            exchange_id: yaml.exchange_id.unwrap_or(defaults.exchange_id),
            symbol_y: yaml.symbol_y.unwrap_or(defaults.symbol_y),
            symbol_x: yaml.symbol_x.unwrap_or(defaults.symbol_x),
            timeframe: yaml.timeframe.unwrap_or(defaults.timeframe),
            limit: yaml.limit.unwrap_or(DEFAULT_LIMIT),
            lookback_beta: yaml.lookback_beta.unwrap_or(DEFAULT_LOOKBACK_BETA),
            lookback_z: yaml.lookback_z.unwrap_or(DEFAULT_LOOKBACK_Z),
            entry_z: yaml.entry_z.unwrap_or(DEFAULT_ENTRY_Z),
            exit_z: yaml.exit_z.unwrap_or(DEFAULT_EXIT_Z),
            gross_leverage: yaml.gross_leverage.unwrap_or(DEFAULT_GROSS_LEVERAGE),
            max_holding_bars: yaml.max_holding_bars.unwrap_or(DEFAULT_MAX_HOLDING_BARS),
            fee_bps: yaml.fee_bps.unwrap_or(DEFAULT_FEE_BPS),
            slippage_bps: yaml.slippage_bps.unwrap_or(DEFAULT_SLIPPAGE_BPS),
            lookback_coint: yaml.lookback_coint.unwrap_or(DEFAULT_LOOKBACK_COINT),
            coint_p_threshold: yaml
                .coint_p_threshold
                .unwrap_or(DEFAULT_COINT_P_THRESHOLD),
            lookback_spread_vol: yaml
                .lookback_spread_vol
                .unwrap_or(DEFAULT_LOOKBACK_SPREAD_VOL),
            target_spread_vol: yaml
                .target_spread_vol
                .unwrap_or(DEFAULT_TARGET_SPREAD_VOL),
            max_gross_leverage: yaml
                .max_gross_leverage
                .unwrap_or(DEFAULT_MAX_GROSS_LEVERAGE),
            min_scale: yaml.min_scale.unwrap_or(DEFAULT_MIN_SCALE),
            max_scale: yaml.max_scale.unwrap_or(DEFAULT_MAX_SCALE),
            data_source,
            exchange_base_url: yaml.exchange_base_url,
            replay_file: yaml.replay_file,
            synthetic_seed: yaml.synthetic_seed.unwrap_or(DEFAULT_SYNTHETIC_SEED),
            results_dir: yaml.results_dir.unwrap_or(defaults.results_dir),
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Applies upper-case overrides resolved through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_string(&lookup, "EXCHANGE_ID", &mut self.exchange_id);
        override_string(&lookup, "SYMBOL_Y", &mut self.symbol_y);
        override_string(&lookup, "SYMBOL_X", &mut self.symbol_x);
        override_string(&lookup, "TIMEFRAME", &mut self.timeframe);
        override_parsed(&lookup, "LIMIT", &mut self.limit)?;
        override_parsed(&lookup, "LOOKBACK_BETA", &mut self.lookback_beta)?;
        override_parsed(&lookup, "LOOKBACK_Z", &mut self.lookback_z)?;
        override_parsed(&lookup, "ENTRY_Z", &mut self.entry_z)?;
        override_parsed(&lookup, "EXIT_Z", &mut self.exit_z)?;
        override_parsed(&lookup, "GROSS_LEVERAGE", &mut self.gross_leverage)?;
        override_parsed(&lookup, "MAX_HOLDING_BARS", &mut self.max_holding_bars)?;
        override_parsed(&lookup, "FEE_BPS", &mut self.fee_bps)?;
        override_parsed(&lookup, "SLIPPAGE_BPS", &mut self.slippage_bps)?;
        override_parsed(&lookup, "LOOKBACK_COINT", &mut self.lookback_coint)?;
        override_parsed(&lookup, "COINT_P_THRESHOLD", &mut self.coint_p_threshold)?;
        override_parsed(&lookup, "LOOKBACK_SPREAD_VOL", &mut self.lookback_spread_vol)?;
        override_parsed(&lookup, "TARGET_SPREAD_VOL", &mut self.target_spread_vol)?;
        override_parsed(&lookup, "MAX_GROSS_LEVERAGE", &mut self.max_gross_leverage)?;
        override_parsed(&lookup, "MIN_SCALE", &mut self.min_scale)?;
        override_parsed(&lookup, "MAX_SCALE", &mut self.max_scale)?;
        override_parsed(&lookup, "DATA_SOURCE", &mut self.data_source)?;
        if let Some(value) = lookup("EXCHANGE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.exchange_base_url = Some(value);
        }
        if let Some(value) = lookup("REPLAY_FILE").filter(|v| !v.trim().is_empty()) {
            self.replay_file = Some(value);
        }
        override_parsed(&lookup, "SYNTHETIC_SEED", &mut self.synthetic_seed)?;
        override_string(&lookup, "RESULTS_DIR", &mut self.results_dir);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("limit", self.limit),
            ("lookback_beta", self.lookback_beta),
            ("lookback_z", self.lookback_z),
            ("lookback_coint", self.lookback_coint),
            ("lookback_spread_vol", self.lookback_spread_vol),
        ] {
            if value == 0 {
                bail!("{} must be positive", name);
            }
        }
        if !(self.exit_z >= 0.0) {
            bail!("exit_z must be non-negative, got {}", self.exit_z);
        }
        if !(self.entry_z > self.exit_z) {
            bail!(
                "entry_z ({}) must be greater than exit_z ({})",
                self.entry_z,
                self.exit_z
            );
        }
        for (name, value) in [
            ("gross_leverage", self.gross_leverage),
            ("max_gross_leverage", self.max_gross_leverage),
            ("fee_bps", self.fee_bps),
            ("slippage_bps", self.slippage_bps),
            ("target_spread_vol", self.target_spread_vol),
            ("min_scale", self.min_scale),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                bail!("{} must be a non-negative number, got {}", name, value);
            }
        }
        if !(self.min_scale <= self.max_scale) {
            bail!(
                "min_scale ({}) must not exceed max_scale ({})",
                self.min_scale,
                self.max_scale
            );
        }
        if !(self.coint_p_threshold > 0.0 && self.coint_p_threshold < 1.0) {
            bail!(
                "coint_p_threshold must lie in (0, 1), got {}",
                self.coint_p_threshold
            );
        }
        if self.lookback_coint < MIN_COINT_OBS {
            bail!(
                "lookback_coint must be at least {}, got {}",
                MIN_COINT_OBS,
                self.lookback_coint
            );
        }
        if self.data_source == DataSource::Replay && self.replay_file.is_none() {
            bail!("data_source=replay requires replay_file");
        }
        let bar = self.bar_duration()?;
        if self.data_source == DataSource::Exchange {
            let exchange: Exchange = self.exchange_id.parse()?;
            exchange
                .interval(bar)
                .with_context(|| format!("timeframe '{}' not served", self.timeframe))?;
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            entry_z: self.entry_z,
            exit_z: self.exit_z,
        }
    }

    /// Parses `timeframe` such as `15m`, `1h` or `1d`.
    pub fn bar_duration(&self) -> Result<Duration> {
        parse_timeframe(&self.timeframe)
    }
}

pub fn parse_timeframe(timeframe: &str) -> Result<Duration> {
    let tf = timeframe.trim();
    let split = tf
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("timeframe '{}' has no unit", timeframe))?;
    let (count, unit) = tf.split_at(split);
    let count: i64 = count
        .parse()
        .with_context(|| format!("timeframe '{}' has no count", timeframe))?;
    if count <= 0 {
        bail!("timeframe '{}' must be positive", timeframe);
    }
    match unit {
        "m" => Ok(Duration::minutes(count)),
        "h" => Ok(Duration::hours(count)),
        "d" => Ok(Duration::days(count)),
        "w" => Ok(Duration::weeks(count)),
        _ => bail!("timeframe '{}' has unknown unit '{}'", timeframe, unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = BacktestConfig::default();
        assert_eq!(cfg.lookback_coint, 300);
        assert_eq!(cfg.max_holding_bars, 336);
        assert_eq!(cfg.target_spread_vol, 0.0015);
        cfg.validate().unwrap();
    }

    #[test]
    fn yaml_fields_override_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "symbol_y: SOL/USD\nentry_z: 2.5\nlookback_beta: 50\ndata_source: replay\nreplay_file: dump.jsonl"
        )
        .unwrap();
        let cfg = BacktestConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(cfg.symbol_y, "SOL/USD");
        assert_eq!(cfg.symbol_x, DEFAULT_SYMBOL_X);
        assert_eq!(cfg.entry_z, 2.5);
        assert_eq!(cfg.lookback_beta, 50);
        assert_eq!(cfg.lookback_z, DEFAULT_LOOKBACK_Z);
        assert_eq!(cfg.data_source, DataSource::Replay);
        assert_eq!(cfg.replay_file.as_deref(), Some("dump.jsonl"));
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let file = NamedTempFile::new().unwrap();
        let cfg = BacktestConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(cfg, BacktestConfig::default());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "entry_z: [not, a, number]").unwrap();
        assert!(BacktestConfig::from_yaml_file(file.path()).is_err());
        assert!(BacktestConfig::from_yaml_file("/nonexistent/backtest.yaml").is_err());
    }

    #[test]
    fn overrides_replace_individual_fields() {
        let mut cfg = BacktestConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("FEE_BPS", "1.5"),
            ("LOOKBACK_Z", "120"),
            ("DATA_SOURCE", "Replay"),
            ("REPLAY_FILE", "/tmp/x.jsonl"),
            ("SYMBOL_X", " "),
        ]))
        .unwrap();
        assert_eq!(cfg.fee_bps, 1.5);
        assert_eq!(cfg.lookback_z, 120);
        assert_eq!(cfg.data_source, DataSource::Replay);
        assert_eq!(cfg.replay_file.as_deref(), Some("/tmp/x.jsonl"));
        assert_eq!(cfg.symbol_x, DEFAULT_SYMBOL_X);
    }

    #[test]
    fn unparsable_override_is_reported() {
        let mut cfg = BacktestConfig::default();
        let err = cfg
            .apply_overrides_from(lookup(&[("ENTRY_Z", "two")]))
            .unwrap_err();
        assert!(err.to_string().contains("ENTRY_Z"));
    }

    #[test]
    fn validate_rejects_inconsistent_settings() {
        let cases: [fn(&mut BacktestConfig); 12] = [
            |c| c.lookback_beta = 0,
            |c| c.exit_z = -0.1,
            |c| c.entry_z = c.exit_z,
            |c| c.fee_bps = -1.0,
            |c| c.gross_leverage = f64::NAN,
            |c| c.min_scale = 4.0,
            |c| c.coint_p_threshold = 1.0,
            |c| c.lookback_coint = 10,
            |c| c.data_source = DataSource::Replay,
            |c| c.timeframe = "hourly".to_string(),
            |c| {
                c.data_source = DataSource::Exchange;
                c.exchange_id = "ftx".to_string();
            },
            |c| {
                c.data_source = DataSource::Exchange;
                c.timeframe = "2h".to_string();
            },
        ];
        for mutate in cases {
            let mut cfg = BacktestConfig::default();
            mutate(&mut cfg);
            assert!(cfg.validate().is_err(), "{:?}", cfg);
        }
    }

    #[test]
    fn exchange_source_is_keyed_on_exchange_and_timeframe() {
        let mut cfg = BacktestConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("DATA_SOURCE", "exchange"),
            ("EXCHANGE_ID", "binance"),
            ("TIMEFRAME", "2h"),
            ("EXCHANGE_BASE_URL", "http://127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.data_source, DataSource::Exchange);
        assert_eq!(cfg.exchange_base_url.as_deref(), Some("http://127.0.0.1:9000"));
        cfg.validate().unwrap();

        // Kraken has no 2h bars; synthetic data does not care.
        cfg.exchange_id = "kraken".to_string();
        assert!(cfg.validate().is_err());
        cfg.data_source = DataSource::Synthetic;
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_timeframes() {
        assert_eq!(parse_timeframe("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_timeframe("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_timeframe("4h").unwrap(), Duration::hours(4));
        assert_eq!(parse_timeframe("1d").unwrap(), Duration::days(1));
        assert!(parse_timeframe("h").is_err());
        assert!(parse_timeframe("0h").is_err());
        assert!(parse_timeframe("12").is_err());
        assert!(parse_timeframe("1y").is_err());
    }
}
