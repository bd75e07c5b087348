pub mod exchange;
pub mod replay;
pub mod synthetic;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::config::{BacktestConfig, DataSource};
use crate::series::{align_closes, AlignedPrices, Candle};
use exchange::ExchangeSource;
use replay::ReplaySource;
use synthetic::{SyntheticPair, SyntheticSource};

/// Anything that can hand back the most recent closes for a symbol.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_closes(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>>;
}

/// Fetches both legs concurrently and inner-joins them on timestamp.
pub async fn load_pair(
    source: &dyn CandleSource,
    symbol_y: &str,
    symbol_x: &str,
    limit: usize,
) -> Result<AlignedPrices> {
    let (y, x) = tokio::try_join!(
        source.fetch_closes(symbol_y, limit),
        source.fetch_closes(symbol_x, limit)
    )?;
    log::info!(
        "[DATA] fetched {}={} {}={} closes",
        symbol_y,
        y.len(),
        symbol_x,
        x.len()
    );
    align_closes(&y, &x).with_context(|| format!("failed to align {} / {}", symbol_y, symbol_x))
}

pub fn source_from_config(cfg: &BacktestConfig) -> Result<Box<dyn CandleSource>> {
    match cfg.data_source {
        DataSource::Exchange => {
            let source = ExchangeSource::new(
                &cfg.exchange_id,
                cfg.bar_duration()?,
                cfg.exchange_base_url.as_deref(),
            )?;
            log::info!(
                "[DATA] {} OHLC {}/{} every {}",
                source.exchange(),
                cfg.symbol_y,
                cfg.symbol_x,
                cfg.timeframe
            );
            Ok(Box::new(source))
        }
        DataSource::Replay => {
            let path = cfg
                .replay_file
                .as_deref()
                .ok_or_else(|| anyhow!("data_source=replay requires replay_file"))?;
            Ok(Box::new(ReplaySource::new(path)?))
        }
        DataSource::Synthetic => {
            log::info!(
                "[DATA] synthetic pair {}/{} seed={}",
                cfg.symbol_y,
                cfg.symbol_x,
                cfg.synthetic_seed
            );
            Ok(Box::new(SyntheticSource::new(
                &cfg.symbol_y,
                &cfg.symbol_x,
                SyntheticPair::default(),
                cfg.synthetic_seed,
                cfg.bar_duration()?,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;

    struct FixedSource;

    fn candle(hour: i64, close: i64) -> Candle {
        Candle {
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000 + hour * 3600, 0).unwrap(),
            close: Decimal::from(close),
        }
    }

    #[async_trait]
    impl CandleSource for FixedSource {
        async fn fetch_closes(&self, symbol: &str, _limit: usize) -> Result<Vec<Candle>> {
            match symbol {
                "Y" => Ok(vec![candle(0, 10), candle(1, 11), candle(2, 12)]),
                "X" => Ok(vec![candle(1, 21), candle(2, 22), candle(3, 23)]),
                _ => Err(anyhow!("unknown symbol {}", symbol)),
            }
        }
    }

    #[tokio::test]
    async fn load_pair_aligns_both_legs() {
        let prices = load_pair(&FixedSource, "Y", "X", 10).await.unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices.y(), &[11.0, 12.0]);
        assert_eq!(prices.x(), &[21.0, 22.0]);
    }

    #[tokio::test]
    async fn load_pair_propagates_source_errors() {
        assert!(load_pair(&FixedSource, "Y", "Z", 10).await.is_err());
    }

    #[tokio::test]
    async fn synthetic_config_builds_a_usable_source() {
        let cfg = BacktestConfig {
            limit: 64,
            ..BacktestConfig::default()
        };
        let source = source_from_config(&cfg).unwrap();
        let prices = load_pair(source.as_ref(), &cfg.symbol_y, &cfg.symbol_x, cfg.limit)
            .await
            .unwrap();
        assert_eq!(prices.len(), 64);
    }

    #[test]
    fn exchange_config_rejects_unknown_venues() {
        let cfg = BacktestConfig {
            data_source: DataSource::Exchange,
            exchange_id: "ftx".to_string(),
            ..BacktestConfig::default()
        };
        assert!(source_from_config(&cfg).is_err());

        let cfg = BacktestConfig {
            data_source: DataSource::Exchange,
            ..BacktestConfig::default()
        };
        assert!(source_from_config(&cfg).is_ok());
    }

    #[test]
    fn replay_config_requires_a_readable_file() {
        let cfg = BacktestConfig {
            data_source: DataSource::Replay,
            replay_file: Some("/nonexistent/dump.jsonl".to_string()),
            ..BacktestConfig::default()
        };
        assert!(source_from_config(&cfg).is_err());
    }
}
