use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use super::CandleSource;
use crate::series::Candle;

const SYNTHETIC_START_SECS: i64 = 1_700_000_000;

/// Cointegrated pair: `log x` is a Gaussian random walk and
/// `log y = hedge_ratio * log x + intercept + u` with `u` a stationary AR(1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticPair {
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub start_log_x: f64,
    pub step_vol: f64,
    pub noise_vol: f64,
    pub noise_ar: f64,
}

impl Default for SyntheticPair {
    fn default() -> Self {
        Self {
            hedge_ratio: 1.5,
            intercept: 0.3,
            start_log_x: 7.6,
            step_vol: 0.01,
            noise_vol: 0.002,
            noise_ar: 0.5,
        }
    }
}

impl SyntheticPair {
    /// Returns `(log y, log x)`.
    pub fn log_prices(&self, len: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ly = Vec::with_capacity(len);
        let mut lx = Vec::with_capacity(len);
        let mut level = self.start_log_x;
        let mut noise = 0.0;
        for _ in 0..len {
            let step: f64 = rng.sample(StandardNormal);
            let shock: f64 = rng.sample(StandardNormal);
            level += self.step_vol * step;
            noise = self.noise_ar * noise + self.noise_vol * shock;
            lx.push(level);
            ly.push(self.hedge_ratio * level + self.intercept + noise);
        }
        (ly, lx)
    }

    /// Returns `(y, x)` prices.
    pub fn prices(&self, len: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let (ly, lx) = self.log_prices(len, seed);
        (
            ly.into_iter().map(f64::exp).collect(),
            lx.into_iter().map(f64::exp).collect(),
        )
    }
}

/// Offline source that serves one generated pair under the configured
/// symbols, one bar per `bar` interval.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    symbol_y: String,
    symbol_x: String,
    pair: SyntheticPair,
    seed: u64,
    bar: Duration,
}

impl SyntheticSource {
    pub fn new(symbol_y: &str, symbol_x: &str, pair: SyntheticPair, seed: u64, bar: Duration) -> Self {
        Self {
            symbol_y: symbol_y.to_string(),
            symbol_x: symbol_x.to_string(),
            pair,
            seed,
            bar,
        }
    }
}

#[async_trait]
impl CandleSource for SyntheticSource {
    async fn fetch_closes(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let (y, x) = self.pair.prices(limit, self.seed);
        let closes = if symbol == self.symbol_y {
            y
        } else if symbol == self.symbol_x {
            x
        } else {
            return Err(anyhow!(
                "synthetic source only serves {} and {}, not {}",
                self.symbol_y,
                self.symbol_x,
                symbol
            ));
        };
        let mut ts = DateTime::<Utc>::from_timestamp(SYNTHETIC_START_SECS, 0)
            .ok_or_else(|| anyhow!("invalid synthetic start timestamp"))?;
        let mut candles = Vec::with_capacity(closes.len());
        for (i, close) in closes.into_iter().enumerate() {
            if i > 0 {
                ts = ts.checked_add_signed(self.bar).ok_or_else(|| {
                    anyhow!("synthetic timestamp overflows at bar {} of {}", i, limit)
                })?;
            }
            let close = Decimal::from_f64(close)
                .ok_or_else(|| anyhow!("synthetic close {} is not representable", close))?;
            candles.push(Candle { ts, close });
        }
        Ok(candles)
    }
}
