use chrono::{DateTime, Utc};

use crate::coint::rolling_coint_pvalues;
use crate::config::BacktestConfig;
use crate::series::AlignedPrices;

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Mean and population variance of a full window, or `None` when any slot
/// is missing. Values are shifted by the first element before summing so a
/// constant window has a variance of exactly zero.
fn window_moments(window: &[Option<f64>]) -> Option<(f64, f64)> {
    let shift = (*window.first()?)?;
    let mut sum = 0.0;
    for v in window {
        sum += (*v)? - shift;
    }
    let n = window.len() as f64;
    let mean_dev = sum / n;
    let mut sum_sq = 0.0;
    for v in window.iter().flatten() {
        let d = v - shift - mean_dev;
        sum_sq += d * d;
    }
    Some((shift + mean_dev, sum_sq / n))
}

fn rolling<T, F>(len: usize, window: usize, mut f: F) -> Vec<Option<T>>
where
    F: FnMut(usize, usize) -> Option<T>,
{
    (0..len)
        .map(|t| {
            if window == 0 || t + 1 < window {
                None
            } else {
                f(t + 1 - window, t)
            }
        })
        .collect()
}

/// Trailing-window mean and population standard deviation.
pub fn rolling_mean_std(values: &[Option<f64>], window: usize) -> Vec<Option<(f64, f64)>> {
    rolling(values.len(), window, |start, end| {
        let (mean, var) = window_moments(&values[start..=end])?;
        Some((mean, var.max(0.0).sqrt()))
    })
}

/// Rolling hedge ratio `cov(y, x) / var(x)` over `window` observations.
/// A zero variance of `x` yields `None` rather than an infinite ratio.
pub fn rolling_hedge_ratio(ly: &[f64], lx: &[f64], window: usize) -> Vec<Option<f64>> {
    let len = ly.len().min(lx.len());
    rolling(len, window, |start, end| {
        let ys = &ly[start..=end];
        let xs = &lx[start..=end];
        let (shift_y, shift_x) = (ys[0], xs[0]);
        let n = ys.len() as f64;
        let mean_y = ys.iter().map(|v| v - shift_y).sum::<f64>() / n;
        let mean_x = xs.iter().map(|v| v - shift_x).sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var_x = 0.0;
        for (y, x) in ys.iter().zip(xs) {
            let dy = y - shift_y - mean_y;
            let dx = x - shift_x - mean_x;
            cov += dx * dy;
            var_x += dx * dx;
        }
        if var_x == 0.0 {
            return None;
        }
        finite(cov / var_x)
    })
}

/// `ly - beta * lx`, undefined wherever `beta` is.
pub fn compute_spread(ly: &[f64], lx: &[f64], beta: &[Option<f64>]) -> Vec<Option<f64>> {
    ly.iter()
        .zip(lx)
        .zip(beta)
        .map(|((y, x), b)| b.and_then(|b| finite(y - b * x)))
        .collect()
}

/// `(spread - rolling mean) / rolling population std`.
pub fn rolling_zscore(spread: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    rolling_mean_std(spread, window)
        .into_iter()
        .zip(spread)
        .map(|(stats, s)| {
            let (mean, std) = stats?;
            if std == 0.0 {
                return None;
            }
            finite(((*s)? - mean) / std)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolTarget {
    pub window: usize,
    pub target: f64,
    pub min_scale: f64,
    pub max_scale: f64,
}

/// Exposure multiplier `target / rolling std(diff(spread))`, bounded to
/// `[min_scale, max_scale]`. Undefined or non-finite ratios count as zero
/// before clamping, so every bar gets a value.
pub fn vol_target_scale(spread: &[Option<f64>], params: &VolTarget) -> Vec<f64> {
    let diffs: Vec<Option<f64>> = (0..spread.len())
        .map(|t| {
            if t == 0 {
                return None;
            }
            let (prev, curr) = (spread[t - 1]?, spread[t]?);
            finite(curr - prev)
        })
        .collect();
    rolling_mean_std(&diffs, params.window)
        .into_iter()
        .map(|stats| {
            let raw = stats
                .and_then(|(_, std)| finite(params.target / std))
                .unwrap_or(0.0);
            raw.max(params.min_scale).min(params.max_scale)
        })
        .collect()
}

/// Per-bar derived signals; columns share the input index.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    pub timestamps: Vec<DateTime<Utc>>,
    pub ly: Vec<f64>,
    pub lx: Vec<f64>,
    pub beta: Vec<Option<f64>>,
    pub spread: Vec<Option<f64>>,
    pub z: Vec<Option<f64>>,
    pub coint_p: Vec<Option<f64>>,
    pub tradable: Vec<bool>,
    pub vol_scale: Vec<f64>,
}

impl FeatureFrame {
    pub fn compute(prices: &AlignedPrices, cfg: &BacktestConfig) -> Self {
        let ly = prices.log_y();
        let lx = prices.log_x();

        let beta = rolling_hedge_ratio(&ly, &lx, cfg.lookback_beta);
        let spread = compute_spread(&ly, &lx, &beta);
        let z = rolling_zscore(&spread, cfg.lookback_z);
        let coint_p = rolling_coint_pvalues(&ly, &lx, cfg.lookback_coint);
        let tradable = coint_p
            .iter()
            .map(|p| p.map(|p| p < cfg.coint_p_threshold).unwrap_or(false))
            .collect();
        let vol_scale = vol_target_scale(
            &spread,
            &VolTarget {
                window: cfg.lookback_spread_vol,
                target: cfg.target_spread_vol,
                min_scale: cfg.min_scale,
                max_scale: cfg.max_scale,
            },
        );

        Self {
            timestamps: prices.timestamps().to_vec(),
            ly,
            lx,
            beta,
            spread,
            z,
            coint_p,
            tradable,
            vol_scale,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}
