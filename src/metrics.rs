use serde::Serialize;

use crate::backtest::BacktestRecord;
use crate::positions::SpreadPosition;

/// Annualization factor for a bar size; unknown sizes fall back to daily.
pub fn periods_per_year(timeframe: &str) -> f64 {
    match timeframe.trim() {
        "1m" => 525_600.0,
        "5m" => 105_120.0,
        "15m" => 35_040.0,
        "1h" => 8_760.0,
        "4h" => 2_190.0,
        "1d" => 365.0,
        _ => 365.0,
    }
}

/// Population Sharpe ratio of per-bar returns, annualized.
pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    // Centred on the first return so a constant series has zero variance.
    let shift = returns[0];
    let n = returns.len() as f64;
    let mean_dev = returns.iter().map(|r| r - shift).sum::<f64>() / n;
    let var = returns
        .iter()
        .map(|r| (r - shift - mean_dev).powi(2))
        .sum::<f64>()
        / n;
    let mean = shift + mean_dev;
    let std = var.sqrt();
    if std == 0.0 || !std.is_finite() {
        return 0.0;
    }
    mean / std * periods_per_year.sqrt()
}

/// Most negative `equity / running peak - 1`, or 0 for an empty curve.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst: f64 = 0.0;
    for e in equity {
        peak = peak.max(*e);
        if peak > 0.0 {
            worst = worst.min(e / peak - 1.0);
        }
    }
    worst
}

pub fn hit_rate(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().filter(|r| **r > 0.0).count() as f64 / returns.len() as f64
}

/// Bars where the book moves from flat to an open position.
pub fn count_entries(positions: &[SpreadPosition]) -> usize {
    let mut prev = SpreadPosition::Flat;
    let mut entries = 0;
    for pos in positions {
        if prev.is_flat() && !pos.is_flat() {
            entries += 1;
        }
        prev = *pos;
    }
    entries
}

fn fraction(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Keys serialize in PascalCase (`Sharpe`, `MaxDrawdown`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Summary {
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub hit_rate: f64,
    pub total_return: f64,
    pub bars: usize,
    pub entries: usize,
    pub time_in_market: f64,
    pub tradable_fraction: f64,
}

pub fn summarize(
    record: &BacktestRecord,
    positions: &[SpreadPosition],
    tradable: &[bool],
    timeframe: &str,
) -> Summary {
    let net = record.net_returns();
    let equity = record.equity();
    let in_market = positions.iter().filter(|p| !p.is_flat()).count();
    let tradable_bars = tradable.iter().filter(|t| **t).count();
    Summary {
        sharpe: sharpe_ratio(&net, periods_per_year(timeframe)),
        max_drawdown: max_drawdown(&equity),
        hit_rate: hit_rate(&net),
        total_return: record.final_equity() - 1.0,
        bars: record.len(),
        entries: count_entries(positions),
        time_in_market: fraction(in_market, positions.len()),
        tradable_fraction: fraction(tradable_bars, tradable.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::SpreadPosition::{Flat, LongSpread, ShortSpread};

    #[test]
    fn periods_per_year_covers_known_bars() {
        assert_eq!(periods_per_year("1h"), 8760.0);
        assert_eq!(periods_per_year("15m"), 35040.0);
        assert_eq!(periods_per_year("3d"), 365.0);
    }

    #[test]
    fn sharpe_is_zero_without_dispersion() {
        assert_eq!(sharpe_ratio(&[0.01; 10], 8760.0), 0.0);
        assert_eq!(sharpe_ratio(&[0.0003; 500], 8760.0), 0.0);
        assert_eq!(sharpe_ratio(&[-0.1; 7], 365.0), 0.0);
        assert_eq!(sharpe_ratio(&[], 8760.0), 0.0);
    }

    #[test]
    fn sharpe_uses_population_std() {
        // mean 0.01, population std 0.01
        let s = sharpe_ratio(&[0.0, 0.02], 4.0);
        assert!((s - 2.0).abs() < 1e-12);
    }

    #[test]
    fn drawdown_tracks_running_peak() {
        let dd = max_drawdown(&[1.0, 1.2, 0.9, 1.1, 1.3, 1.17]);
        assert!((dd - (0.9 / 1.2 - 1.0)).abs() < 1e-12);
        assert_eq!(max_drawdown(&[1.0, 1.0, 1.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn hit_rate_counts_strictly_positive_bars() {
        assert_eq!(hit_rate(&[0.1, 0.0, -0.1, 0.2]), 0.5);
        assert_eq!(hit_rate(&[]), 0.0);
    }

    #[test]
    fn entries_count_only_moves_out_of_flat() {
        let positions = [Flat, LongSpread, LongSpread, Flat, ShortSpread, Flat, Flat, LongSpread];
        assert_eq!(count_entries(&positions), 3);
        assert_eq!(count_entries(&[LongSpread, LongSpread]), 1);
    }

    #[test]
    fn summary_uses_report_key_names() {
        let summary = Summary {
            sharpe: 1.0,
            max_drawdown: -0.1,
            hit_rate: 0.5,
            total_return: 0.2,
            bars: 10,
            entries: 2,
            time_in_market: 0.3,
            tradable_fraction: 0.9,
        };
        let value = serde_json::to_value(&summary).unwrap();
        for key in [
            "Sharpe",
            "MaxDrawdown",
            "HitRate",
            "TotalReturn",
            "Bars",
            "Entries",
            "TimeInMarket",
            "TradableFraction",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
