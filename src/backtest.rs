use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BacktestConfig;
use crate::positions::SpreadPosition;
use crate::series::{AlignedPrices, PipelineError};

/// Sizing and friction inputs for the PnL engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacktestParams {
    pub gross_leverage: f64,
    pub max_gross_leverage: f64,
    pub fee_bps: f64,
    pub slippage_bps: f64,
}

impl BacktestParams {
    /// Cost charged per unit of turnover.
    pub fn cost_ratio(&self) -> f64 {
        (self.fee_bps + self.slippage_bps) / 10_000.0
    }

    fn effective_gross(&self, vol_scale: f64) -> f64 {
        let gross = self.gross_leverage * vol_scale;
        if !gross.is_finite() {
            return 0.0;
        }
        gross.max(0.0).min(self.max_gross_leverage)
    }
}

impl From<&BacktestConfig> for BacktestParams {
    fn from(cfg: &BacktestConfig) -> Self {
        Self {
            gross_leverage: cfg.gross_leverage,
            max_gross_leverage: cfg.max_gross_leverage,
            fee_bps: cfg.fee_bps,
            slippage_bps: cfg.slippage_bps,
        }
    }
}

/// One bar of the simulated book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestRow {
    pub ts: DateTime<Utc>,
    pub ret_y: Option<f64>,
    pub ret_x: Option<f64>,
    pub position: i8,
    pub beta: Option<f64>,
    pub vol_scale: f64,
    pub effective_gross: f64,
    pub w_y: f64,
    pub w_x: f64,
    pub turnover: f64,
    pub ret_gross: f64,
    pub cost: f64,
    pub ret_net: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRecord {
    pub rows: Vec<BacktestRow>,
}

impl BacktestRecord {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn net_returns(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.ret_net).collect()
    }

    pub fn equity(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.equity).collect()
    }

    pub fn final_equity(&self) -> f64 {
        self.rows.last().map(|r| r.equity).unwrap_or(1.0)
    }

    pub fn total_cost(&self) -> f64 {
        self.rows.iter().map(|r| r.cost).sum()
    }
}

/// Splits `effective_gross` across the legs so that `|w_y| + |w_x|` equals it
/// whenever a position is open. Undefined beta means no book at all.
fn leg_weights(position: SpreadPosition, beta: Option<f64>, effective_gross: f64) -> (f64, f64) {
    let Some(beta) = beta else {
        return (0.0, 0.0);
    };
    if position.is_flat() {
        return (0.0, 0.0);
    }
    let per_unit = effective_gross / (1.0 + beta.abs());
    let side = position.as_f64();
    let (w_y, w_x) = (side * per_unit, -side * per_unit * beta);
    if w_y.is_finite() && w_x.is_finite() {
        (w_y, w_x)
    } else {
        (0.0, 0.0)
    }
}

fn log_return(log_prices: &[f64], t: usize) -> Option<f64> {
    if t == 0 {
        return None;
    }
    let r = log_prices[t] - log_prices[t - 1];
    r.is_finite().then_some(r)
}

fn check_column(column: &'static str, expected: usize, actual: usize) -> Result<(), PipelineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PipelineError::ColumnLength {
            column,
            expected,
            actual,
        })
    }
}

/// Bar-by-bar PnL with one bar of execution lag: the weights chosen at
/// `t - 1` earn the log returns realized at `t`. Turnover on the first bar
/// is measured against an empty book.
pub fn run_backtest(
    prices: &AlignedPrices,
    positions: &[SpreadPosition],
    beta: &[Option<f64>],
    vol_scale: &[f64],
    params: &BacktestParams,
) -> Result<BacktestRecord, PipelineError> {
    let n = prices.len();
    check_column("positions", n, positions.len())?;
    check_column("beta", n, beta.len())?;
    check_column("vol_scale", n, vol_scale.len())?;

    let ly = prices.log_y();
    let lx = prices.log_x();
    let cost_ratio = params.cost_ratio();

    let mut rows = Vec::with_capacity(n);
    let mut prev_weights = (0.0, 0.0);
    let mut equity = 1.0;
    for t in 0..n {
        let ret_y = log_return(&ly, t);
        let ret_x = log_return(&lx, t);
        let effective_gross = params.effective_gross(vol_scale[t]);
        let (w_y, w_x) = leg_weights(positions[t], beta[t], effective_gross);

        let ret_gross = match (ret_y, ret_x) {
            (Some(ry), Some(rx)) => {
                let r = prev_weights.0 * ry + prev_weights.1 * rx;
                if r.is_finite() {
                    r
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        let turnover = (w_y - prev_weights.0).abs() + (w_x - prev_weights.1).abs();
        let cost = cost_ratio * turnover;
        let ret_net = ret_gross - cost;
        equity *= 1.0 + ret_net;

        rows.push(BacktestRow {
            ts: prices.timestamps()[t],
            ret_y,
            ret_x,
            position: positions[t].signum(),
            beta: beta[t],
            vol_scale: vol_scale[t],
            effective_gross,
            w_y,
            w_x,
            turnover,
            ret_gross,
            cost,
            ret_net,
            equity,
        });
        prev_weights = (w_y, w_x);
    }

    let record = BacktestRecord { rows };
    log::info!(
        "[BACKTEST] bars={} final_equity={:.6} total_cost={:.6}",
        record.len(),
        record.final_equity(),
        record.total_cost()
    );
    Ok(record)
}
