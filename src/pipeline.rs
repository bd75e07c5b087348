use crate::backtest::{run_backtest, BacktestParams, BacktestRecord};
use crate::config::BacktestConfig;
use crate::metrics::{summarize, Summary};
use crate::positions::PositionSeries;
use crate::series::{AlignedPrices, PipelineError};
use crate::signals::FeatureFrame;

/// Everything one pass over a price pair produces.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub features: FeatureFrame,
    pub positions: PositionSeries,
    pub backtest: BacktestRecord,
}

impl PipelineOutput {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn summary(&self, timeframe: &str) -> Summary {
        summarize(
            &self.backtest,
            self.positions.final_positions(),
            &self.features.tradable,
            timeframe,
        )
    }
}

/// Features, positions and PnL for one aligned pair. Pure: no I/O and no
/// state carried between calls.
pub fn run_pipeline(
    prices: &AlignedPrices,
    cfg: &BacktestConfig,
) -> Result<PipelineOutput, PipelineError> {
    log::info!(
        "[PIPELINE] {} bars lookbacks beta={} z={} coint={} vol={}",
        prices.len(),
        cfg.lookback_beta,
        cfg.lookback_z,
        cfg.lookback_coint,
        cfg.lookback_spread_vol
    );
    let features = FeatureFrame::compute(prices, cfg);
    let positions = PositionSeries::generate(
        &features.z,
        &features.tradable,
        &cfg.thresholds(),
        cfg.max_holding_bars,
    );
    let backtest = run_backtest(
        prices,
        positions.final_positions(),
        &features.beta,
        &features.vol_scale,
        &BacktestParams::from(cfg),
    )?;
    Ok(PipelineOutput {
        features,
        positions,
        backtest,
    })
}
