//! Rolling Engle-Granger cointegration filter.
//!
//! Each window regresses `log y` on `[1, log x]`, runs an augmented
//! Dickey-Fuller test without deterministic terms on the residuals (lag
//! count chosen by AIC) and maps the statistic to MacKinnon's approximate
//! asymptotic p-value for two series with a constant term.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};

// MacKinnon (1994) response-surface coefficients, constant term, N = 2.
const TAU_MAX: f64 = 0.92;
const TAU_MIN: f64 = -18.86;
const TAU_STAR: f64 = -2.62;
const TAU_SMALL_P: [f64; 3] = [2.92, 1.5012, 0.039796];
const TAU_LARGE_P: [f64; 4] = [2.1945, 0.64695, -0.29198, -0.042377];

/// Shortest window the residual unit-root regression is attempted on.
pub const MIN_COINT_OBS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdfResult {
    pub statistic: f64,
    pub used_lag: usize,
    pub nobs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngleGranger {
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub statistic: f64,
    pub p_value: f64,
}

/// Approximate p-value of a cointegration t-statistic.
pub fn mackinnon_p_value(statistic: f64) -> Option<f64> {
    if statistic.is_nan() {
        return None;
    }
    if statistic > TAU_MAX {
        return Some(1.0);
    }
    if statistic < TAU_MIN {
        return Some(0.0);
    }
    let coefs: &[f64] = if statistic <= TAU_STAR {
        &TAU_SMALL_P
    } else {
        &TAU_LARGE_P
    };
    let poly = coefs
        .iter()
        .rev()
        .fold(0.0, |acc, c| acc * statistic + c);
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some(normal.cdf(poly))
}

fn default_maxlag(nobs: usize) -> usize {
    let by_rule = (12.0 * (nobs as f64 / 100.0).powf(0.25)).ceil() as usize;
    by_rule.min((nobs / 2).saturating_sub(1))
}

/// Rows of the ADF regression with `lags` lagged differences: the target is
/// `diff[t]`, regressors are `level[t]` then `diff[t-1] .. diff[t-lags]`,
/// for `t` in `first..diff.len()`.
fn adf_design(level: &[f64], diff: &[f64], lags: usize, first: usize) -> (DMatrix<f64>, DVector<f64>) {
    let rows = diff.len() - first;
    let x = DMatrix::from_fn(rows, lags + 1, |r, c| {
        let t = first + r;
        if c == 0 {
            level[t]
        } else {
            diff[t - c]
        }
    });
    let y = DVector::from_fn(rows, |r, _| diff[first + r]);
    (x, y)
}

fn aic(ssr: f64, nobs: usize, k: usize) -> f64 {
    let n = nobs as f64;
    let llf = -n / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (ssr / n).ln() + 1.0);
    -2.0 * llf + 2.0 * k as f64
}

/// Chooses the number of lagged differences by minimum AIC over a common
/// sample. Every candidate model is a leading block of the full design, so
/// one Gram matrix serves all of them.
fn select_lag_by_aic(level: &[f64], diff: &[f64], maxlag: usize) -> Option<usize> {
    let (x, y) = adf_design(level, diff, maxlag, maxlag);
    let nobs = y.len();
    let gram = x.tr_mul(&x);
    let xty = x.tr_mul(&y);
    let yty = y.dot(&y);

    let mut best: Option<(f64, usize)> = None;
    for k in 1..=maxlag + 1 {
        if k >= nobs {
            break;
        }
        let gram_k = gram.view((0, 0), (k, k)).into_owned();
        let xty_k = xty.rows(0, k).into_owned();
        let Some(chol) = gram_k.cholesky() else {
            continue;
        };
        let beta = chol.solve(&xty_k);
        let ssr = (yty - beta.dot(&xty_k)).max(f64::MIN_POSITIVE);
        let score = aic(ssr, nobs, k);
        if !score.is_finite() {
            continue;
        }
        if best.map(|(b, _)| score < b).unwrap_or(true) {
            best = Some((score, k));
        }
    }
    best.map(|(_, k)| k - 1)
}

/// Augmented Dickey-Fuller test with no constant or trend.
pub fn adf_no_trend(series: &[f64], maxlag: Option<usize>) -> Option<AdfResult> {
    if series.len() < 4 {
        return None;
    }
    let maxlag = maxlag
        .unwrap_or_else(|| default_maxlag(series.len()))
        .min((series.len() / 2).saturating_sub(1));
    let diff: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let lags = select_lag_by_aic(series, &diff, maxlag)?;
    let (x, y) = adf_design(series, &diff, lags, lags);
    let nobs = y.len();
    let k = lags + 1;
    if nobs <= k {
        return None;
    }
    let chol = x.tr_mul(&x).cholesky()?;
    let beta = chol.solve(&x.tr_mul(&y));
    let resid = &y - &x * &beta;
    let sigma2 = resid.dot(&resid) / (nobs - k) as f64;
    let se = (sigma2 * chol.inverse()[(0, 0)]).sqrt();
    let statistic = beta[0] / se;
    if !statistic.is_finite() {
        return None;
    }
    Some(AdfResult {
        statistic,
        used_lag: lags,
        nobs,
    })
}

/// Two-step Engle-Granger test of `y` on `x`. Degenerate inputs return
/// `None`; a near-perfect linear fit is reported as an infinitely negative
/// statistic with a p-value of zero.
pub fn engle_granger(y: &[f64], x: &[f64]) -> Option<EngleGranger> {
    let n = y.len().min(x.len());
    if n < MIN_COINT_OBS {
        return None;
    }
    let (y, x) = (&y[..n], &x[..n]);
    let (shift_y, shift_x) = (y[0], x[0]);
    let mean_y = y.iter().map(|v| v - shift_y).sum::<f64>() / n as f64;
    let mean_x = x.iter().map(|v| v - shift_x).sum::<f64>() / n as f64;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (yi, xi) in y.iter().zip(x) {
        let dx = xi - shift_x - mean_x;
        let dy = yi - shift_y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    let hedge_ratio = sxy / sxx;
    let intercept = (shift_y + mean_y) - hedge_ratio * (shift_x + mean_x);
    let resid: Vec<f64> = y
        .iter()
        .zip(x)
        .map(|(yi, xi)| (yi - shift_y - mean_y) - hedge_ratio * (xi - shift_x - mean_x))
        .collect();
    let ssr: f64 = resid.iter().map(|e| e * e).sum();
    let r_squared = 1.0 - ssr / syy;

    let statistic = if r_squared >= 1.0 - 100.0 * f64::EPSILON.sqrt() {
        f64::NEG_INFINITY
    } else {
        adf_no_trend(&resid, None)?.statistic
    };
    let p_value = mackinnon_p_value(statistic)?;
    Some(EngleGranger {
        hedge_ratio,
        intercept,
        statistic,
        p_value,
    })
}

/// p-value of the Engle-Granger test over each trailing `window`, `None`
/// before the window fills or where the test is degenerate. Windows are
/// independent and evaluated in parallel; output order matches the input.
pub fn rolling_coint_pvalues(ly: &[f64], lx: &[f64], window: usize) -> Vec<Option<f64>> {
    let len = ly.len().min(lx.len());
    if window == 0 || len < window {
        return vec![None; len];
    }
    let evaluated: Vec<Option<f64>> = (window - 1..len)
        .into_par_iter()
        .map(|end| {
            let start = end + 1 - window;
            engle_granger(&ly[start..=end], &lx[start..=end]).map(|eg| eg.p_value)
        })
        .collect();

    let failed = evaluated.iter().filter(|p| p.is_none()).count();
    if failed > 0 {
        log::debug!(
            "[COINT] {} of {} windows produced no p-value",
            failed,
            evaluated.len()
        );
    }

    let mut out = vec![None; window - 1];
    out.extend(evaluated);
    out
}
