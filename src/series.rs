use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

/// One close observation for a single symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub close: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Y,
    X,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Leg::Y => write!(f, "y"),
            Leg::X => write!(f, "x"),
        }
    }
}

/// Precondition violations on the input pair. Missing data inside the
/// pipeline is never reported through this type.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    LengthMismatch {
        timestamps: usize,
        y: usize,
        x: usize,
    },
    NonMonotonicTimestamps {
        index: usize,
    },
    NonPositivePrice {
        index: usize,
        leg: Leg,
    },
    InvalidClose {
        ts: DateTime<Utc>,
        leg: Leg,
    },
    ColumnLength {
        column: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PipelineError::LengthMismatch { timestamps, y, x } => write!(
                f,
                "series length mismatch: timestamps={} y={} x={}",
                timestamps, y, x
            ),
            PipelineError::NonMonotonicTimestamps { index } => write!(
                f,
                "timestamp at index {} is not strictly after its predecessor",
                index
            ),
            PipelineError::NonPositivePrice { index, leg } => write!(
                f,
                "{} price at index {} is not a finite positive number",
                leg, index
            ),
            PipelineError::InvalidClose { ts, leg } => {
                write!(f, "{} close at {} cannot be represented as f64", leg, ts)
            }
            PipelineError::ColumnLength {
                column,
                expected,
                actual,
            } => write!(
                f,
                "column {} has {} values, expected {}",
                column, actual, expected
            ),
        }
    }
}

impl Error for PipelineError {}

/// Two inner-joined price legs sharing one strictly increasing index.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPrices {
    timestamps: Vec<DateTime<Utc>>,
    y: Vec<f64>,
    x: Vec<f64>,
}

impl AlignedPrices {
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        y: Vec<f64>,
        x: Vec<f64>,
    ) -> Result<Self, PipelineError> {
        if timestamps.len() != y.len() || timestamps.len() != x.len() {
            return Err(PipelineError::LengthMismatch {
                timestamps: timestamps.len(),
                y: y.len(),
                x: x.len(),
            });
        }
        for (index, pair) in timestamps.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(PipelineError::NonMonotonicTimestamps { index: index + 1 });
            }
        }
        for (leg, values) in [(Leg::Y, &y), (Leg::X, &x)] {
            if let Some(index) = values.iter().position(|v| !(v.is_finite() && *v > 0.0)) {
                return Err(PipelineError::NonPositivePrice { index, leg });
            }
        }
        Ok(Self { timestamps, y, x })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn log_y(&self) -> Vec<f64> {
        self.y.iter().map(|p| p.ln()).collect()
    }

    pub fn log_x(&self) -> Vec<f64> {
        self.x.iter().map(|p| p.ln()).collect()
    }
}

fn index_closes(candles: &[Candle], leg: Leg) -> Result<BTreeMap<DateTime<Utc>, f64>, PipelineError> {
    let mut out = BTreeMap::new();
    for candle in candles {
        let close = candle
            .close
            .to_f64()
            .ok_or(PipelineError::InvalidClose { ts: candle.ts, leg })?;
        if out.insert(candle.ts, close).is_some() {
            log::warn!("[DATA] duplicate {} timestamp {}; keeping last close", leg, candle.ts);
        }
    }
    Ok(out)
}

/// Inner-joins two close series on timestamp.
pub fn align_closes(y: &[Candle], x: &[Candle]) -> Result<AlignedPrices, PipelineError> {
    let y_map = index_closes(y, Leg::Y)?;
    let x_map = index_closes(x, Leg::X)?;

    let mut timestamps = Vec::with_capacity(y_map.len().min(x_map.len()));
    let mut ys = Vec::with_capacity(timestamps.capacity());
    let mut xs = Vec::with_capacity(timestamps.capacity());
    for (ts, close_y) in &y_map {
        if let Some(close_x) = x_map.get(ts) {
            timestamps.push(*ts);
            ys.push(*close_y);
            xs.push(*close_x);
        }
    }
    log::info!(
        "[DATA] aligned {} bars (y={} x={})",
        timestamps.len(),
        y_map.len(),
        x_map.len()
    );
    AlignedPrices::new(timestamps, ys, xs)
}

#[cfg(test)]
pub(crate) fn hourly_index(len: usize) -> Vec<DateTime<Utc>> {
    let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    (0..len)
        .map(|i| start + chrono::Duration::hours(i as i64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(hour: i64, close: Decimal) -> Candle {
        Candle {
            ts: DateTime::<Utc>::from_timestamp(1_700_000_000 + hour * 3600, 0).unwrap(),
            close,
        }
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = AlignedPrices::new(hourly_index(3), vec![1.0, 2.0, 3.0], vec![1.0, 2.0]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::LengthMismatch {
                timestamps: 3,
                y: 3,
                x: 2
            }
        );
    }

    #[test]
    fn rejects_duplicate_and_backwards_timestamps() {
        let mut ts = hourly_index(3);
        ts[2] = ts[1];
        let err = AlignedPrices::new(ts, vec![1.0; 3], vec![1.0; 3]).unwrap_err();
        assert_eq!(err, PipelineError::NonMonotonicTimestamps { index: 2 });

        let mut ts = hourly_index(3);
        ts.swap(0, 1);
        let err = AlignedPrices::new(ts, vec![1.0; 3], vec![1.0; 3]).unwrap_err();
        assert_eq!(err, PipelineError::NonMonotonicTimestamps { index: 1 });
    }

    #[test]
    fn rejects_non_positive_prices() {
        let err = AlignedPrices::new(hourly_index(3), vec![1.0, 0.0, 1.0], vec![1.0; 3]).unwrap_err();
        assert_eq!(err, PipelineError::NonPositivePrice { index: 1, leg: Leg::Y });
        let err =
            AlignedPrices::new(hourly_index(2), vec![1.0; 2], vec![1.0, f64::NAN]).unwrap_err();
        assert_eq!(err, PipelineError::NonPositivePrice { index: 1, leg: Leg::X });
    }

    #[test]
    fn empty_series_is_valid() {
        let prices = AlignedPrices::new(Vec::new(), Vec::new(), Vec::new()).unwrap();
        assert!(prices.is_empty());
    }

    #[test]
    fn align_closes_inner_joins_and_sorts() {
        let y = vec![
            candle(2, dec!(12)),
            candle(0, dec!(10)),
            candle(1, dec!(11)),
            candle(3, dec!(13)),
        ];
        let x = vec![candle(1, dec!(21)), candle(3, dec!(23)), candle(4, dec!(24))];
        let aligned = align_closes(&y, &x).unwrap();
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned.y(), &[11.0, 13.0]);
        assert_eq!(aligned.x(), &[21.0, 23.0]);
        assert!(aligned.timestamps()[0] < aligned.timestamps()[1]);
    }

    #[test]
    fn align_closes_keeps_last_duplicate() {
        let y = vec![candle(0, dec!(10)), candle(0, dec!(15))];
        let x = vec![candle(0, dec!(20))];
        let aligned = align_closes(&y, &x).unwrap();
        assert_eq!(aligned.y(), &[15.0]);
    }

    #[test]
    fn align_closes_rejects_zero_close() {
        let y = vec![candle(0, dec!(0))];
        let x = vec![candle(0, dec!(20))];
        assert!(matches!(
            align_closes(&y, &x),
            Err(PipelineError::NonPositivePrice { leg: Leg::Y, .. })
        ));
    }
}
