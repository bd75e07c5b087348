/// Discrete spread exposure. Long spread is long y / short beta·x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpreadPosition {
    ShortSpread,
    #[default]
    Flat,
    LongSpread,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub entry_z: f64,
    pub exit_z: f64,
}

impl SpreadPosition {
    pub fn signum(self) -> i8 {
        match self {
            SpreadPosition::ShortSpread => -1,
            SpreadPosition::Flat => 0,
            SpreadPosition::LongSpread => 1,
        }
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.signum())
    }

    pub fn is_flat(self) -> bool {
        self == SpreadPosition::Flat
    }

    /// One step of the entry/exit machine. An open position only ever
    /// returns to flat; it never flips side on the same bar.
    pub fn next(self, z: Option<f64>, thresholds: &Thresholds) -> SpreadPosition {
        let Some(z) = z else {
            return SpreadPosition::Flat;
        };
        match self {
            SpreadPosition::Flat => {
                if z >= thresholds.entry_z {
                    SpreadPosition::ShortSpread
                } else if z <= -thresholds.entry_z {
                    SpreadPosition::LongSpread
                } else {
                    SpreadPosition::Flat
                }
            }
            SpreadPosition::LongSpread | SpreadPosition::ShortSpread => {
                if z.abs() <= thresholds.exit_z {
                    SpreadPosition::Flat
                } else {
                    self
                }
            }
        }
    }
}

/// State machine output driven by the z-score alone.
pub fn raw_positions(z: &[Option<f64>], thresholds: &Thresholds) -> Vec<SpreadPosition> {
    z.iter()
        .scan(SpreadPosition::Flat, |state, z| {
            *state = state.next(*z, thresholds);
            Some(*state)
        })
        .collect()
}

/// Forces flat wherever the pair is not tradable. This is an overlay on the
/// emitted series only; it does not feed back into the state machine.
pub fn apply_regime_filter(raw: &[SpreadPosition], tradable: &[bool]) -> Vec<SpreadPosition> {
    raw.iter()
        .enumerate()
        .map(|(t, pos)| {
            if tradable.get(t).copied().unwrap_or(false) {
                *pos
            } else {
                SpreadPosition::Flat
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct HoldingCounter {
    prev: SpreadPosition,
    held: usize,
}

impl HoldingCounter {
    fn step(&mut self, desired: SpreadPosition, max_holding_bars: usize) -> SpreadPosition {
        let emitted = if desired.is_flat() {
            self.held = 0;
            SpreadPosition::Flat
        } else {
            self.held = if desired == self.prev { self.held + 1 } else { 1 };
            if self.held > max_holding_bars {
                self.held = 0;
                SpreadPosition::Flat
            } else {
                desired
            }
        };
        self.prev = emitted;
        emitted
    }
}

/// Forces an exit once the same nonzero position has been emitted for more
/// than `max_holding_bars` consecutive bars.
pub fn apply_holding_cap(filtered: &[SpreadPosition], max_holding_bars: usize) -> Vec<SpreadPosition> {
    let mut counter = HoldingCounter::default();
    let mut forced = 0usize;
    let capped = filtered
        .iter()
        .map(|pos| {
            let emitted = counter.step(*pos, max_holding_bars);
            if emitted != *pos {
                forced += 1;
            }
            emitted
        })
        .collect();
    if forced > 0 {
        log::debug!("[PIPELINE] holding cap forced {} exits", forced);
    }
    capped
}

/// The three position stages, each kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSeries {
    pub raw: Vec<SpreadPosition>,
    pub filtered: Vec<SpreadPosition>,
    pub capped: Vec<SpreadPosition>,
}

impl PositionSeries {
    pub fn generate(
        z: &[Option<f64>],
        tradable: &[bool],
        thresholds: &Thresholds,
        max_holding_bars: usize,
    ) -> Self {
        let raw = raw_positions(z, thresholds);
        let filtered = apply_regime_filter(&raw, tradable);
        let capped = apply_holding_cap(&filtered, max_holding_bars);
        Self {
            raw,
            filtered,
            capped,
        }
    }

    pub fn final_positions(&self) -> &[SpreadPosition] {
        &self.capped
    }
}
