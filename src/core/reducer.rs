//! Reducers and their incremental accumulators.
//!
//! Every reducer skips nodata values. A reducer that saw no valid value
//! finishes with `None`, which callers write out as nodata.

use crate::core::error::ConstructionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Sum,
    Prod,
    Mean,
    Median,
    Min,
    Max,
    Count,
    /// Sample standard deviation.
    Sd,
    /// Sample variance.
    Var,
    First,
    Last,
    /// Position of the minimum along the reduced axis.
    WhichMin,
    /// Position of the maximum along the reduced axis.
    WhichMax,
}

impl Reducer {
    /// All reducers.
    pub fn all() -> &'static [Reducer] {
        &[
            Reducer::Sum,
            Reducer::Prod,
            Reducer::Mean,
            Reducer::Median,
            Reducer::Min,
            Reducer::Max,
            Reducer::Count,
            Reducer::Sd,
            Reducer::Var,
            Reducer::First,
            Reducer::Last,
            Reducer::WhichMin,
            Reducer::WhichMax,
        ]
    }

    /// Name used in band names and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Reducer::Sum => "sum",
            Reducer::Prod => "prod",
            Reducer::Mean => "mean",
            Reducer::Median => "median",
            Reducer::Min => "min",
            Reducer::Max => "max",
            Reducer::Count => "count",
            Reducer::Sd => "sd",
            Reducer::Var => "var",
            Reducer::First => "first",
            Reducer::Last => "last",
            Reducer::WhichMin => "which_min",
            Reducer::WhichMax => "which_max",
        }
    }

    /// Start an empty accumulator.
    pub fn accumulator(&self) -> Accumulator {
        let state = match self {
            Reducer::Sum | Reducer::Mean => State::Sum { sum: 0.0, n: 0 },
            Reducer::Prod => State::Prod { prod: 1.0, n: 0 },
            Reducer::Median => State::Values(Vec::new()),
            Reducer::Min | Reducer::Max => State::Extreme { value: None },
            Reducer::WhichMin | Reducer::WhichMax => State::Which { best: None },
            Reducer::Count => State::Count(0),
            Reducer::Sd | Reducer::Var => State::Welford {
                n: 0,
                mean: 0.0,
                m2: 0.0,
            },
            Reducer::First | Reducer::Last => State::Pick { best: None },
        };
        Accumulator {
            reducer: *self,
            state,
        }
    }

    /// Reduce a series, skipping nodata values.
    pub fn reduce(&self, values: impl IntoIterator<Item = f64>, nodata: f64) -> Option<f64> {
        let mut acc = self.accumulator();
        for (i, v) in values.into_iter().enumerate() {
            acc.push(v, i, nodata);
        }
        acc.finish()
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Reducer {
    type Err = ConstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Reducer::all()
            .iter()
            .copied()
            .find(|r| r.name() == lower)
            .ok_or_else(|| ConstructionError::UnknownReducer(s.to_string()))
    }
}

#[derive(Debug, Clone)]
enum State {
    Sum { sum: f64, n: usize },
    Prod { prod: f64, n: usize },
    Values(Vec<f64>),
    Extreme { value: Option<f64> },
    Which { best: Option<(f64, usize)> },
    Count(usize),
    Welford { n: usize, mean: f64, m2: f64 },
    Pick { best: Option<(f64, usize)> },
}

/// Running state of one reducer over one series.
#[derive(Debug, Clone)]
pub struct Accumulator {
    reducer: Reducer,
    state: State,
}

impl Accumulator {
    /// Add a value found at `position` along the reduced axis.
    ///
    /// Values may arrive in any order: `first` / `last` keep the lowest and
    /// highest position, and `which_min` / `which_max` ties go to the lowest.
    #[inline]
    pub fn push(&mut self, value: f64, position: usize, nodata: f64) {
        if crate::core::types::is_nodata(value, nodata) {
            return;
        }
        let reducer = self.reducer;
        match &mut self.state {
            State::Sum { sum, n } => {
                *sum += value;
                *n += 1;
            }
            State::Prod { prod, n } => {
                *prod *= value;
                *n += 1;
            }
            State::Values(values) => values.push(value),
            State::Extreme { value: current } => offer_extreme(reducer, current, value),
            State::Which { best } => offer_position(reducer, best, (value, position)),
            State::Count(n) => *n += 1,
            State::Welford { n, mean, m2 } => {
                *n += 1;
                let delta = value - *mean;
                *mean += delta / *n as f64;
                *m2 += delta * (value - *mean);
            }
            State::Pick { best } => offer_position(reducer, best, (value, position)),
        }
    }

    /// Fold in an accumulator of the same reducer over another part of the series.
    pub fn merge(&mut self, other: Accumulator) {
        let reducer = self.reducer;
        match (&mut self.state, other.state) {
            (State::Sum { sum, n }, State::Sum { sum: s, n: k }) => {
                *sum += s;
                *n += k;
            }
            (State::Prod { prod, n }, State::Prod { prod: p, n: k }) => {
                *prod *= p;
                *n += k;
            }
            (State::Values(values), State::Values(more)) => values.extend(more),
            (State::Extreme { value }, State::Extreme { value: Some(v) }) => {
                offer_extreme(reducer, value, v)
            }
            (State::Which { best }, State::Which { best: Some(b) })
            | (State::Pick { best }, State::Pick { best: Some(b) }) => {
                offer_position(reducer, best, b)
            }
            (State::Count(n), State::Count(k)) => *n += k,
            (
                State::Welford { n, mean, m2 },
                State::Welford {
                    n: k,
                    mean: mean_k,
                    m2: m2_k,
                },
            ) if k > 0 => {
                let total = *n + k;
                let delta = mean_k - *mean;
                *m2 += m2_k + delta * delta * (*n as f64) * (k as f64) / total as f64;
                *mean += delta * k as f64 / total as f64;
                *n = total;
            }
            _ => {}
        }
    }

    /// Final statistic, or `None` if no valid value was pushed.
    pub fn finish(self) -> Option<f64> {
        match self.state {
            State::Sum { n: 0, .. } | State::Prod { n: 0, .. } | State::Count(0) => None,
            State::Sum { sum, n } => match self.reducer {
                Reducer::Mean => Some(sum / n as f64),
                _ => Some(sum),
            },
            State::Prod { prod, .. } => Some(prod),
            State::Values(mut values) => {
                if values.is_empty() {
                    return None;
                }
                values.sort_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    Some((values[mid - 1] + values[mid]) / 2.0)
                } else {
                    Some(values[mid])
                }
            }
            State::Extreme { value } => value,
            State::Which { best } => best.map(|(_, position)| position as f64),
            State::Count(n) => Some(n as f64),
            State::Welford { n, m2, .. } => {
                if n < 2 {
                    return None;
                }
                let var = m2 / (n - 1) as f64;
                match self.reducer {
                    Reducer::Sd => Some(var.sqrt()),
                    _ => Some(var),
                }
            }
            State::Pick { best } => best.map(|(value, _)| value),
        }
    }
}

fn offer_extreme(reducer: Reducer, current: &mut Option<f64>, value: f64) {
    let keep = match *current {
        None => true,
        Some(c) if reducer == Reducer::Min => value < c,
        Some(c) => value > c,
    };
    if keep {
        *current = Some(value);
    }
}

/// Keep `(value, position)` for the positional reducers.
fn offer_position(reducer: Reducer, best: &mut Option<(f64, usize)>, candidate: (f64, usize)) {
    let (value, position) = candidate;
    let keep = match (*best, reducer) {
        (None, _) => true,
        (Some((_, p)), Reducer::First) => position < p,
        (Some((_, p)), Reducer::Last) => position > p,
        (Some((c, p)), Reducer::WhichMin) => value < c || (value == c && position < p),
        (Some((c, p)), _) => value > c || (value == c && position < p),
    };
    if keep {
        *best = Some(candidate);
    }
}
