//! Temporal gap filling.

use crate::core::error::{ChunkResult, ConstructionError, CubeId};
use crate::core::types::{is_nodata, BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{read_time_range, Cube, CubeRef};
use crate::graph::serialization::CubeSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a nodata run in a time series is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    /// Nearest valid sample in time, ties go to the earlier one. Also fills
    /// leading and trailing gaps.
    Near,
    /// Last observation carried forward; leading gaps stay nodata.
    Locf,
    /// Next observation carried backward; trailing gaps stay nodata.
    Nocb,
    /// Linear interpolation between the bracketing samples; leading and
    /// trailing gaps stay nodata.
    #[default]
    Linear,
}

impl FillMethod {
    /// Name used in descriptions.
    pub fn name(&self) -> &'static str {
        match self {
            FillMethod::Near => "near",
            FillMethod::Locf => "locf",
            FillMethod::Nocb => "nocb",
            FillMethod::Linear => "linear",
        }
    }

    /// Fill `series` in place.
    pub fn fill(&self, series: &mut [f64], nodata: f64) {
        let n = series.len();
        let mut previous: Vec<Option<usize>> = vec![None; n];
        let mut last = None;
        for i in 0..n {
            if !is_nodata(series[i], nodata) {
                last = Some(i);
            }
            previous[i] = last;
        }
        let mut next = None;
        let mut following: Vec<Option<usize>> = vec![None; n];
        for i in (0..n).rev() {
            if !is_nodata(series[i], nodata) {
                next = Some(i);
            }
            following[i] = next;
        }

        let source = series.to_vec();
        for i in 0..n {
            if !is_nodata(source[i], nodata) {
                continue;
            }
            let value = match (self, previous[i], following[i]) {
                (FillMethod::Locf, Some(p), _) => Some(source[p]),
                (FillMethod::Nocb, _, Some(q)) => Some(source[q]),
                (FillMethod::Linear, Some(p), Some(q)) => {
                    let step = (source[q] - source[p]) * (i - p) as f64 / (q - p) as f64;
                    Some(source[p] + step)
                }
                (FillMethod::Near, Some(p), Some(q)) => {
                    Some(if i - p <= q - i { source[p] } else { source[q] })
                }
                (FillMethod::Near, Some(p), None) => Some(source[p]),
                (FillMethod::Near, None, Some(q)) => Some(source[q]),
                _ => None,
            };
            if let Some(v) = value {
                series[i] = v;
            }
        }
    }
}

impl fmt::Display for FillMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FillMethod {
    type Err = ConstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "near" | "nearest" => Ok(FillMethod::Near),
            "locf" => Ok(FillMethod::Locf),
            "nocb" => Ok(FillMethod::Nocb),
            "linear" => Ok(FillMethod::Linear),
            other => Err(ConstructionError::Other(format!(
                "unknown fill method '{}'",
                other
            ))),
        }
    }
}

/// Fills nodata runs of every cell's time series.
#[derive(Debug)]
pub struct FillTimeCube {
    id: CubeId,
    input: CubeRef,
    method: FillMethod,
}

impl FillTimeCube {
    /// Create the cube.
    pub fn new(input: CubeRef, method: FillMethod) -> Self {
        Self {
            id: CubeId::new(),
            input,
            method,
        }
    }
}

impl Cube for FillTimeCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "fill_time"
    }

    fn view(&self) -> &CubeView {
        self.input.view()
    }

    fn bands(&self) -> &BandCollection {
        self.input.bands()
    }

    fn nodata(&self) -> f64 {
        self.input.nodata()
    }

    fn children(&self) -> Vec<CubeRef> {
        vec![self.input.clone()]
    }

    fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData> {
        let view = self.input.view();
        let region = view.chunk_region(id)?;
        let [_, cy, cx] = region.coords;
        let [st, sy, sx] = region.size;
        let nt = view.nt();
        let nodata = self.nodata();
        let full = read_time_range(self.input.as_ref(), cy, cx, 0, nt)?;
        let cells = sy * sx;
        let nb = self.bands().len();

        let mut out = ChunkData::nodata([nb, st, sy, sx], nodata);
        let mut series = vec![0.0; nt];
        for b in 0..nb {
            let src = full.band(b);
            let dst = out.band_mut(b);
            for cell in 0..cells {
                for (t, v) in series.iter_mut().enumerate() {
                    *v = src[t * cells + cell];
                }
                self.method.fill(&mut series, nodata);
                for t in 0..st {
                    dst[t * cells + cell] = series[region.offset[0] + t];
                }
            }
        }
        Ok(out)
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::FillTime {
            input: Box::new(self.input.to_spec()),
            method: self.method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubes::testing::{assert_same, grid_cube, materialize, small_view};
    use proptest::prelude::*;

    const ND: f64 = f64::NAN;

    fn filled(method: FillMethod, series: &[f64]) -> Vec<f64> {
        let mut s = series.to_vec();
        method.fill(&mut s, ND);
        s
    }

    #[test]
    fn test_linear_interior_gap() {
        let s = filled(FillMethod::Linear, &[ND, 1.0, ND, ND, 7.0, ND]);
        assert!(s[0].is_nan());
        assert_eq!(&s[1..5], &[1.0, 3.0, 5.0, 7.0]);
        assert!(s[5].is_nan());
    }

    #[test]
    fn test_locf_nocb_near() {
        let series = [ND, 1.0, ND, ND, 7.0, ND];
        let locf = filled(FillMethod::Locf, &series);
        assert!(locf[0].is_nan());
        assert_eq!(&locf[1..], &[1.0, 1.0, 1.0, 7.0, 7.0]);

        let nocb = filled(FillMethod::Nocb, &series);
        assert_eq!(&nocb[..5], &[1.0, 1.0, 7.0, 7.0, 7.0]);
        assert!(nocb[5].is_nan());

        let near = filled(FillMethod::Near, &series);
        assert_eq!(near, vec![1.0, 1.0, 1.0, 7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_numeric_nodata() {
        let s = filled_with(-1.0);
        assert_eq!(s, vec![2.0, 3.0, 4.0]);
    }

    fn filled_with(nodata: f64) -> Vec<f64> {
        let mut s = vec![2.0, nodata, 4.0];
        FillMethod::Linear.fill(&mut s, nodata);
        s
    }

    #[test]
    fn test_fill_cube_across_chunks() {
        // Gap at t = 3..5 spans the chunk boundary at t = 4.
        let input = grid_cube(&small_view(), &["B1"], |_, t, _, _| {
            if (3..5).contains(&t) {
                f64::NAN
            } else {
                t as f64 * 2.0
            }
        });
        let cube = FillTimeCube::new(input, FillMethod::Linear);
        let all = materialize(&cube);
        assert_eq!(all.get(0, 3, 1, 2), 6.0);
        assert_eq!(all.get(0, 4, 1, 2), 8.0);
    }

    #[test]
    fn test_parse_method() {
        assert_eq!("LOCF".parse::<FillMethod>().unwrap(), FillMethod::Locf);
        assert!("cubic".parse::<FillMethod>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_no_gaps_is_identity(series in proptest::collection::vec(-1e6f64..1e6, 1..20)) {
            for method in [FillMethod::Near, FillMethod::Locf, FillMethod::Nocb, FillMethod::Linear] {
                prop_assert_eq!(filled(method, &series), series.clone());
            }
        }
    }

    #[test]
    fn test_gapless_cube_unchanged() {
        let input = grid_cube(&small_view(), &["B1", "B2"], |b, t, y, x| (b + t * y + x) as f64);
        let cube = FillTimeCube::new(input.clone(), FillMethod::Near);
        assert_same(materialize(&cube).as_slice(), materialize(input.as_ref()).as_slice());
    }
}
