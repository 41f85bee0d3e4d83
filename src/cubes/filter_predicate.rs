//! Cell filter driven by a boolean expression.

use crate::core::error::{ChunkResult, ConstructionResult, CubeId};
use crate::core::expression::{passes, Expression, PixelEvaluator};
use crate::core::types::{is_nodata, BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{Cube, CubeRef};
use crate::graph::serialization::CubeSpec;

/// Sets every band of a cell to nodata where the predicate does not hold.
///
/// A predicate that evaluates to `NaN` (e.g. over a nodata input) fails.
#[derive(Debug)]
pub struct FilterPredicateCube {
    id: CubeId,
    input: CubeRef,
    predicate: Expression,
}

impl FilterPredicateCube {
    /// Create the filter; `predicate` may only reference input bands.
    pub fn new(input: CubeRef, predicate: &str) -> ConstructionResult<Self> {
        let predicate = Expression::compile(predicate, input.bands())?;
        Ok(Self {
            id: CubeId::new(),
            input,
            predicate,
        })
    }
}

impl Cube for FilterPredicateCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "filter_predicate"
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
        let mut chunk = self.input.read_chunk(id)?;
        let nb = chunk.bands();
        let cells = chunk.band_len();
        let nodata = self.nodata();
        let mut values = vec![0.0; nb];
        let data = chunk.as_mut_slice();
        for cell in 0..cells {
            for (b, v) in values.iter_mut().enumerate() {
                let raw = data[b * cells + cell];
                *v = if is_nodata(raw, nodata) { f64::NAN } else { raw };
            }
            if !passes(self.predicate.evaluate(&values)) {
                for b in 0..nb {
                    data[b * cells + cell] = nodata;
                }
            }
        }
        Ok(chunk)
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::FilterPredicate {
            input: Box::new(self.input.to_spec()),
            predicate: self.predicate.source().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ConstructionError;
    use crate::cubes::testing::{grid_cube, materialize, small_view};

    #[test]
    fn test_predicate_removes_everything() {
        let input = grid_cube(&small_view(), &["B1", "B2"], |b, _, _, _| if b == 0 { 5.0 } else { 99.0 });
        let cube = FilterPredicateCube::new(input, "B1 > 10").unwrap();
        for id in cube.view().chunks() {
            assert!(cube.read_chunk(id).unwrap().is_all_nodata());
        }
    }

    #[test]
    fn test_predicate_keeps_passing_cells() {
        let input = grid_cube(&small_view(), &["B1", "B2"], |b, t, _, x| (b * 100 + t + x) as f64);
        let cube = FilterPredicateCube::new(input, "B1 >= 3 && B2 < 106").unwrap();
        assert_eq!(cube.bands().names(), vec!["B1", "B2"]);
        let all = materialize(&cube);
        assert_eq!(all.get(0, 2, 0, 1), 3.0);
        assert_eq!(all.get(1, 2, 0, 1), 103.0);
        assert!(all.get(0, 1, 0, 1).is_nan());
        assert!(all.get(1, 1, 0, 1).is_nan());
        assert!(all.get(0, 5, 0, 3).is_nan());
    }

    #[test]
    fn test_missing_cells_never_pass() {
        let input = grid_cube(&small_view(), &["B1", "B2"], |b, t, _, _| match (b, t) {
            (0, 0) => f64::NAN,
            (0, _) => 7.0,
            _ => 1.0,
        });
        let cube = FilterPredicateCube::new(input, "B1 != 5").unwrap();
        let all = materialize(&cube);
        assert!(all.get(0, 0, 1, 1).is_nan());
        assert!(all.get(1, 0, 1, 1).is_nan());
        assert_eq!(all.get(0, 1, 1, 1), 7.0);
        assert_eq!(all.get(1, 1, 1, 1), 1.0);
    }

    #[test]
    fn test_unparsable_predicate() {
        let input = grid_cube(&small_view(), &["B1"], |_, _, _, _| 0.0);
        assert!(matches!(
            FilterPredicateCube::new(input, "B1 >"),
            Err(ConstructionError::Expression { .. })
        ));
    }
}
