//! Per-cell band arithmetic.

use crate::core::error::{ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::expression::{Expression, PixelEvaluator};
use crate::core::types::{is_nodata, Band, BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{Cube, CubeRef};
use crate::graph::serialization::CubeSpec;
use rayon::prelude::*;

/// Evaluates one expression per output band at every cell.
///
/// Nodata inputs enter expressions as `NaN`; non-finite results are written
/// as nodata. With `keep_bands`, the input bands come first in the output.
#[derive(Debug)]
pub struct ApplyPixelCube {
    id: CubeId,
    input: CubeRef,
    expressions: Vec<Expression>,
    keep_bands: bool,
    bands: BandCollection,
}

impl ApplyPixelCube {
    /// Create the cube. Empty `names` defaults to `band1..bandN`.
    pub fn new<S: AsRef<str>>(
        input: CubeRef,
        expressions: &[S],
        names: &[S],
        keep_bands: bool,
    ) -> ConstructionResult<Self> {
        if expressions.is_empty() {
            return Err(ConstructionError::NoBands);
        }
        let names: Vec<String> = if names.is_empty() {
            (1..=expressions.len()).map(|i| format!("band{}", i)).collect()
        } else {
            names.iter().map(|n| n.as_ref().to_string()).collect()
        };
        if names.len() != expressions.len() {
            return Err(ConstructionError::Other(format!(
                "{} expressions but {} band names",
                expressions.len(),
                names.len()
            )));
        }
        let compiled = expressions
            .iter()
            .map(|e| Expression::compile(e.as_ref(), input.bands()))
            .collect::<ConstructionResult<Vec<_>>>()?;

        let mut bands = if keep_bands {
            input.bands().clone()
        } else {
            BandCollection::new()
        };
        for name in names {
            bands.push(Band::new(name))?;
        }
        Ok(Self {
            id: CubeId::new(),
            input,
            expressions: compiled,
            keep_bands,
            bands,
        })
    }
}

impl Cube for ApplyPixelCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "apply_pixel"
    }

    fn view(&self) -> &CubeView {
        self.input.view()
    }

    fn bands(&self) -> &BandCollection {
        &self.bands
    }

    fn nodata(&self) -> f64 {
        self.input.nodata()
    }

    fn children(&self) -> Vec<CubeRef> {
        vec![self.input.clone()]
    }

    fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData> {
        let input = self.input.read_chunk(id)?;
        let [nb, t, y, x] = input.shape();
        let nodata = self.nodata();
        let cells = input.band_len();
        let kept = if self.keep_bands { nb } else { 0 };
        let mut out = ChunkData::nodata([kept + self.expressions.len(), t, y, x], nodata);

        let (head, tail) = out.as_mut_slice().split_at_mut(kept * cells);
        head.copy_from_slice(&input.as_slice()[..kept * cells]);
        tail.par_chunks_mut(cells)
            .zip(self.expressions.par_iter())
            .for_each(|(dst, expression)| {
                let mut values = vec![0.0; nb];
                for (cell, slot) in dst.iter_mut().enumerate() {
                    for (b, v) in values.iter_mut().enumerate() {
                        let raw = input.as_slice()[b * cells + cell];
                        *v = if is_nodata(raw, nodata) { f64::NAN } else { raw };
                    }
                    let result = expression.evaluate(&values);
                    *slot = if result.is_finite() { result } else { nodata };
                }
            });
        Ok(out)
    }

    fn to_spec(&self) -> CubeSpec {
        let kept = if self.keep_bands {
            self.input.bands().len()
        } else {
            0
        };
        CubeSpec::ApplyPixel {
            input: Box::new(self.input.to_spec()),
            expressions: self
                .expressions
                .iter()
                .map(|e| e.source().to_string())
                .collect(),
            names: self.bands.names()[kept..].to_vec(),
            keep_bands: self.keep_bands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubes::testing::{grid_cube, materialize, small_view};

    #[test]
    fn test_ndvi() {
        let input = grid_cube(&small_view(), &["red", "nir"], |b, _, _, _| if b == 0 { 1.0 } else { 3.0 });
        let cube = ApplyPixelCube::new(input, &["(nir - red) / (nir + red)"], &["ndvi"], false).unwrap();
        assert_eq!(cube.bands().names(), vec!["ndvi"]);
        let all = materialize(&cube);
        assert!(all.as_slice().iter().all(|&v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_keep_bands_first() {
        let input = grid_cube(&small_view(), &["B1"], |_, t, _, _| t as f64);
        let cube = ApplyPixelCube::new(input, &["B1 * 2", "B1 + 1"], &["double", "inc"], true).unwrap();
        assert_eq!(cube.bands().names(), vec!["B1", "double", "inc"]);
        let all = materialize(&cube);
        assert_eq!(all.get(0, 3, 1, 1), 3.0);
        assert_eq!(all.get(1, 3, 1, 1), 6.0);
        assert_eq!(all.get(2, 3, 1, 1), 4.0);
    }

    #[test]
    fn test_nodata_and_division_by_zero() {
        let input = grid_cube(&small_view(), &["B1"], |_, t, _, _| if t == 0 { f64::NAN } else { t as f64 - 1.0 });
        let cube = ApplyPixelCube::new(input, &["1 / B1"], &[], false).unwrap();
        assert_eq!(cube.bands().names(), vec!["band1"]);
        let all = materialize(&cube);
        assert!(all.get(0, 0, 0, 0).is_nan());
        assert!(all.get(0, 1, 0, 0).is_nan());
        assert_eq!(all.get(0, 3, 0, 0), 0.5);
    }

    #[test]
    fn test_construction_errors() {
        let input = grid_cube(&small_view(), &["B1"], |_, _, _, _| 0.0);
        assert!(matches!(
            ApplyPixelCube::new(input.clone(), &["B2 + 1"], &["x"], false),
            Err(ConstructionError::Expression { .. })
        ));
        assert!(matches!(
            ApplyPixelCube::new(input.clone(), &["B1"], &["B1"], true),
            Err(ConstructionError::DuplicateBand(_))
        ));
        assert!(ApplyPixelCube::new(input, &["B1", "B1"], &["a"], false).is_err());
    }
}
