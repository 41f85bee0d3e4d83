//! Reduction over the spatial axes.

use crate::core::error::{ChunkError, ChunkResult, ConstructionResult, CubeId};
use crate::core::reducer::{Accumulator, Reducer};
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{resolve_reducers, Cube, CubeRef, ReducerBand};
use crate::graph::serialization::CubeSpec;

/// Collapses x and y to a single cell per time step.
///
/// `which_min` / `which_max` report the row-major cell index `y * nx + x`.
#[derive(Debug)]
pub struct ReduceSpaceCube {
    id: CubeId,
    input: CubeRef,
    view: CubeView,
    pairs: Vec<(Reducer, usize)>,
    bands: BandCollection,
}

impl ReduceSpaceCube {
    /// Reduce with explicit `(reducer, band)` pairs; outputs are `{band}_{reducer}`.
    pub fn new(input: CubeRef, pairs: &[ReducerBand]) -> ConstructionResult<Self> {
        let (pairs, bands) = resolve_reducers(input.bands(), pairs, false)?;
        Ok(Self {
            id: CubeId::new(),
            view: input.view().with_reduced_space(),
            input,
            pairs,
            bands,
        })
    }
}

impl Cube for ReduceSpaceCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "reduce_space"
    }

    fn view(&self) -> &CubeView {
        &self.view
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
        let region = self.view.chunk_region(id)?;
        let ct = region.coords[0];
        let st = region.size[0];
        let nodata = self.nodata();

        let mut accumulators: Vec<Accumulator> = self
            .pairs
            .iter()
            .flat_map(|(r, _)| (0..st).map(move |_| r.accumulator()))
            .collect();

        let input_view = self.input.view();
        let nx = input_view.nx();
        let [_, ncy, ncx] = input_view.chunk_count();
        for cy in 0..ncy {
            for cx in 0..ncx {
                let child_id = input_view.chunk_id([ct, cy, cx]);
                let child = input_view.chunk_region(child_id)?;
                let chunk = self.input.read_chunk(child_id)?;
                let [_, sy, sx] = child.size;
                for (p, (_, band)) in self.pairs.iter().enumerate() {
                    let values = chunk.band(*band);
                    for t in 0..st {
                        let acc = &mut accumulators[p * st + t];
                        for y in 0..sy {
                            let row = &values[(t * sy + y) * sx..(t * sy + y + 1) * sx];
                            let base = (child.offset[1] + y) * nx + child.offset[2];
                            for (x, &v) in row.iter().enumerate() {
                                acc.push(v, base + x, nodata);
                            }
                        }
                    }
                }
            }
        }

        let data = accumulators
            .into_iter()
            .map(|acc| acc.finish().unwrap_or(nodata))
            .collect();
        ChunkData::from_vec([self.pairs.len(), st, 1, 1], data, nodata)
            .ok_or_else(|| ChunkError::Other("reduced chunk has unexpected size".to_string()))
    }

    fn to_spec(&self) -> CubeSpec {
        let names = self.input.bands().names();
        CubeSpec::ReduceSpace {
            input: Box::new(self.input.to_spec()),
            reducers: self
                .pairs
                .iter()
                .map(|(r, b)| ReducerBand::new(*r, names[*b].clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::view::tests::test_view;
    use crate::core::view::ChunkShape;
    use crate::cubes::testing::{grid_cube, materialize, small_view};

    #[test]
    fn test_reduce_space_per_time_step() {
        let view = small_view();
        let input = grid_cube(&view, &["B1"], |_, t, y, x| (t * 100 + y * 4 + x) as f64);
        let cube = ReduceSpaceCube::new(
            input,
            &[
                ReducerBand::new(Reducer::Max, "B1"),
                ReducerBand::new(Reducer::Count, "B1"),
                ReducerBand::new(Reducer::WhichMin, "B1"),
            ],
        )
        .unwrap();
        assert_eq!(cube.bands().names(), vec!["B1_max", "B1_count", "B1_which_min"]);
        assert_eq!(cube.view().shape(), [6, 1, 1]);

        let all = materialize(&cube);
        for t in 0..6 {
            assert_eq!(all.get(0, t, 0, 0), (t * 100 + 11) as f64);
            assert_eq!(all.get(1, t, 0, 0), 12.0);
            assert_eq!(all.get(2, t, 0, 0), 0.0);
        }
    }

    #[test]
    fn test_reduce_space_all_nodata_step() {
        let view = small_view();
        let input = grid_cube(&view, &["B1"], |_, t, _, _| if t == 3 { f64::NAN } else { 1.0 });
        let cube = ReduceSpaceCube::new(input, &[ReducerBand::new(Reducer::Mean, "B1")]).unwrap();
        let all = materialize(&cube);
        assert!(all.get(0, 3, 0, 0).is_nan());
        assert_eq!(all.get(0, 2, 0, 0), 1.0);
    }

    #[test]
    fn test_positions_follow_row_major_order_across_chunks() {
        // Two x-chunks: the cell at (1, 1) is read before the one at (0, 3).
        let view = test_view(1, 2, 4, ChunkShape::new(1, 2, 3));
        let input = grid_cube(&view, &["B1"], |_, _, y, x| match (y, x) {
            (0, 3) => 7.0,
            (1, 1) => 9.0,
            (1, 3) => 9.0,
            _ => f64::NAN,
        });
        let cube = ReduceSpaceCube::new(
            input,
            &[
                ReducerBand::new(Reducer::First, "B1"),
                ReducerBand::new(Reducer::Last, "B1"),
                ReducerBand::new(Reducer::WhichMax, "B1"),
                ReducerBand::new(Reducer::WhichMin, "B1"),
            ],
        )
        .unwrap();
        let all = materialize(&cube);
        assert_eq!(all.get(0, 0, 0, 0), 7.0);
        assert_eq!(all.get(1, 0, 0, 0), 9.0);
        assert_eq!(all.get(2, 0, 0, 0), 5.0);
        assert_eq!(all.get(3, 0, 0, 0), 3.0);
    }
}
