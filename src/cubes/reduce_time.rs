//! Reduction over the time axis.

use crate::core::error::{ChunkError, ChunkResult, ConstructionResult, CubeId};
use crate::core::reducer::{Accumulator, Reducer};
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{resolve_reducers, Cube, CubeRef, ReducerBand};
use crate::graph::serialization::CubeSpec;
use log::debug;

/// Collapses the time axis to a single step, one output band per
/// `(reducer, band)` pair.
///
/// Output bands are named `{band}_{reducer}` unless built with
/// [`ReduceTimeCube::single`], which keeps the input names.
#[derive(Debug)]
pub struct ReduceTimeCube {
    id: CubeId,
    input: CubeRef,
    view: CubeView,
    pairs: Vec<(Reducer, usize)>,
    bands: BandCollection,
    keep_names: bool,
}

impl ReduceTimeCube {
    /// Reduce with explicit `(reducer, band)` pairs.
    pub fn new(input: CubeRef, pairs: &[ReducerBand]) -> ConstructionResult<Self> {
        Self::build(input, pairs, false)
    }

    /// Apply every reducer to every listed band (`|reducers| × |bands|` outputs).
    pub fn cross<S: AsRef<str>>(
        input: CubeRef,
        reducers: &[Reducer],
        bands: &[S],
    ) -> ConstructionResult<Self> {
        let pairs: Vec<ReducerBand> = reducers
            .iter()
            .flat_map(|r| bands.iter().map(move |b| ReducerBand::new(*r, b.as_ref())))
            .collect();
        Self::new(input, &pairs)
    }

    /// Apply one reducer to all bands, keeping band names.
    pub fn single(input: CubeRef, reducer: Reducer) -> ConstructionResult<Self> {
        let pairs: Vec<ReducerBand> = input
            .bands()
            .names()
            .into_iter()
            .map(|b| ReducerBand::new(reducer, b))
            .collect();
        Self::build(input, &pairs, true)
    }

    pub(crate) fn build(
        input: CubeRef,
        pairs: &[ReducerBand],
        keep_names: bool,
    ) -> ConstructionResult<Self> {
        let (pairs, bands) = resolve_reducers(input.bands(), pairs, keep_names)?;
        Ok(Self {
            id: CubeId::new(),
            view: input.view().with_reduced_time(),
            input,
            pairs,
            bands,
            keep_names,
        })
    }
}

impl Cube for ReduceTimeCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "reduce_time"
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
        let [_, cy, cx] = region.coords;
        let [_, sy, sx] = region.size;
        let nodata = self.nodata();
        let cells = sy * sx;

        let mut accumulators: Vec<Accumulator> = self
            .pairs
            .iter()
            .flat_map(|(r, _)| (0..cells).map(move |_| r.accumulator()))
            .collect();

        let input_view = self.input.view();
        let [nct, _, _] = input_view.chunk_count();
        for ct in 0..nct {
            let child_id = input_view.chunk_id([ct, cy, cx]);
            let child_region = input_view.chunk_region(child_id)?;
            let chunk = self.input.read_chunk(child_id)?;
            let t0 = child_region.offset[0];
            for (p, (_, band)) in self.pairs.iter().enumerate() {
                let values = chunk.band(*band);
                let accs = &mut accumulators[p * cells..(p + 1) * cells];
                for t in 0..child_region.size[0] {
                    let plane = &values[t * cells..(t + 1) * cells];
                    for (acc, &v) in accs.iter_mut().zip(plane) {
                        acc.push(v, t0 + t, nodata);
                    }
                }
            }
        }
        debug!("cube {} reduced chunk {} over {} input chunks", self.id, id, nct);

        let data = accumulators
            .into_iter()
            .map(|acc| acc.finish().unwrap_or(nodata))
            .collect();
        ChunkData::from_vec([self.pairs.len(), 1, sy, sx], data, nodata)
            .ok_or_else(|| ChunkError::Other("reduced chunk has unexpected size".to_string()))
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::ReduceTime {
            input: Box::new(self.input.to_spec()),
            reducers: self.pairs_spec(),
            keep_names: self.keep_names,
        }
    }
}

impl ReduceTimeCube {
    fn pairs_spec(&self) -> Vec<ReducerBand> {
        let names = self.input.bands().names();
        self.pairs
            .iter()
            .map(|(r, b)| ReducerBand::new(*r, names[*b].clone()))
            .collect()
    }
}
