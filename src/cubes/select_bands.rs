//! Band projection.

use crate::core::error::{ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{Cube, CubeRef};
use crate::graph::serialization::CubeSpec;

/// Keeps a subset of the input bands, in the requested order.
#[derive(Debug)]
pub struct SelectBandsCube {
    id: CubeId,
    input: CubeRef,
    indices: Vec<usize>,
    bands: BandCollection,
}

impl SelectBandsCube {
    /// Select `names` from `input`.
    pub fn new<S: AsRef<str>>(input: CubeRef, names: &[S]) -> ConstructionResult<Self> {
        if names.is_empty() {
            return Err(ConstructionError::NoBands);
        }
        let mut indices = Vec::with_capacity(names.len());
        let mut bands = BandCollection::new();
        for name in names {
            let index = input.bands().index_of(name.as_ref())?;
            if let Some(band) = input.bands().get_index(index) {
                bands.push(band.clone())?;
            }
            indices.push(index);
        }
        Ok(Self {
            id: CubeId::new(),
            input,
            indices,
            bands,
        })
    }
}

impl Cube for SelectBandsCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "select_bands"
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
        let [_, t, y, x] = input.shape();
        let mut out = ChunkData::nodata([self.indices.len(), t, y, x], input.nodata_value());
        for (b, &index) in self.indices.iter().enumerate() {
            out.band_mut(b).copy_from_slice(input.band(index));
        }
        Ok(out)
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::SelectBands {
            input: Box::new(self.input.to_spec()),
            bands: self.bands.names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubes::testing::{assert_same, grid_cube, materialize, small_view};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn input() -> CubeRef {
        grid_cube(&small_view(), &["B1", "B2", "B3"], |b, t, y, x| {
            (b * 1000 + t * 100 + y * 10 + x) as f64
        })
    }

    #[test]
    fn test_select_reorders() {
        let cube = SelectBandsCube::new(input(), &["B3", "B1"]).unwrap();
        assert_eq!(cube.bands().names(), vec!["B3", "B1"]);
        let all = materialize(&cube);
        assert_eq!(all.get(0, 1, 2, 3), 2123.0);
        assert_eq!(all.get(1, 1, 2, 3), 123.0);
    }

    #[test]
    fn test_select_all_roundtrip() {
        let source = input();
        let first: CubeRef = Arc::new(SelectBandsCube::new(source.clone(), &["B2", "B3"]).unwrap());
        let names = first.bands().names();
        let second = SelectBandsCube::new(first.clone(), &names).unwrap();
        assert_same(materialize(&second).as_slice(), materialize(first.as_ref()).as_slice());
    }

    #[test]
    fn test_unknown_band() {
        assert!(matches!(
            SelectBandsCube::new(input(), &["B4"]),
            Err(ConstructionError::UnknownBand { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_select_matches_source_band(indices in proptest::collection::vec(0usize..3, 1..3)) {
            let source = input();
            let all_names = source.bands().names();
            let mut names: Vec<String> = Vec::new();
            for i in indices {
                if !names.contains(&all_names[i]) {
                    names.push(all_names[i].clone());
                }
            }
            let cube = SelectBandsCube::new(source.clone(), &names).unwrap();
            let chunk = cube.read_chunk(ChunkId(0)).unwrap();
            let full = source.read_chunk(ChunkId(0)).unwrap();
            for (b, name) in names.iter().enumerate() {
                let index = source.bands().index_of(name).unwrap();
                prop_assert_eq!(chunk.band(b), full.band(index));
            }
        }
    }
}
