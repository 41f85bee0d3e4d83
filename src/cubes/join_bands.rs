//! Band concatenation of two cubes sharing one view.

use crate::core::error::{ChunkError, ChunkResult, ConstructionResult, CubeId};
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{remap_nodata, Cube, CubeRef};
use crate::graph::serialization::CubeSpec;

/// Output bands are the left bands followed by the right bands, each side
/// optionally prefixed. Name collisions are construction errors.
#[derive(Debug)]
pub struct JoinBandsCube {
    id: CubeId,
    left: CubeRef,
    right: CubeRef,
    prefix_left: Option<String>,
    prefix_right: Option<String>,
    bands: BandCollection,
}

impl JoinBandsCube {
    /// Join two cubes with identical views.
    pub fn new(
        left: CubeRef,
        right: CubeRef,
        prefix_left: Option<String>,
        prefix_right: Option<String>,
    ) -> ConstructionResult<Self> {
        left.view().ensure_same(right.view())?;
        let prefixed = |cube: &CubeRef, prefix: &Option<String>| match prefix {
            Some(p) => cube.bands().with_prefix(p),
            None => cube.bands().clone(),
        };
        let mut bands = prefixed(&left, &prefix_left);
        bands.extend(&prefixed(&right, &prefix_right))?;
        Ok(Self {
            id: CubeId::new(),
            left,
            right,
            prefix_left,
            prefix_right,
            bands,
        })
    }
}

impl Cube for JoinBandsCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "join_bands"
    }

    fn view(&self) -> &CubeView {
        self.left.view()
    }

    fn bands(&self) -> &BandCollection {
        &self.bands
    }

    fn nodata(&self) -> f64 {
        self.left.nodata()
    }

    fn children(&self) -> Vec<CubeRef> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData> {
        let (left, right) = rayon::join(|| self.left.read_chunk(id), || self.right.read_chunk(id));
        let left = left?;
        let mut right = right?;
        remap_nodata(&mut right, self.right.nodata(), self.nodata());

        let [nl, t, y, x] = left.shape();
        let nr = right.bands();
        let mut data = left.into_vec();
        data.extend_from_slice(right.as_slice());
        ChunkData::from_vec([nl + nr, t, y, x], data, self.nodata())
            .ok_or_else(|| ChunkError::Other(format!("joined chunk {} has mismatching shapes", id)))
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::JoinBands {
            left: Box::new(self.left.to_spec()),
            right: Box::new(self.right.to_spec()),
            prefix_left: self.prefix_left.clone(),
            prefix_right: self.prefix_right.clone(),
        }
    }
}
