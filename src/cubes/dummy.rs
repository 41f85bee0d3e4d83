//! Constant-valued leaf cube.

use crate::core::error::{ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::Cube;
use crate::graph::serialization::CubeSpec;

/// Leaf cube whose bands `band1..bandN` hold a constant everywhere.
#[derive(Debug)]
pub struct DummyCube {
    id: CubeId,
    view: CubeView,
    bands: BandCollection,
    fill: f64,
    nodata: f64,
}

impl DummyCube {
    /// Create a dummy cube with `nbands` bands filled with `fill`.
    pub fn new(view: CubeView, nbands: usize, fill: f64) -> ConstructionResult<Self> {
        view.validate()?;
        if nbands == 0 {
            return Err(ConstructionError::NoBands);
        }
        let names: Vec<String> = (1..=nbands).map(|i| format!("band{}", i)).collect();
        Ok(Self {
            id: CubeId::new(),
            view,
            bands: BandCollection::from_names(&names)?,
            fill,
            nodata: f64::NAN,
        })
    }

    /// Use a numeric nodata sentinel instead of NaN.
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = nodata;
        self
    }

    /// Fill value.
    pub fn fill(&self) -> f64 {
        self.fill
    }
}

impl Cube for DummyCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "dummy"
    }

    fn view(&self) -> &CubeView {
        &self.view
    }

    fn bands(&self) -> &BandCollection {
        &self.bands
    }

    fn nodata(&self) -> f64 {
        self.nodata
    }

    fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData> {
        let region = self.view.chunk_region(id)?;
        let [t, y, x] = region.size;
        Ok(ChunkData::filled(
            [self.bands.len(), t, y, x],
            self.fill,
            self.nodata,
        ))
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::Dummy {
            view: self.view.clone(),
            bands: self.bands.len(),
            fill: self.fill,
            nodata: (!self.nodata.is_nan()).then_some(self.nodata),
        }
    }
}
