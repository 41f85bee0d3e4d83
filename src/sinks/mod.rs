//! Chunk consumers.
//!
//! The scheduler hands every evaluated chunk to exactly one [`ChunkSink`]
//! on the calling thread, so sinks need no internal synchronization. Chunks
//! arrive in completion order, not in id order.

pub mod geotiff;
pub mod points;
pub mod zonal;

pub use geotiff::{CogOptions, GeoTiffSink, OverviewResampling, Packing, PackingType};
pub use points::{PointQuery, PointSampler, PointValues};
pub use zonal::{ZonalRecord, ZonalStatistics};

use crate::core::error::SinkError;
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::Cube;
use std::collections::BTreeMap;

/// Receives evaluated chunks.
pub trait ChunkSink {
    /// Called once before the first chunk.
    fn begin(&mut self, cube: &dyn Cube) -> Result<(), SinkError>;

    /// Called once per chunk, in completion order.
    fn consume(&mut self, id: ChunkId, chunk: ChunkData) -> Result<(), SinkError>;

    /// Called after the last chunk of a successful evaluation.
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Keeps every chunk in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    layout: Option<(CubeView, BandCollection, f64)>,
    chunks: BTreeMap<ChunkId, ChunkData>,
    finished: bool,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored chunk.
    pub fn get(&self, id: ChunkId) -> Option<&ChunkData> {
        self.chunks.get(&id)
    }

    /// Stored chunks in id order.
    pub fn chunks(&self) -> impl Iterator<Item = (&ChunkId, &ChunkData)> {
        self.chunks.iter()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunk was stored.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether [`ChunkSink::finish`] was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Assemble the stored chunks into one `[bands, t, y, x]` buffer.
    /// Cells of missing chunks are nodata.
    pub fn assemble(&self) -> Result<ChunkData, SinkError> {
        let (view, bands, nodata) = self.layout.as_ref().ok_or(SinkError::NotStarted)?;
        let [nt, ny, nx] = view.shape();
        let nb = bands.len();
        let mut out = ChunkData::nodata([nb, nt, ny, nx], *nodata);
        for (id, chunk) in &self.chunks {
            let region = view
                .chunk_region(*id)
                .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
            let [st, sy, sx] = region.size;
            if chunk.shape() != [nb, st, sy, sx] {
                return Err(SinkError::InvalidInput(format!(
                    "chunk {} has shape {:?}, expected {:?}",
                    id,
                    chunk.shape(),
                    [nb, st, sy, sx]
                )));
            }
            let [ot, oy, ox] = region.offset;
            for b in 0..nb {
                let src = chunk.band(b);
                let dst = out.band_mut(b);
                for t in 0..st {
                    for y in 0..sy {
                        let s = (t * sy + y) * sx;
                        let d = ((ot + t) * ny + oy + y) * nx + ox;
                        dst[d..d + sx].copy_from_slice(&src[s..s + sx]);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl ChunkSink for MemorySink {
    fn begin(&mut self, cube: &dyn Cube) -> Result<(), SinkError> {
        self.layout = Some((cube.view().clone(), cube.bands().clone(), cube.nodata()));
        self.chunks.clear();
        self.finished = false;
        Ok(())
    }

    fn consume(&mut self, id: ChunkId, chunk: ChunkData) -> Result<(), SinkError> {
        if self.layout.is_none() {
            return Err(SinkError::NotStarted);
        }
        self.chunks.insert(id, chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubes::testing::{assert_same, grid_cube, materialize, small_view};

    #[test]
    fn test_memory_sink_assembles_cube() {
        let cube = grid_cube(&small_view(), &["B1", "B2"], |b, t, y, x| {
            (b * 1000 + t * 100 + y * 10 + x) as f64
        });
        let mut sink = MemorySink::new();
        sink.begin(cube.as_ref()).unwrap();
        for id in cube.view().chunks().collect::<Vec<_>>().into_iter().rev() {
            sink.consume(id, cube.read_chunk(id).unwrap()).unwrap();
        }
        sink.finish().unwrap();
        assert!(sink.is_finished());
        assert_eq!(sink.len(), 8);
        assert_same(
            sink.assemble().unwrap().as_slice(),
            materialize(cube.as_ref()).as_slice(),
        );
    }

    #[test]
    fn test_memory_sink_requires_begin() {
        let mut sink = MemorySink::new();
        assert!(matches!(
            sink.consume(ChunkId(0), ChunkData::nodata([1, 1, 1, 1], f64::NAN)),
            Err(SinkError::NotStarted)
        ));
        assert!(sink.assemble().is_err());
    }
}
