//! Cube operator graph.
//!
//! Every node of a cube graph implements the [`Cube`] trait. Nodes hold
//! shared references to their children ([`CubeRef`]), so one leaf can feed
//! several branches that are joined later. A graph is immutable once built:
//! all validation happens in the constructors, and [`Cube::read_chunk`] is
//! re-entrant so the scheduler may call it from many threads at once.
//!
//! # Variants
//!
//! | kind | type |
//! |---|---|
//! | `image_collection` | [`ImageCollectionCube`] |
//! | `dummy` | [`DummyCube`] |
//! | `reduce_time` | [`ReduceTimeCube`] |
//! | `reduce_space` | [`ReduceSpaceCube`] |
//! | `window_time` | [`WindowTimeCube`] (reducer or kernel) |
//! | `apply_pixel` | [`ApplyPixelCube`] |
//! | `select_bands` | [`SelectBandsCube`] |
//! | `join_bands` | [`JoinBandsCube`] |
//! | `filter_predicate` | [`FilterPredicateCube`] |
//! | `fill_time` | [`FillTimeCube`] |
//! | `stream_*` | [`StreamReduceTimeCube`], [`StreamApplyPixelCube`], [`StreamCube`] |

pub mod apply_pixel;
pub mod dummy;
pub mod fill_time;
pub mod filter_predicate;
pub mod image_collection;
pub mod join_bands;
pub mod reduce_space;
pub mod reduce_time;
pub mod select_bands;
pub mod stream;
pub mod window_time;

pub use apply_pixel::ApplyPixelCube;
pub use dummy::DummyCube;
pub use fill_time::{FillMethod, FillTimeCube};
pub use filter_predicate::FilterPredicateCube;
pub use image_collection::{
    CollectionEntry, CollectionExtent, ImageCollection, ImageCollectionCube, ImageMask,
    MemoryCollection, MemoryImage, OverlapPolicy, OverlapRule, Resampling, SourceWindow,
};
pub use join_bands::JoinBandsCube;
pub use reduce_space::ReduceSpaceCube;
pub use reduce_time::ReduceTimeCube;
pub use select_bands::SelectBandsCube;
pub use stream::{StreamApplyPixelCube, StreamCommand, StreamCube, StreamReduceTimeCube};
pub use window_time::WindowTimeCube;

use crate::core::error::{ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::reducer::Reducer;
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::graph::serialization::CubeSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Shared reference to a cube node.
pub type CubeRef = Arc<dyn Cube>;

/// A lazily evaluated data cube.
///
/// Implementations must not keep mutable state that is written during
/// [`Cube::read_chunk`]; each call allocates its own buffers.
pub trait Cube: Send + Sync + fmt::Debug {
    /// Unique id of this node.
    fn id(&self) -> CubeId;

    /// Operator kind, e.g. `"reduce_time"`.
    fn kind(&self) -> &'static str;

    /// Geometry of this cube.
    fn view(&self) -> &CubeView;

    /// Ordered output bands.
    fn bands(&self) -> &BandCollection;

    /// Nodata sentinel written into output chunks.
    fn nodata(&self) -> f64;

    /// Direct inputs of this node.
    fn children(&self) -> Vec<CubeRef> {
        Vec::new()
    }

    /// Materialize one chunk.
    ///
    /// The returned buffer has shape `[bands, t, y, x]` with the actual size
    /// of the chunk, which is smaller than the nominal chunk shape at the
    /// upper edges of the cube.
    fn read_chunk(&self, id: ChunkId) -> ChunkResult<ChunkData>;

    /// Number of chunks along `(t, y, x)`.
    fn chunk_count(&self) -> [usize; 3] {
        self.view().chunk_count()
    }

    /// Serializable description of the graph rooted at this node.
    fn to_spec(&self) -> CubeSpec;

    /// Whether this node delegates work to an external process.
    fn is_streaming(&self) -> bool {
        false
    }
}

/// Whether any node of the graph rooted at `cube` is a streaming node.
pub fn contains_streaming(cube: &dyn Cube) -> bool {
    cube.is_streaming() || cube.children().iter().any(|c| contains_streaming(c.as_ref()))
}

/// Number of nodes of the graph rooted at `cube`, counting shared nodes once per path.
pub fn graph_size(cube: &dyn Cube) -> usize {
    1 + cube
        .children()
        .iter()
        .map(|c| graph_size(c.as_ref()))
        .sum::<usize>()
}

/// Serializable summary of a cube.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeInfo {
    pub id: CubeId,
    pub kind: String,
    pub view: CubeView,
    pub bands: BandCollection,
    /// `None` when the sentinel is NaN.
    pub nodata: Option<f64>,
    /// Cell counts `(t, y, x)`.
    pub shape: [usize; 3],
    pub chunk_count: [usize; 3],
    pub total_chunks: u64,
    /// Size of the materialized cube in bytes.
    pub size_bytes: u64,
    pub time_labels: Vec<String>,
    pub streaming: bool,
}

impl CubeInfo {
    /// Summarize a cube.
    pub fn of(cube: &dyn Cube) -> Self {
        let view = cube.view();
        let shape = view.shape();
        let cells: u64 = shape.iter().map(|&n| n as u64).product();
        let nodata = cube.nodata();
        Self {
            id: cube.id(),
            kind: cube.kind().to_string(),
            view: view.clone(),
            bands: cube.bands().clone(),
            nodata: (!nodata.is_nan()).then_some(nodata),
            shape,
            chunk_count: cube.chunk_count(),
            total_chunks: view.total_chunks(),
            size_bytes: cells * cube.bands().len() as u64 * std::mem::size_of::<f64>() as u64,
            time_labels: view.time_labels(),
            streaming: contains_streaming(cube),
        }
    }
}

// ============================================================================
// Shared helpers for operator nodes
// ============================================================================

/// Reducer applied to one input band; output is named `{band}_{reducer}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerBand {
    pub reducer: Reducer,
    pub band: String,
}

impl ReducerBand {
    /// Create a new pair.
    pub fn new(reducer: Reducer, band: impl Into<String>) -> Self {
        Self {
            reducer,
            band: band.into(),
        }
    }
}

/// Resolve reducer/band pairs against `input`, returning input band positions
/// and the output band collection.
pub(crate) fn resolve_reducers(
    input: &BandCollection,
    pairs: &[ReducerBand],
    keep_names: bool,
) -> ConstructionResult<(Vec<(Reducer, usize)>, BandCollection)> {
    if pairs.is_empty() {
        return Err(ConstructionError::NoBands);
    }
    let mut resolved = Vec::with_capacity(pairs.len());
    let mut bands = BandCollection::new();
    for pair in pairs {
        let index = input.index_of(&pair.band)?;
        let source = input
            .get_index(index)
            .ok_or_else(|| ConstructionError::Other(format!("band index {} out of range", index)))?;
        let name = if keep_names {
            source.name.clone()
        } else {
            format!("{}_{}", source.name, pair.reducer)
        };
        let mut band = source.renamed(name);
        band.scale = 1.0;
        band.offset = 0.0;
        if matches!(
            pair.reducer,
            Reducer::Count | Reducer::WhichMin | Reducer::WhichMax
        ) {
            band.unit = String::new();
        }
        bands.push(band)?;
        resolved.push((pair.reducer, index));
    }
    Ok((resolved, bands))
}

/// Read cells `[t0, t1)` of the time axis at spatial chunk `(cy, cx)` of `cube`.
///
/// Assembles the slab from every child chunk it overlaps.
pub(crate) fn read_time_range(
    cube: &dyn Cube,
    cy: usize,
    cx: usize,
    t0: usize,
    t1: usize,
) -> ChunkResult<ChunkData> {
    let view = cube.view();
    let ct = view.chunk.t;
    let first = view.chunk_region(view.chunk_id([t0 / ct, cy, cx]))?;
    let [_, sy, sx] = first.size;
    let nb = cube.bands().len();
    let nt = t1 - t0;
    let mut out = ChunkData::nodata([nb, nt, sy, sx], cube.nodata());
    if nt == 0 {
        return Ok(out);
    }
    let plane = sy * sx;
    for chunk_t in t0 / ct..=(t1 - 1) / ct {
        let id = view.chunk_id([chunk_t, cy, cx]);
        let region = view.chunk_region(id)?;
        let chunk = cube.read_chunk(id)?;
        let from = region.offset[0].max(t0);
        let to = region.end()[0].min(t1);
        for b in 0..nb {
            let src = chunk.band(b);
            let dst = out.band_mut(b);
            for t in from..to {
                let s = (t - region.offset[0]) * plane;
                let d = (t - t0) * plane;
                dst[d..d + plane].copy_from_slice(&src[s..s + plane]);
            }
        }
    }
    Ok(out)
}

/// Replace cells equal to `from` (or NaN) by `to` when the sentinels differ.
pub(crate) fn remap_nodata(chunk: &mut ChunkData, from: f64, to: f64) {
    if from == to || (from.is_nan() && to.is_nan()) {
        return;
    }
    for v in chunk.as_mut_slice() {
        if v.is_nan() || *v == from {
            *v = to;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test fixtures shared by the operator tests.

    use super::*;
    use crate::core::types::Band;
    use crate::core::view::tests::test_view;
    use crate::core::view::ChunkShape;

    /// Cube over `view` whose cell values are `f(band, t, y, x)`, backed by an
    /// in-memory image collection with one grid-aligned image per time step.
    pub(crate) fn grid_cube<F>(view: &CubeView, bands: &[&str], f: F) -> CubeRef
    where
        F: Fn(usize, usize, usize, usize) -> f64,
    {
        let collection_bands =
            BandCollection::from_bands(bands.iter().map(|b| Band::new(*b))).unwrap();
        let mut collection = MemoryCollection::new("grid", collection_bands);
        let [nt, ny, nx] = view.shape();
        let geotransform = [view.space.left, view.dx, 0.0, view.space.top, 0.0, -view.dy];
        for t in 0..nt {
            let mut image = MemoryImage::new(
                format!("img{}", t),
                view.time_at(t),
                view.srs.clone(),
                geotransform,
                nx,
                ny,
            );
            for (b, name) in bands.iter().enumerate() {
                let data = (0..ny)
                    .flat_map(|y| (0..nx).map(move |x| (y, x)))
                    .map(|(y, x)| f(b, t, y, x))
                    .collect();
                image = image.with_band(*name, data);
            }
            collection.add_image(image).unwrap();
        }
        Arc::new(ImageCollectionCube::new(Arc::new(collection), view.clone()).unwrap())
    }

    /// Small default view used by most operator tests: 6 days, 3 × 4 cells.
    pub(crate) fn small_view() -> CubeView {
        test_view(6, 3, 4, ChunkShape::new(4, 2, 3))
    }

    /// Assemble the full cube `[bands, t, y, x]` by reading every chunk.
    pub(crate) fn materialize(cube: &dyn Cube) -> ChunkData {
        let view = cube.view();
        let [nt, ny, nx] = view.shape();
        let nb = cube.bands().len();
        let mut out = ChunkData::nodata([nb, nt, ny, nx], cube.nodata());
        for id in view.chunks() {
            let region = view.chunk_region(id).unwrap();
            let chunk = cube.read_chunk(id).unwrap();
            assert_eq!(chunk.shape(), [nb, region.size[0], region.size[1], region.size[2]]);
            for b in 0..nb {
                for t in 0..region.size[0] {
                    for y in 0..region.size[1] {
                        for x in 0..region.size[2] {
                            out.set(
                                b,
                                region.offset[0] + t,
                                region.offset[1] + y,
                                region.offset[2] + x,
                                chunk.get(b, t, y, x),
                            );
                        }
                    }
                }
            }
        }
        out
    }

    /// Compare two buffers treating NaN as equal to NaN.
    pub(crate) fn assert_same(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!(
                x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan()),
                "cell {}: {} != {}",
                i,
                x,
                y
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_read_time_range_spans_chunks() {
        let view = small_view();
        let cube = grid_cube(&view, &["B1"], |_, t, y, x| (t * 100 + y * 10 + x) as f64);
        let slab = read_time_range(cube.as_ref(), 0, 1, 2, 6).unwrap();
        assert_eq!(slab.shape(), [1, 4, 2, 1]);
        assert_eq!(slab.get(0, 0, 0, 0), 203.0);
        assert_eq!(slab.get(0, 3, 1, 0), 513.0);
    }

    #[test]
    fn test_cube_info() {
        let view = small_view();
        let cube = grid_cube(&view, &["B1", "B2"], |_, _, _, _| 1.0);
        let info = CubeInfo::of(cube.as_ref());
        assert_eq!(info.kind, "image_collection");
        assert_eq!(info.shape, [6, 3, 4]);
        assert_eq!(info.total_chunks, 8);
        assert_eq!(info.size_bytes, 2 * 6 * 3 * 4 * 8);
        assert!(!info.streaming);
        assert_eq!(graph_size(cube.as_ref()), 1);
    }

    #[test]
    fn test_resolve_reducers_names() {
        let input = BandCollection::from_names(&["red", "nir"]).unwrap();
        let (pairs, bands) = resolve_reducers(
            &input,
            &[
                ReducerBand::new(Reducer::Mean, "nir"),
                ReducerBand::new(Reducer::Count, "red"),
            ],
            false,
        )
        .unwrap();
        assert_eq!(pairs, vec![(Reducer::Mean, 1), (Reducer::Count, 0)]);
        assert_eq!(bands.names(), vec!["nir_mean", "red_count"]);

        let err = resolve_reducers(&input, &[ReducerBand::new(Reducer::Max, "blue")], false);
        assert!(matches!(err, Err(ConstructionError::UnknownBand { .. })));
    }
}
