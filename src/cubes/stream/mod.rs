//! Operators that delegate chunk computation to external processes.
//!
//! Each chunk is sent to a fresh process on stdin in the [`protocol`] format
//! and the result is read back from stdout. The process sees the chunk id
//! in `RASTERCUBE_CHUNK_ID` and the node id in `RASTERCUBE_CUBE_ID`.
//! Every deviation from the expected output is a recoverable chunk error.

pub mod process;
pub mod protocol;

pub use process::{StreamCommand, DEFAULT_STREAM_TIMEOUT_SECS};

use crate::core::error::{ChunkError, ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::types::{BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{read_time_range, remap_nodata, Cube, CubeRef};
use crate::graph::serialization::CubeSpec;
use log::debug;

/// Environment variable carrying the chunk id.
pub const CHUNK_ID_ENV: &str = "RASTERCUBE_CHUNK_ID";

/// Environment variable carrying the node id.
pub const CUBE_ID_ENV: &str = "RASTERCUBE_CUBE_ID";

/// Run `command` on `input` and validate the reply against the expected
/// band names and `(t, y, x)` shape. The reply's nodata is remapped to `nodata`.
#[allow(clippy::too_many_arguments)]
fn exchange(
    cube: CubeId,
    chunk: ChunkId,
    command: &StreamCommand,
    input_bands: &[String],
    input: &ChunkData,
    expected: &[String],
    shape: [usize; 3],
    nodata: f64,
) -> ChunkResult<ChunkData> {
    let message = protocol::encode(input_bands, input);
    let env = [
        (CHUNK_ID_ENV, chunk.0.to_string()),
        (CUBE_ID_ENV, cube.0.to_string()),
    ];
    debug!(
        "cube {} sends chunk {} ({} bytes) to '{}'",
        cube,
        chunk,
        message.len(),
        command.display()
    );
    let reply = command.run(message, &env)?;
    let (header, mut data) = protocol::decode(&reply)?;

    if header.bands != expected {
        return Err(ChunkError::StreamMalformed {
            reason: format!(
                "process returned bands {:?}, expected {:?}",
                header.bands, expected
            ),
        });
    }
    if header.shape != shape {
        return Err(ChunkError::StreamMalformed {
            reason: format!(
                "process returned shape {:?}, expected {:?}",
                header.shape, shape
            ),
        });
    }
    remap_nodata(&mut data, header.nodata, nodata);
    ChunkData::from_vec(data.shape(), data.into_vec(), nodata).ok_or_else(|| ChunkError::StreamMalformed {
        reason: "payload does not match dimensions".to_string(),
    })
}

fn checked_names(names: &[String]) -> ConstructionResult<BandCollection> {
    if names.is_empty() {
        return Err(ConstructionError::NoBands);
    }
    BandCollection::from_names(names)
}

// ============================================================================
// Stream reduce over time
// ============================================================================

/// Sends the full time series of each spatial chunk to the process, which
/// returns one time step with the declared bands.
#[derive(Debug)]
pub struct StreamReduceTimeCube {
    id: CubeId,
    input: CubeRef,
    view: CubeView,
    command: StreamCommand,
    bands: BandCollection,
}

impl StreamReduceTimeCube {
    /// Create the cube; `names` are the bands the process emits.
    pub fn new(input: CubeRef, command: StreamCommand, names: &[String]) -> ConstructionResult<Self> {
        command.validate()?;
        let bands = checked_names(names)?;
        Ok(Self {
            id: CubeId::new(),
            view: input.view().with_reduced_time(),
            input,
            command,
            bands,
        })
    }
}

impl Cube for StreamReduceTimeCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "stream_reduce_time"
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
        let series = read_time_range(self.input.as_ref(), cy, cx, 0, self.input.view().nt())?;
        exchange(
            self.id,
            id,
            &self.command,
            &self.input.bands().names(),
            &series,
            &self.bands.names(),
            [1, sy, sx],
            self.nodata(),
        )
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::StreamReduceTime {
            input: Box::new(self.input.to_spec()),
            command: self.command.clone(),
            names: self.bands.names(),
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

// ============================================================================
// Stream apply per pixel
// ============================================================================

/// Sends each chunk to the process, which returns the same cells with the
/// declared bands. With `keep_bands`, input bands precede the new ones.
#[derive(Debug)]
pub struct StreamApplyPixelCube {
    id: CubeId,
    input: CubeRef,
    command: StreamCommand,
    names: Vec<String>,
    keep_bands: bool,
    bands: BandCollection,
}

impl StreamApplyPixelCube {
    /// Create the cube; `names` are the bands the process emits.
    pub fn new(
        input: CubeRef,
        command: StreamCommand,
        names: &[String],
        keep_bands: bool,
    ) -> ConstructionResult<Self> {
        command.validate()?;
        let emitted = checked_names(names)?;
        let mut bands = if keep_bands {
            input.bands().clone()
        } else {
            BandCollection::new()
        };
        bands.extend(&emitted)?;
        Ok(Self {
            id: CubeId::new(),
            input,
            command,
            names: names.to_vec(),
            keep_bands,
            bands,
        })
    }
}

impl Cube for StreamApplyPixelCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "stream_apply_pixel"
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
        let nodata = self.nodata();
        let emitted = exchange(
            self.id,
            id,
            &self.command,
            &self.input.bands().names(),
            &input,
            &self.names,
            [t, y, x],
            nodata,
        )?;
        if !self.keep_bands {
            return Ok(emitted);
        }
        let mut data = input.into_vec();
        data.extend_from_slice(emitted.as_slice());
        ChunkData::from_vec([self.bands.len(), t, y, x], data, nodata)
            .ok_or_else(|| ChunkError::Other(format!("stream chunk {} has mismatching size", id)))
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::StreamApplyPixel {
            input: Box::new(self.input.to_spec()),
            command: self.command.clone(),
            names: self.names.clone(),
            keep_bands: self.keep_bands,
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

// ============================================================================
// Generic stream
// ============================================================================

/// Sends each chunk to the process, which returns a chunk of the same shape.
/// Output bands default to the input bands.
#[derive(Debug)]
pub struct StreamCube {
    id: CubeId,
    input: CubeRef,
    command: StreamCommand,
    names: Option<Vec<String>>,
    bands: BandCollection,
}

impl StreamCube {
    /// Create the cube.
    pub fn new(
        input: CubeRef,
        command: StreamCommand,
        names: Option<Vec<String>>,
    ) -> ConstructionResult<Self> {
        command.validate()?;
        let bands = match &names {
            Some(names) => checked_names(names)?,
            None => input.bands().clone(),
        };
        Ok(Self {
            id: CubeId::new(),
            input,
            command,
            names,
            bands,
        })
    }
}

impl Cube for StreamCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "stream"
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
        exchange(
            self.id,
            id,
            &self.command,
            &self.input.bands().names(),
            &input,
            &self.bands.names(),
            [t, y, x],
            self.nodata(),
        )
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::Stream {
            input: Box::new(self.input.to_spec()),
            command: self.command.clone(),
            names: self.names.clone(),
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }
}
