//! Chunk workers: local evaluation and remote HTTP workers.
//!
//! A remote worker speaks a two-call protocol:
//!
//! - `POST {endpoint}/cube` with the graph JSON returns a cube id as text
//! - `GET {endpoint}/cube/{cube_id}/{chunk_id}` returns one chunk in the
//!   stream wire format
//!
//! Graphs are uploaded once per endpoint and the returned id is cached.

use crate::core::error::{ChunkError, ChunkResult, CubeId};
use crate::core::types::ChunkData;
use crate::core::view::ChunkId;
use crate::cubes::stream::protocol;
use crate::cubes::{remap_nodata, Cube};
use crate::graph::serialization::SerializedCube;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Produces chunks of a cube.
pub trait ChunkWorker: Send + Sync + fmt::Debug {
    /// Short description for logs.
    fn name(&self) -> String;

    /// Evaluate chunk `id` of `cube`.
    fn compute(&self, cube: &dyn Cube, id: ChunkId) -> ChunkResult<ChunkData>;
}

/// Evaluates chunks in the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWorker;

impl ChunkWorker for LocalWorker {
    fn name(&self) -> String {
        "local".to_string()
    }

    fn compute(&self, cube: &dyn Cube, id: ChunkId) -> ChunkResult<ChunkData> {
        cube.read_chunk(id)
    }
}

/// Delegates chunks to one remote HTTP worker.
pub struct RemoteWorker {
    endpoint: String,
    agent: ureq::Agent,
    /// Remote ids of uploaded graphs, keyed by root node.
    uploaded: Mutex<HashMap<CubeId, String>>,
}

impl fmt::Debug for RemoteWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWorker")
            .field("endpoint", &self.endpoint)
            .field("uploaded", &self.uploaded.lock().len())
            .finish()
    }
}

impl RemoteWorker {
    /// Worker for `endpoint`, e.g. `http://10.0.0.2:1111`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            endpoint,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            uploaded: Mutex::new(HashMap::new()),
        }
    }

    /// Base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn remote_error(&self, reason: impl fmt::Display) -> ChunkError {
        ChunkError::Remote {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// Remote id of `cube`, uploading the graph on first use.
    fn remote_id(&self, cube: &dyn Cube) -> ChunkResult<String> {
        let mut uploaded = self.uploaded.lock();
        if let Some(id) = uploaded.get(&cube.id()) {
            return Ok(id.clone());
        }
        let json = SerializedCube::from_cube(cube)
            .to_json_compact()
            .map_err(|e| self.remote_error(e))?;
        let response = self
            .agent
            .post(&format!("{}/cube", self.endpoint))
            .set("Content-Type", "application/json")
            .send_string(&json)
            .map_err(|e| self.remote_error(e))?;
        let remote = response
            .into_string()
            .map_err(|e| self.remote_error(e))?
            .trim()
            .to_string();
        if remote.is_empty() {
            return Err(self.remote_error("empty cube id in upload response"));
        }
        info!("Uploaded cube {} to {} as '{}'", cube.id(), self.endpoint, remote);
        uploaded.insert(cube.id(), remote.clone());
        Ok(remote)
    }
}

impl ChunkWorker for RemoteWorker {
    fn name(&self) -> String {
        self.endpoint.clone()
    }

    fn compute(&self, cube: &dyn Cube, id: ChunkId) -> ChunkResult<ChunkData> {
        let region = cube.view().chunk_region(id)?;
        let remote = self.remote_id(cube)?;
        let response = self
            .agent
            .get(&format!("{}/cube/{}/{}", self.endpoint, remote, id.0))
            .call()
            .map_err(|e| self.remote_error(e))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| self.remote_error(e))?;
        debug!("Received chunk {} from {} ({} bytes)", id, self.endpoint, body.len());

        let (header, mut chunk) = protocol::decode(&body)?;
        let [st, sy, sx] = region.size;
        if header.shape != [st, sy, sx] || header.bands.len() != cube.bands().len() {
            return Err(self.remote_error(format!(
                "chunk {} has {} bands of shape {:?}, expected {} of {:?}",
                id,
                header.bands.len(),
                header.shape,
                cube.bands().len(),
                region.size
            )));
        }
        remap_nodata(&mut chunk, header.nodata, cube.nodata());
        ChunkData::from_vec(chunk.shape(), chunk.into_vec(), cube.nodata())
            .ok_or_else(|| self.remote_error("payload does not match dimensions"))
    }
}

/// Distributes chunks round-robin over several remote workers.
#[derive(Debug)]
pub struct SwarmWorker {
    workers: Vec<RemoteWorker>,
    next: AtomicUsize,
}

impl SwarmWorker {
    /// Swarm over `endpoints`.
    pub fn new<S: AsRef<str>>(endpoints: &[S], timeout: Duration) -> Self {
        Self {
            workers: endpoints
                .iter()
                .map(|e| RemoteWorker::new(e.as_ref(), timeout))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the swarm has no endpoints.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl ChunkWorker for SwarmWorker {
    fn name(&self) -> String {
        format!("swarm of {}", self.workers.len())
    }

    fn compute(&self, cube: &dyn Cube, id: ChunkId) -> ChunkResult<ChunkData> {
        if self.workers.is_empty() {
            return Err(ChunkError::Other("swarm has no endpoints".to_string()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].compute(cube, id)
    }
}
