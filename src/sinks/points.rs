//! Point sampling.
//!
//! [`PointSampler`] extracts band values of the cells containing a set of
//! space-time points. Only chunks that contain a point need evaluation;
//! [`PointSampler::sample`] restricts the scheduler to them.

use crate::core::error::{CubeResult, SinkError};
use crate::core::srs::CoordTransformer;
use crate::core::types::ChunkData;
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{Cube, CubeRef};
use crate::execution::engine::{ChunkScheduler, ChunkSelection};
use crate::sinks::ChunkSink;
use chrono::NaiveDateTime;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A location at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointQuery {
    pub x: f64,
    pub y: f64,
    pub time: NaiveDateTime,
}

impl PointQuery {
    pub fn new(x: f64, y: f64, time: NaiveDateTime) -> Self {
        Self { x, y, time }
    }
}

/// Values sampled at every query point, in query order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValues {
    pub bands: Vec<String>,
    pub nodata: f64,
    /// One vector of band values per point; nodata outside the cube.
    pub values: Vec<Vec<f64>>,
    /// Points outside the spatial or temporal extent.
    pub out_of_range: usize,
}

/// Cell `[t, y, x]` of each point, or `None` outside the cube.
type Cells = Vec<Option<[usize; 3]>>;

/// Sink sampling cube values at points.
#[derive(Debug)]
pub struct PointSampler {
    points: Vec<PointQuery>,
    srs: String,
    cells: Cells,
    view: Option<CubeView>,
    values: Option<PointValues>,
}

impl PointSampler {
    /// Sampler for `points` given in `srs`.
    pub fn new(points: Vec<PointQuery>, srs: impl Into<String>) -> Self {
        Self {
            points,
            srs: srs.into(),
            cells: Vec::new(),
            view: None,
            values: None,
        }
    }

    pub fn points(&self) -> &[PointQuery] {
        &self.points
    }

    /// Result of the last evaluation.
    pub fn values(&self) -> Option<&PointValues> {
        self.values.as_ref()
    }

    fn locate(&self, view: &CubeView) -> Result<Cells, SinkError> {
        let transformer = CoordTransformer::new(&self.srs, &view.srs)
            .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
        let cells = self
            .points
            .iter()
            .map(|p| {
                let (x, y) = match transformer.transform(p.x, p.y) {
                    Ok(xy) => xy,
                    Err(e) => {
                        warn!("Cannot reproject point ({}, {}): {}", p.x, p.y, e);
                        return None;
                    }
                };
                let (row, col) = view.cell_of(x, y)?;
                let t = view.time_index(p.time)?;
                Some([t, row, col])
            })
            .collect();
        Ok(cells)
    }

    /// Chunks containing at least one point.
    pub fn chunk_selection(&self, view: &CubeView) -> Result<ChunkSelection, SinkError> {
        let chunk = view.chunk;
        let ids: BTreeSet<ChunkId> = self
            .locate(view)?
            .into_iter()
            .flatten()
            .map(|[t, y, x]| view.chunk_id([t / chunk.t, y / chunk.y, x / chunk.x]))
            .collect();
        Ok(ChunkSelection::Only(ids.into_iter().collect()))
    }

    /// Evaluate the chunks containing points and return the sampled values.
    pub fn sample(&mut self, cube: &CubeRef, scheduler: &ChunkScheduler) -> CubeResult<PointValues> {
        let selection = self.chunk_selection(cube.view())?;
        scheduler.run(cube, selection, self)?;
        self.values
            .clone()
            .ok_or_else(|| SinkError::NotStarted.into())
    }
}

impl ChunkSink for PointSampler {
    fn begin(&mut self, cube: &dyn Cube) -> Result<(), SinkError> {
        self.cells = self.locate(cube.view())?;
        self.view = Some(cube.view().clone());
        let nb = cube.bands().len();
        let out_of_range = self.cells.iter().filter(|c| c.is_none()).count();
        if out_of_range > 0 {
            warn!("{} of {} points are outside the cube", out_of_range, self.points.len());
        }
        self.values = Some(PointValues {
            bands: cube.bands().names(),
            nodata: cube.nodata(),
            values: vec![vec![cube.nodata(); nb]; self.points.len()],
            out_of_range,
        });
        Ok(())
    }

    fn consume(&mut self, id: ChunkId, chunk: ChunkData) -> Result<(), SinkError> {
        let (Some(view), Some(values)) = (self.view.as_ref(), self.values.as_mut()) else {
            return Err(SinkError::NotStarted);
        };
        let region = view
            .chunk_region(id)
            .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
        let [ot, oy, ox] = region.offset;
        let [st, sy, sx] = region.size;
        for (point, cell) in self.cells.iter().enumerate() {
            let Some([t, y, x]) = *cell else { continue };
            if t < ot || t >= ot + st || y < oy || y >= oy + sy || x < ox || x >= ox + sx {
                continue;
            }
            for (b, value) in values.values[point].iter_mut().enumerate() {
                *value = chunk.get(b, t - ot, y - oy, x - ox);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let values = self.values.as_ref().ok_or(SinkError::NotStarted)?;
        info!(
            "Sampled {} points ({} outside the cube)",
            values.values.len(),
            values.out_of_range
        );
        Ok(())
    }
}
