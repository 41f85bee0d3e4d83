//! Cube views and chunk addressing.
//!
//! A [`CubeView`] fixes the geometry every cube in a graph agrees on: spatial
//! extent and resolution, a closed-open temporal extent with a calendar-aware
//! step, and the chunk shape. Chunks are addressed by a linear [`ChunkId`]
//! over a `(t, y, x)` chunk grid. The last chunk along an axis may be partial,
//! and [`CubeView::chunk_region`] always reports the actual size.
//!
//! Row `0` of the y axis is the northern edge (`top`).

use crate::core::error::{ChunkError, ChunkResult, ConstructionError, ConstructionResult};
use chrono::{Duration, Months, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance (in cells) when checking that extent / resolution is integral.
const CELL_TOLERANCE: f64 = 1e-6;

/// Unit of the temporal resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    fn fixed_seconds(&self) -> Option<i64> {
        match self {
            TimeUnit::Second => Some(1),
            TimeUnit::Minute => Some(60),
            TimeUnit::Hour => Some(3_600),
            TimeUnit::Day => Some(86_400),
            TimeUnit::Week => Some(604_800),
            TimeUnit::Month | TimeUnit::Year => None,
        }
    }

    /// strftime pattern used for time labels at this granularity.
    pub fn label_format(&self) -> &'static str {
        match self {
            TimeUnit::Year => "%Y",
            TimeUnit::Month => "%Y-%m",
            TimeUnit::Week | TimeUnit::Day => "%Y-%m-%d",
            TimeUnit::Hour | TimeUnit::Minute | TimeUnit::Second => "%Y-%m-%dT%H:%M:%S",
        }
    }
}

/// Temporal resolution: an integer multiple of a [`TimeUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeStep {
    pub count: u32,
    pub unit: TimeUnit,
}

impl TimeStep {
    /// Create a new step.
    pub fn new(count: u32, unit: TimeUnit) -> Self {
        Self { count, unit }
    }

    /// Shorthand for `count` days.
    pub fn days(count: u32) -> Self {
        Self::new(count, TimeUnit::Day)
    }

    /// Shorthand for `count` months.
    pub fn months(count: u32) -> Self {
        Self::new(count, TimeUnit::Month)
    }

    /// Datetime `n` steps after `origin`.
    pub fn advance(&self, origin: NaiveDateTime, n: u64) -> Option<NaiveDateTime> {
        let total = n.checked_mul(self.count as u64)?;
        match self.unit.fixed_seconds() {
            Some(seconds) => {
                let secs = i64::try_from(total).ok()?.checked_mul(seconds)?;
                origin.checked_add_signed(Duration::try_seconds(secs)?)
            }
            None => {
                let months = match self.unit {
                    TimeUnit::Year => total.checked_mul(12)?,
                    _ => total,
                };
                origin.checked_add_months(Months::new(u32::try_from(months).ok()?))
            }
        }
    }

    /// Index of the step containing `t`, counting from `origin`.
    ///
    /// Returns `None` if `t` is before `origin`.
    pub fn index_of(&self, origin: NaiveDateTime, t: NaiveDateTime) -> Option<u64> {
        if t < origin || self.count == 0 {
            return None;
        }
        let mut k = match self.unit.fixed_seconds() {
            Some(seconds) => {
                let step = seconds * self.count as i64;
                ((t - origin).num_seconds() / step) as u64
            }
            None => {
                let months = |d: NaiveDateTime| {
                    use chrono::Datelike;
                    d.year() as i64 * 12 + d.month0() as i64
                };
                let per_step = match self.unit {
                    TimeUnit::Year => 12 * self.count as i64,
                    _ => self.count as i64,
                };
                ((months(t) - months(origin)).max(0) / per_step) as u64
            }
        };
        // Calendar steps can overshoot by one when the day-of-month differs.
        while k > 0 && self.advance(origin, k)? > t {
            k -= 1;
        }
        while self.advance(origin, k + 1)? <= t {
            k += 1;
        }
        Some(k)
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.count, self.unit)
    }
}

/// Spatial extent in view SRS units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialExtent {
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
}

impl SpatialExtent {
    /// Create a new extent.
    pub fn new(left: f64, right: f64, bottom: f64, top: f64) -> Self {
        Self {
            left,
            right,
            bottom,
            top,
        }
    }

    /// Width in SRS units.
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    /// Height in SRS units.
    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Whether two extents overlap with non-zero area.
    pub fn intersects(&self, other: &SpatialExtent) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.bottom < other.top
            && other.bottom < self.top
    }

    /// Whether a point lies inside (left/top inclusive, right/bottom exclusive).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x < self.right && y <= self.top && y > self.bottom
    }
}

/// Closed-open temporal extent `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalExtent {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TemporalExtent {
    /// Create a new temporal extent.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Whether `t` lies within `[start, end)`.
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start && t < self.end
    }

    /// Whether two extents overlap.
    pub fn intersects(&self, other: &TemporalExtent) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Number of cells per chunk along `(t, y, x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkShape {
    pub t: usize,
    pub y: usize,
    pub x: usize,
}

impl ChunkShape {
    /// Create a new chunk shape.
    pub fn new(t: usize, y: usize, x: usize) -> Self {
        Self { t, y, x }
    }
}

impl Default for ChunkShape {
    fn default() -> Self {
        Self::new(16, 256, 256)
    }
}

/// Linear index of a chunk in the `(t, y, x)` chunk grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cell window covered by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRegion {
    /// Chunk coordinates in the chunk grid `(t, y, x)`.
    pub coords: [usize; 3],
    /// First cell of the chunk `(t, y, x)`.
    pub offset: [usize; 3],
    /// Actual number of cells `(t, y, x)`; smaller than the nominal shape for edge chunks.
    pub size: [usize; 3],
}

impl ChunkRegion {
    /// Number of cells per band.
    pub fn cells(&self) -> usize {
        self.size.iter().product()
    }

    /// Exclusive end cell along each axis.
    pub fn end(&self) -> [usize; 3] {
        [
            self.offset[0] + self.size[0],
            self.offset[1] + self.size[1],
            self.offset[2] + self.size[2],
        ]
    }
}

/// Geometry shared by every cube of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeView {
    /// Spatial reference system, e.g. `EPSG:3857`.
    pub srs: String,
    pub space: SpatialExtent,
    pub dx: f64,
    pub dy: f64,
    pub time: TemporalExtent,
    pub dt: TimeStep,
    #[serde(default)]
    pub chunk: ChunkShape,
}

fn integral_cells(extent: f64, resolution: f64, axis: &str) -> ConstructionResult<usize> {
    if !(resolution > 0.0) || !resolution.is_finite() {
        return Err(ConstructionError::InvalidView {
            reason: format!("{} resolution must be positive, got {}", axis, resolution),
        });
    }
    if !(extent > 0.0) {
        return Err(ConstructionError::InvalidView {
            reason: format!("{} extent must be positive, got {}", axis, extent),
        });
    }
    let cells = extent / resolution;
    let rounded = cells.round();
    if (cells - rounded).abs() > CELL_TOLERANCE * rounded.max(1.0) {
        return Err(ConstructionError::InvalidView {
            reason: format!(
                "{} extent {} is not an integer multiple of resolution {}",
                axis, extent, resolution
            ),
        });
    }
    Ok(rounded as usize)
}

impl CubeView {
    /// Create and validate a view.
    pub fn new(
        srs: impl Into<String>,
        space: SpatialExtent,
        (dx, dy): (f64, f64),
        time: TemporalExtent,
        dt: TimeStep,
        chunk: ChunkShape,
    ) -> ConstructionResult<Self> {
        let view = Self {
            srs: srs.into(),
            space,
            dx,
            dy,
            time,
            dt,
            chunk,
        };
        view.validate()?;
        Ok(view)
    }

    /// Create a view, growing `right`, `bottom` and `end` so that every axis
    /// holds an integer number of cells.
    pub fn fit(
        srs: impl Into<String>,
        mut space: SpatialExtent,
        (dx, dy): (f64, f64),
        mut time: TemporalExtent,
        dt: TimeStep,
        chunk: ChunkShape,
    ) -> ConstructionResult<Self> {
        if dx > 0.0 && dy > 0.0 {
            let nx = (space.width() / dx - CELL_TOLERANCE).ceil().max(1.0);
            let ny = (space.height() / dy - CELL_TOLERANCE).ceil().max(1.0);
            space.right = space.left + nx * dx;
            space.bottom = space.top - ny * dy;
        }
        if dt.count > 0 {
            let mut n = 1;
            while let Some(t) = dt.advance(time.start, n) {
                if t >= time.end {
                    time.end = t;
                    break;
                }
                n += 1;
            }
        }
        Self::new(srs, space, (dx, dy), time, dt, chunk)
    }

    /// Check the geometric invariants of the view.
    pub fn validate(&self) -> ConstructionResult<()> {
        integral_cells(self.space.width(), self.dx, "x")?;
        integral_cells(self.space.height(), self.dy, "y")?;
        if self.dt.count == 0 {
            return Err(ConstructionError::InvalidView {
                reason: "temporal resolution must be positive".to_string(),
            });
        }
        if self.time.end <= self.time.start {
            return Err(ConstructionError::InvalidView {
                reason: format!(
                    "temporal extent is empty ({} .. {})",
                    self.time.start, self.time.end
                ),
            });
        }
        let nt = self.count_time_steps();
        if self.dt.advance(self.time.start, nt as u64) != Some(self.time.end) {
            return Err(ConstructionError::InvalidView {
                reason: format!(
                    "temporal extent {} .. {} is not an integer multiple of {}",
                    self.time.start, self.time.end, self.dt
                ),
            });
        }
        if self.chunk.t == 0 || self.chunk.y == 0 || self.chunk.x == 0 {
            return Err(ConstructionError::InvalidView {
                reason: "chunk shape must be non-zero along every axis".to_string(),
            });
        }
        Ok(())
    }

    fn count_time_steps(&self) -> usize {
        let mut n = 0u64;
        while let Some(t) = self.dt.advance(self.time.start, n) {
            if t >= self.time.end {
                break;
            }
            n += 1;
        }
        n as usize
    }

    /// Number of cells along x.
    pub fn nx(&self) -> usize {
        (self.space.width() / self.dx).round() as usize
    }

    /// Number of cells along y.
    pub fn ny(&self) -> usize {
        (self.space.height() / self.dy).round() as usize
    }

    /// Number of time steps.
    pub fn nt(&self) -> usize {
        self.dt
            .index_of(self.time.start, self.time.end)
            .map(|k| k as usize)
            .unwrap_or(0)
    }

    /// Cell counts `(t, y, x)`.
    pub fn shape(&self) -> [usize; 3] {
        [self.nt(), self.ny(), self.nx()]
    }

    /// Number of chunks along `(t, y, x)`.
    pub fn chunk_count(&self) -> [usize; 3] {
        let [nt, ny, nx] = self.shape();
        [
            nt.div_ceil(self.chunk.t),
            ny.div_ceil(self.chunk.y),
            nx.div_ceil(self.chunk.x),
        ]
    }

    /// Total number of chunks.
    pub fn total_chunks(&self) -> u64 {
        self.chunk_count().iter().map(|&n| n as u64).product()
    }

    /// Linear chunk id of chunk grid coordinates.
    pub fn chunk_id(&self, coords: [usize; 3]) -> ChunkId {
        let [_, ncy, ncx] = self.chunk_count();
        ChunkId((coords[0] * ncy * ncx + coords[1] * ncx + coords[2]) as u64)
    }

    /// Chunk grid coordinates of a chunk id.
    pub fn chunk_coords(&self, id: ChunkId) -> ChunkResult<[usize; 3]> {
        let total = self.total_chunks();
        if id.0 >= total {
            return Err(ChunkError::OutOfRange { chunk: id, total });
        }
        let [_, ncy, ncx] = self.chunk_count();
        let i = id.0 as usize;
        Ok([i / (ncy * ncx), (i / ncx) % ncy, i % ncx])
    }

    /// Cell window of a chunk, clipped to the cube.
    pub fn chunk_region(&self, id: ChunkId) -> ChunkResult<ChunkRegion> {
        let coords = self.chunk_coords(id)?;
        let shape = self.shape();
        let nominal = [self.chunk.t, self.chunk.y, self.chunk.x];
        let mut offset = [0; 3];
        let mut size = [0; 3];
        for axis in 0..3 {
            offset[axis] = coords[axis] * nominal[axis];
            size[axis] = nominal[axis].min(shape[axis] - offset[axis]);
        }
        Ok(ChunkRegion {
            coords,
            offset,
            size,
        })
    }

    /// Spatial bounds of a chunk region.
    pub fn region_extent(&self, region: &ChunkRegion) -> SpatialExtent {
        let [_, oy, ox] = region.offset;
        let [_, sy, sx] = region.size;
        SpatialExtent {
            left: self.space.left + ox as f64 * self.dx,
            right: self.space.left + (ox + sx) as f64 * self.dx,
            top: self.space.top - oy as f64 * self.dy,
            bottom: self.space.top - (oy + sy) as f64 * self.dy,
        }
    }

    /// Temporal bounds of a chunk region.
    pub fn region_time(&self, region: &ChunkRegion) -> TemporalExtent {
        let start = self.time_at(region.offset[0]);
        let end = self.time_at(region.offset[0] + region.size[0]);
        TemporalExtent { start, end }
    }

    /// Start datetime of time step `index`.
    pub fn time_at(&self, index: usize) -> NaiveDateTime {
        self.dt
            .advance(self.time.start, index as u64)
            .unwrap_or(self.time.end)
    }

    /// Time step containing `t`, if inside the temporal extent.
    pub fn time_index(&self, t: NaiveDateTime) -> Option<usize> {
        if !self.time.contains(t) {
            return None;
        }
        self.dt.index_of(self.time.start, t).map(|k| k as usize)
    }

    /// Cell `(row, col)` containing a point in view SRS.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !self.space.contains(x, y) {
            return None;
        }
        let col = ((x - self.space.left) / self.dx).floor() as usize;
        let row = ((self.space.top - y) / self.dy).floor() as usize;
        Some((row.min(self.ny() - 1), col.min(self.nx() - 1)))
    }

    /// X coordinates of cell centres.
    pub fn x_coords(&self) -> Vec<f64> {
        (0..self.nx())
            .map(|i| self.space.left + (i as f64 + 0.5) * self.dx)
            .collect()
    }

    /// Y coordinates of cell centres, from top to bottom.
    pub fn y_coords(&self) -> Vec<f64> {
        (0..self.ny())
            .map(|i| self.space.top - (i as f64 + 0.5) * self.dy)
            .collect()
    }

    /// Label of every time step, formatted at the granularity of the time unit.
    pub fn time_labels(&self) -> Vec<String> {
        let format = self.dt.unit.label_format();
        (0..self.nt())
            .map(|i| self.time_at(i).format(format).to_string())
            .collect()
    }

    /// The same view collapsed to one time step covering the whole temporal extent.
    pub fn with_reduced_time(&self) -> CubeView {
        let mut view = self.clone();
        view.dt = TimeStep::new(self.dt.count * self.nt() as u32, self.dt.unit);
        view.chunk.t = 1;
        view
    }

    /// The same view collapsed to one spatial cell covering the whole extent.
    pub fn with_reduced_space(&self) -> CubeView {
        let mut view = self.clone();
        view.dx = self.space.width();
        view.dy = self.space.height();
        view.chunk.y = 1;
        view.chunk.x = 1;
        view
    }

    /// Check that two views describe the same geometry and chunking.
    pub fn ensure_same(&self, other: &CubeView) -> ConstructionResult<()> {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0);
        let reason = if self.srs != other.srs {
            Some(format!("SRS {} != {}", self.srs, other.srs))
        } else if !(close(self.space.left, other.space.left)
            && close(self.space.right, other.space.right)
            && close(self.space.bottom, other.space.bottom)
            && close(self.space.top, other.space.top))
        {
            Some("spatial extents differ".to_string())
        } else if !(close(self.dx, other.dx) && close(self.dy, other.dy)) {
            Some("spatial resolutions differ".to_string())
        } else if self.time != other.time || self.dt != other.dt {
            Some("temporal extents or resolutions differ".to_string())
        } else if self.chunk != other.chunk {
            Some("chunk shapes differ".to_string())
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ConstructionError::IncompatibleViews { reason }),
            None => Ok(()),
        }
    }

    /// Iterate over every chunk id of this view.
    pub fn chunks(&self) -> ChunkIterator {
        ChunkIterator::new(self.total_chunks())
    }
}

/// Iterator over the chunk ids of a view in ascending order.
#[derive(Debug, Clone)]
pub struct ChunkIterator {
    next: u64,
    total: u64,
}

impl ChunkIterator {
    /// Create a new chunk iterator.
    pub fn new(total: u64) -> Self {
        Self { next: 0, total }
    }

    /// Get the total number of chunks.
    pub fn chunk_count(&self) -> u64 {
        self.total
    }
}

impl Iterator for ChunkIterator {
    type Item = ChunkId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let id = ChunkId(self.next);
        self.next += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIterator {}
