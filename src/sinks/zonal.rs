//! Zonal statistics over polygons.
//!
//! A cell belongs to a zone when its footprint overlaps the polygon with
//! positive area. Every zone yields one [`ZonalRecord`] per time step with
//! one value per requested reducer/band pair.
//!
//! Each chunk is folded into accumulators keyed by zone, time step and
//! spatial chunk; `finish` merges them in chunk order. Positional reducers
//! (`first`, `last`, `which_min`, `which_max`) use the cell index `y * nx + x`.

use crate::core::error::SinkError;
use crate::core::reducer::{Accumulator, Reducer};
use crate::core::srs::CoordTransformer;
use crate::core::types::ChunkData;
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{Cube, ReducerBand};
use crate::execution::engine::ChunkSelection;
use crate::sinks::ChunkSink;
use geo::{Area, BooleanOps, BoundingRect, Coord, Intersects, MapCoords, Polygon, Rect};
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

/// Statistics of one zone at one time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonalRecord {
    pub zone: String,
    pub time: String,
    /// `{band}_{reducer}` to value; `None` where the zone has no valid cells.
    pub values: IndexMap<String, Option<f64>>,
}

/// Cells of one zone, as linear `y * nx + x` indices in ascending order.
type ZoneCells = Vec<usize>;

/// Partial statistics of `(zone, t, chunk y, chunk x)`.
type PartialKey = (usize, usize, usize, usize);

#[derive(Debug)]
struct ZonalState {
    view: CubeView,
    nodata: f64,
    /// Reducer and input band per output column.
    stats: Vec<(Reducer, usize)>,
    names: Vec<String>,
    zones: Vec<ZoneCells>,
    /// One accumulator per statistic.
    partials: BTreeMap<PartialKey, Vec<Accumulator>>,
}

/// Sink computing reducers over polygon zones.
#[derive(Debug)]
pub struct ZonalStatistics {
    zones: Vec<(String, Polygon<f64>)>,
    srs: Option<String>,
    stats: Vec<ReducerBand>,
    state: Option<ZonalState>,
    records: Vec<ZonalRecord>,
}

impl ZonalStatistics {
    /// Sink computing `stats` for zones added with [`Self::with_zone`].
    pub fn new(stats: Vec<ReducerBand>) -> Self {
        Self {
            zones: Vec::new(),
            srs: None,
            stats,
            state: None,
            records: Vec::new(),
        }
    }

    pub fn with_zone(mut self, id: impl Into<String>, polygon: Polygon<f64>) -> Self {
        self.zones.push((id.into(), polygon));
        self
    }

    /// SRS of the zone polygons; without it they are taken to be in the cube's SRS.
    pub fn with_srs(mut self, srs: impl Into<String>) -> Self {
        self.srs = Some(srs.into());
        self
    }

    /// Records computed by the last evaluation, by zone then time.
    pub fn records(&self) -> &[ZonalRecord] {
        &self.records
    }

    /// Chunks holding at least one zone cell.
    pub fn chunk_selection(&self, view: &CubeView) -> Result<ChunkSelection, SinkError> {
        let zones = self.zone_cells(view)?;
        let [ct, cy, cx] = view.chunk_count();
        let nx = view.nx();
        let mut spatial = BTreeSet::new();
        for zone in &zones {
            for &cell in zone {
                let (y, x) = (cell / nx, cell % nx);
                spatial.insert((y / view.chunk.y, x / view.chunk.x));
            }
        }
        let mut ids = Vec::with_capacity(spatial.len() * ct);
        for t in 0..ct {
            for &(y, x) in &spatial {
                if y < cy && x < cx {
                    ids.push(view.chunk_id([t, y, x]));
                }
            }
        }
        Ok(ChunkSelection::Only(ids))
    }

    fn zone_cells(&self, view: &CubeView) -> Result<Vec<ZoneCells>, SinkError> {
        let transformer = match &self.srs {
            Some(srs) => Some(
                CoordTransformer::new(srs, &view.srs)
                    .map_err(|e| SinkError::InvalidInput(e.to_string()))?,
            ),
            None => None,
        };
        let mut zones = Vec::with_capacity(self.zones.len());
        for (id, polygon) in &self.zones {
            let polygon = match &transformer {
                Some(t) if !t.is_identity() => polygon
                    .try_map_coords(|c| {
                        t.transform(c.x, c.y).map(|(x, y)| Coord { x, y })
                    })
                    .map_err(|e| SinkError::InvalidInput(format!("zone '{}': {}", id, e)))?,
                _ => polygon.clone(),
            };
            let cells = covered_cells(view, &polygon);
            debug!("Zone '{}' covers {} cells", id, cells.len());
            zones.push(cells);
        }
        Ok(zones)
    }

    /// Render the records as CSV with a `zone,time,...` header.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("zone,time");
        let names: Vec<&String> = self
            .records
            .first()
            .map(|r| r.values.keys().collect())
            .unwrap_or_default();
        for name in &names {
            let _ = write!(out, ",{}", csv_field(name));
        }
        out.push('\n');
        for record in &self.records {
            let _ = write!(out, "{},{}", csv_field(&record.zone), record.time);
            for value in record.values.values() {
                match value {
                    Some(v) => {
                        let _ = write!(out, ",{}", v);
                    }
                    None => out.push(','),
                }
            }
            out.push('\n');
        }
        out
    }

    /// Write [`Self::to_csv`] to `path`.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), SinkError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_csv()).map_err(|source| SinkError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn csv_field(text: &str) -> String {
    if text.contains(|c: char| matches!(c, ',' | '"' | '\n')) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Cells of `view` whose footprint overlaps `polygon` with positive area.
fn covered_cells(view: &CubeView, polygon: &Polygon<f64>) -> Vec<usize> {
    let Some(bounds) = polygon.bounding_rect() else {
        return Vec::new();
    };
    let space = &view.space;
    let (nx, ny) = (view.nx(), view.ny());
    let col_range = |lo: f64, hi: f64| {
        let a = ((lo - space.left) / view.dx).floor().max(0.0) as usize;
        let b = (((hi - space.left) / view.dx).ceil().max(0.0) as usize).min(nx);
        a..b
    };
    let row_range = |lo: f64, hi: f64| {
        let a = ((space.top - hi) / view.dy).floor().max(0.0) as usize;
        let b = (((space.top - lo) / view.dy).ceil().max(0.0) as usize).min(ny);
        a..b
    };
    let mut cells = Vec::new();
    for row in row_range(bounds.min().y, bounds.max().y) {
        for col in col_range(bounds.min().x, bounds.max().x) {
            let left = space.left + col as f64 * view.dx;
            let top = space.top - row as f64 * view.dy;
            let cell = Rect::new(
                Coord { x: left, y: top - view.dy },
                Coord { x: left + view.dx, y: top },
            );
            if !polygon.intersects(&cell) {
                continue;
            }
            if polygon.intersection(&cell.to_polygon()).unsigned_area() > 0.0 {
                cells.push(row * nx + col);
            }
        }
    }
    cells
}

impl ChunkSink for ZonalStatistics {
    fn begin(&mut self, cube: &dyn Cube) -> Result<(), SinkError> {
        let view = cube.view().clone();
        let input = cube.bands();
        let mut stats = Vec::with_capacity(self.stats.len());
        let mut names = Vec::with_capacity(self.stats.len());
        for pair in &self.stats {
            let band = input
                .index_of(&pair.band)
                .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
            stats.push((pair.reducer, band));
            names.push(format!("{}_{}", pair.band, pair.reducer));
        }
        if stats.is_empty() {
            return Err(SinkError::InvalidInput("no zonal statistics requested".to_string()));
        }

        let zones = self.zone_cells(&view)?;
        self.records.clear();
        self.state = Some(ZonalState {
            view,
            nodata: cube.nodata(),
            stats,
            names,
            zones,
            partials: BTreeMap::new(),
        });
        Ok(())
    }

    fn consume(&mut self, id: ChunkId, chunk: ChunkData) -> Result<(), SinkError> {
        let state = self.state.as_mut().ok_or(SinkError::NotStarted)?;
        let region = state
            .view
            .chunk_region(id)
            .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
        let [_, cy, cx] = region.coords;
        let [ot, oy, ox] = region.offset;
        let [st, sy, sx] = region.size;
        let nx = state.view.nx();
        for (z, zone) in state.zones.iter().enumerate() {
            let lo = zone.partition_point(|&c| c < oy * nx);
            let hi = zone.partition_point(|&c| c < (oy + sy) * nx);
            let inside: Vec<usize> = zone[lo..hi]
                .iter()
                .copied()
                .filter(|&c| (ox..ox + sx).contains(&(c % nx)))
                .collect();
            if inside.is_empty() {
                continue;
            }
            for t in 0..st {
                let mut accumulators: Vec<Accumulator> =
                    state.stats.iter().map(|(r, _)| r.accumulator()).collect();
                for (acc, &(_, band)) in accumulators.iter_mut().zip(&state.stats) {
                    for &cell in &inside {
                        let value = chunk.get(band, t, cell / nx - oy, cell % nx - ox);
                        acc.push(value, cell, state.nodata);
                    }
                }
                state.partials.insert((z, ot + t, cy, cx), accumulators);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let state = self.state.as_mut().ok_or(SinkError::NotStarted)?;
        let labels = state.view.time_labels();
        let nt = labels.len();

        let mut merged: Vec<Option<Vec<Accumulator>>> = vec![None; state.zones.len() * nt];
        for ((z, t, _, _), partial) in std::mem::take(&mut state.partials) {
            match &mut merged[z * nt + t] {
                Some(total) => {
                    for (acc, part) in total.iter_mut().zip(partial) {
                        acc.merge(part);
                    }
                }
                slot => *slot = Some(partial),
            }
        }

        let mut records = Vec::with_capacity(self.zones.len() * nt);
        for (z, (zone_id, _)) in self.zones.iter().enumerate() {
            for (t, label) in labels.iter().enumerate() {
                let values = match merged[z * nt + t].take() {
                    Some(accumulators) => state
                        .names
                        .iter()
                        .cloned()
                        .zip(accumulators.into_iter().map(Accumulator::finish))
                        .collect(),
                    None => state.names.iter().map(|n| (n.clone(), None)).collect(),
                };
                records.push(ZonalRecord {
                    zone: zone_id.clone(),
                    time: label.clone(),
                    values,
                });
            }
        }
        info!(
            "Computed zonal statistics for {} zones over {} time steps",
            self.zones.len(),
            nt
        );
        self.records = records;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubes::testing::{grid_cube, small_view};
    use crate::execution::config::{Engine, EngineConfig};
    use geo::polygon;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0)]
    }

    fn run(sink: &mut ZonalStatistics, cube: &dyn Cube) {
        sink.begin(cube).unwrap();
        let ids: Vec<_> = cube.view().chunks().collect();
        for id in ids.into_iter().rev() {
            sink.consume(id, cube.read_chunk(id).unwrap()).unwrap();
        }
        sink.finish().unwrap();
    }

    fn stats() -> Vec<ReducerBand> {
        vec![
            ReducerBand::new(Reducer::Mean, "B1"),
            ReducerBand::new(Reducer::Count, "B1"),
            ReducerBand::new(Reducer::Min, "B2"),
        ]
    }

    #[test]
    fn test_covered_cells() {
        let view = small_view();
        // Edges on cell borders: the two top rows of the two left columns.
        assert_eq!(covered_cells(&view, &square(0.0, 1.0, 2.0, 3.0)), vec![0, 1, 4, 5]);
        // Inside the bottom row, over columns 2 and 3.
        assert_eq!(covered_cells(&view, &square(2.5, 0.2, 3.5, 0.8)), vec![10, 11]);
        assert!(covered_cells(&view, &square(10.0, 10.0, 12.0, 12.0)).is_empty());
    }

    #[test]
    fn test_zonal_records() {
        let cube = grid_cube(&small_view(), &["B1", "B2"], |b, t, y, x| {
            (b * 1000 + t * 100 + y * 10 + x) as f64
        });
        let mut sink = ZonalStatistics::new(stats())
            .with_zone("north", square(0.0, 1.0, 2.0, 3.0))
            .with_zone("south", square(2.5, 0.2, 3.5, 0.8))
            .with_zone("outside", square(10.0, 10.0, 12.0, 12.0));
        run(&mut sink, cube.as_ref());

        let records = sink.records();
        assert_eq!(records.len(), 18);
        let north = &records[2];
        assert_eq!(north.zone, "north");
        assert_eq!(north.time, "2020-01-03");
        assert_eq!(north.values["B1_mean"], Some(205.5));
        assert_eq!(north.values["B1_count"], Some(4.0));
        assert_eq!(north.values["B2_min"], Some(1200.0));

        let south = &records[6];
        assert_eq!(south.zone, "south");
        assert_eq!(south.values["B1_mean"], Some(22.5));

        let outside = &records[12];
        assert!(outside.values.values().all(|v| v.is_none()));
    }

    #[test]
    fn test_reprojected_zone() {
        let cube = grid_cube(&small_view(), &["B1"], |_, _, y, x| (y * 10 + x) as f64);
        let back = CoordTransformer::new("EPSG:3857", "EPSG:4326").unwrap();
        let (x0, y0) = back.transform(0.25, 2.25).unwrap();
        let (x1, y1) = back.transform(1.75, 2.75).unwrap();
        let mut sink = ZonalStatistics::new(vec![ReducerBand::new(Reducer::Sum, "B1")])
            .with_srs("EPSG:4326")
            .with_zone("z", square(x0, y0, x1, y1));
        run(&mut sink, cube.as_ref());
        assert_eq!(sink.records()[0].values["B1_sum"], Some(1.0));
    }

    #[test]
    fn test_chunk_selection() {
        let view = small_view();
        let sink = ZonalStatistics::new(stats()).with_zone("z", square(2.5, 0.2, 3.5, 0.8));
        // Cells (2, 2) and (2, 3) lie in spatial chunks (1, 0) and (1, 1).
        match sink.chunk_selection(&view).unwrap() {
            ChunkSelection::Only(ids) => {
                assert_eq!(ids, vec![ChunkId(2), ChunkId(3), ChunkId(6), ChunkId(7)]);
            }
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn test_csv() {
        let cube = grid_cube(&small_view(), &["B1", "B2"], |_, t, _, _| t as f64);
        let mut sink = ZonalStatistics::new(vec![ReducerBand::new(Reducer::Max, "B2")])
            .with_zone("a,b", square(0.0, 0.0, 4.0, 3.0))
            .with_zone("empty", square(-5.0, -5.0, -4.0, -4.0));
        run(&mut sink, cube.as_ref());

        let csv = sink.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "zone,time,B2_max");
        assert_eq!(lines[1], "\"a,b\",2020-01-01,0");
        assert_eq!(lines[6], "\"a,b\",2020-01-06,5");
        assert_eq!(lines[7], "empty,2020-01-01,");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zonal.csv");
        sink.write_csv(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), csv);
    }

    #[test]
    fn test_records_independent_of_threads() {
        let value = |b: usize, t: usize, y: usize, x: usize| {
            ((b + 1) as f64 * 0.37 + t as f64 * 1.3 + y as f64 * 0.11 + x as f64 * 0.071).sin()
        };
        let cube = grid_cube(&small_view(), &["B1", "B2"], value);
        let stats = vec![
            ReducerBand::new(Reducer::Mean, "B1"),
            ReducerBand::new(Reducer::Sd, "B1"),
            ReducerBand::new(Reducer::Median, "B2"),
            ReducerBand::new(Reducer::First, "B1"),
            ReducerBand::new(Reducer::Last, "B2"),
            ReducerBand::new(Reducer::WhichMax, "B1"),
        ];
        let evaluate = |threads: usize| {
            let engine = Engine::init(EngineConfig::default().with_threads(threads)).unwrap();
            let mut sink = ZonalStatistics::new(stats.clone())
                .with_zone("all", square(0.0, 0.0, 4.0, 3.0))
                .with_zone("inner", square(0.5, 0.5, 3.5, 2.5));
            let selection = sink.chunk_selection(cube.view()).unwrap();
            engine.scheduler().run(&cube, selection, &mut sink).unwrap();
            sink.records().to_vec()
        };

        let single = evaluate(1);
        assert_eq!(single, evaluate(4));
        let all = &single[0];
        assert_eq!(all.values["B1_first"], Some(value(0, 0, 0, 0)));
        assert_eq!(all.values["B2_last"], Some(value(1, 0, 2, 3)));
        let expected: Vec<f64> = (0..12).map(|c| value(0, 0, c / 4, c % 4)).collect();
        let mean = expected.iter().sum::<f64>() / 12.0;
        assert!((all.values["B1_mean"].unwrap() - mean).abs() < 1e-12);
    }

    #[test]
    fn test_partials_do_not_grow_with_cells() {
        let cube = grid_cube(&small_view(), &["B1", "B2"], |_, t, _, _| t as f64);
        let mut sink = ZonalStatistics::new(stats()).with_zone("all", square(0.0, 0.0, 4.0, 3.0));
        sink.begin(cube.as_ref()).unwrap();
        for id in cube.view().chunks() {
            sink.consume(id, cube.read_chunk(id).unwrap()).unwrap();
        }
        let state = sink.state.as_ref().unwrap();
        // 6 time steps × 4 spatial chunks, one accumulator per statistic.
        assert_eq!(state.partials.len(), 24);
        assert!(state.partials.values().all(|accs| accs.len() == 3));
        sink.finish().unwrap();
        assert_eq!(sink.records()[5].values["B1_count"], Some(12.0));
    }

    #[test]
    fn test_unknown_band() {
        let cube = grid_cube(&small_view(), &["B1"], |_, _, _, _| 1.0);
        let mut sink = ZonalStatistics::new(vec![ReducerBand::new(Reducer::Sum, "B9")]);
        assert!(matches!(sink.begin(cube.as_ref()), Err(SinkError::InvalidInput(_))));
    }
}
