//! Moving windows along the time axis.
//!
//! A window covers `before` steps before and `after` steps after each output
//! time step. Windows are truncated at both ends of the time axis, never
//! padded. Kernel weights are renormalized over the samples actually used:
//! with `S_full` the sum of all weights and `S_used` the sum of weights of
//! valid samples inside the axis, an incomplete window yields
//! `Σ w·x · S_full / S_used`. An incomplete window with `S_used == 0` or a
//! zero-sum kernel yields nodata.

use crate::core::error::{ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::reducer::Reducer;
use crate::core::types::{is_nodata, BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView};
use crate::cubes::{read_time_range, resolve_reducers, Cube, CubeRef, ReducerBand};
use crate::graph::serialization::CubeSpec;

const WEIGHT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone)]
enum WindowOp {
    Reduce(Vec<(Reducer, usize)>),
    Kernel(Vec<f64>),
}

/// Moving-window reducer or convolution kernel over time.
#[derive(Debug)]
pub struct WindowTimeCube {
    id: CubeId,
    input: CubeRef,
    op: WindowOp,
    before: usize,
    after: usize,
    bands: BandCollection,
}

impl WindowTimeCube {
    /// Apply reducers over a window of `before` / `after` steps.
    ///
    /// Output bands are named `{band}_{reducer}`.
    pub fn reduce(
        input: CubeRef,
        pairs: &[ReducerBand],
        before: usize,
        after: usize,
    ) -> ConstructionResult<Self> {
        let (pairs, bands) = resolve_reducers(input.bands(), pairs, false)?;
        Ok(Self {
            id: CubeId::new(),
            input,
            op: WindowOp::Reduce(pairs),
            before,
            after,
            bands,
        })
    }

    /// Convolve every band with `kernel`, centred on the output step.
    ///
    /// For even lengths the extra weight lies before the output step.
    pub fn kernel(input: CubeRef, kernel: Vec<f64>) -> ConstructionResult<Self> {
        let before = kernel.len() / 2;
        let after = kernel.len().saturating_sub(before + 1);
        Self::kernel_with_window(input, kernel, before, after)
    }

    /// Convolve every band with `kernel` over an explicit window.
    pub fn kernel_with_window(
        input: CubeRef,
        kernel: Vec<f64>,
        before: usize,
        after: usize,
    ) -> ConstructionResult<Self> {
        if kernel.is_empty() {
            return Err(ConstructionError::InvalidWindow {
                reason: "kernel is empty".to_string(),
            });
        }
        if kernel.len() != before + after + 1 {
            return Err(ConstructionError::InvalidWindow {
                reason: format!(
                    "kernel of length {} does not match window ({}, {})",
                    kernel.len(),
                    before,
                    after
                ),
            });
        }
        if kernel.iter().any(|w| !w.is_finite()) {
            return Err(ConstructionError::InvalidWindow {
                reason: "kernel weights must be finite".to_string(),
            });
        }
        let bands = input.bands().clone();
        Ok(Self {
            id: CubeId::new(),
            input,
            op: WindowOp::Kernel(kernel),
            before,
            after,
            bands,
        })
    }

    fn convolve(&self, kernel: &[f64], series: &[f64], window_start: isize, nodata: f64) -> f64 {
        let full: f64 = kernel.iter().sum();
        let mut sum = 0.0;
        let mut used = 0.0;
        let mut complete = true;
        for (k, &w) in kernel.iter().enumerate() {
            let s = window_start + k as isize;
            if s < 0 || s as usize >= series.len() {
                complete = false;
                continue;
            }
            let v = series[s as usize];
            if is_nodata(v, nodata) {
                complete = false;
                continue;
            }
            sum += w * v;
            used += w;
        }
        if complete {
            return sum;
        }
        if used.abs() < WEIGHT_EPSILON || full.abs() < WEIGHT_EPSILON {
            return nodata;
        }
        sum * full / used
    }
}

impl Cube for WindowTimeCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "window_time"
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
        let view = self.input.view();
        let region = view.chunk_region(id)?;
        let [_, cy, cx] = region.coords;
        let [st, sy, sx] = region.size;
        let nt = view.nt();
        let lo = region.offset[0].saturating_sub(self.before);
        let hi = (region.end()[0] + self.after).min(nt);
        let slab = read_time_range(self.input.as_ref(), cy, cx, lo, hi)?;
        let nodata = self.nodata();
        let cells = sy * sx;
        let span = hi - lo;

        let mut out = ChunkData::nodata([self.bands.len(), st, sy, sx], nodata);
        let mut series = vec![0.0; span];
        match &self.op {
            WindowOp::Reduce(pairs) => {
                for (p, (reducer, band)) in pairs.iter().enumerate() {
                    let values = slab.band(*band);
                    let dst = out.band_mut(p);
                    for cell in 0..cells {
                        for (s, v) in series.iter_mut().enumerate() {
                            *v = values[s * cells + cell];
                        }
                        for t in 0..st {
                            // Window bounds relative to the slab.
                            let centre = region.offset[0] + t - lo;
                            let first = centre.saturating_sub(self.before);
                            let last = (centre + self.after + 1).min(span);
                            let result = reducer.reduce(series[first..last].iter().copied(), nodata);
                            dst[t * cells + cell] = result.unwrap_or(nodata);
                        }
                    }
                }
            }
            WindowOp::Kernel(kernel) => {
                for b in 0..self.bands.len() {
                    let values = slab.band(b);
                    let dst = out.band_mut(b);
                    for cell in 0..cells {
                        for (s, v) in series.iter_mut().enumerate() {
                            *v = values[s * cells + cell];
                        }
                        for t in 0..st {
                            let centre = (region.offset[0] + t - lo) as isize;
                            let start = centre - self.before as isize;
                            dst[t * cells + cell] = self.convolve(kernel, &series, start, nodata);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn to_spec(&self) -> CubeSpec {
        let input = Box::new(self.input.to_spec());
        let window = [self.before, self.after];
        match &self.op {
            WindowOp::Reduce(pairs) => {
                let names = self.input.bands().names();
                CubeSpec::WindowTime {
                    input,
                    reducers: pairs
                        .iter()
                        .map(|(r, b)| ReducerBand::new(*r, names[*b].clone()))
                        .collect(),
                    window,
                }
            }
            WindowOp::Kernel(kernel) => CubeSpec::WindowKernel {
                input,
                kernel: kernel.clone(),
                window,
            },
        }
    }
}
