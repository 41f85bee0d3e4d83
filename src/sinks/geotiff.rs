//! GeoTIFF output.
//!
//! [`GeoTiffSink`] writes one file per chunk, named
//! `{prefix}_{t}_{y}_{x}.tif` after the chunk coordinates. Every file holds
//! one page per (time step, band), time-major, each carrying the GeoTIFF
//! georeferencing tags and an ImageDescription naming band and time.
//!
//! With [`CogOptions`], `finish` additionally assembles one file per time
//! step, `{prefix}{time_label}.tif`, with a full-resolution page per band
//! followed by reduced-resolution overview pages. The `tiff` encoder writes
//! strips only, so these files are overview pyramids rather than tiled COGs.

use crate::core::error::SinkError;
use crate::core::srs::{epsg_code, is_geographic_srs};
use crate::core::types::{is_nodata, ChunkData};
use crate::core::view::{ChunkId, CubeView, SpatialExtent, TemporalExtent};
use crate::cubes::Cube;
use crate::sinks::ChunkSink;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;

// ============================================================================
// GeoTIFF tags
// ============================================================================

/// GDAL band metadata XML; the other GeoTIFF tags have named `Tag` variants.
const GDAL_METADATA: u16 = 42112;

/// Reduced-resolution page marker for NewSubfileType.
const SUBFILE_REDUCED: u32 = 1;

// ============================================================================
// Packing
// ============================================================================

/// Sample type of written pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackingType {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
    #[serde(rename = "uint8")]
    UInt8,
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "int16")]
    Int16,
    #[serde(rename = "int32")]
    Int32,
}

impl PackingType {
    /// Representable range of integer types.
    pub fn range(&self) -> Option<(f64, f64)> {
        match self {
            PackingType::Float32 | PackingType::Float64 => None,
            PackingType::UInt8 => Some((0.0, u8::MAX as f64)),
            PackingType::UInt16 => Some((0.0, u16::MAX as f64)),
            PackingType::Int16 => Some((i16::MIN as f64, i16::MAX as f64)),
            PackingType::Int32 => Some((i32::MIN as f64, i32::MAX as f64)),
        }
    }

    /// Nodata value used when none is given.
    pub fn default_nodata(&self) -> f64 {
        match self {
            PackingType::Float32 | PackingType::Float64 => f64::NAN,
            PackingType::UInt8 => u8::MAX as f64,
            PackingType::UInt16 => u16::MAX as f64,
            PackingType::Int16 => i16::MIN as f64,
            PackingType::Int32 => i32::MIN as f64,
        }
    }
}

/// Conversion of cell values to stored samples: `stored = (value - offset) / scale`,
/// rounded and clamped for integer types. Nodata cells are stored as `nodata`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Packing {
    pub kind: PackingType,
    pub scale: f64,
    pub offset: f64,
    pub nodata: f64,
}

impl Packing {
    /// Unscaled packing with the type's default nodata.
    pub fn new(kind: PackingType) -> Self {
        Self {
            kind,
            scale: 1.0,
            offset: 0.0,
            nodata: kind.default_nodata(),
        }
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = nodata;
        self
    }

    /// Check that scale and offset are usable and nodata is representable.
    pub fn validate(&self) -> Result<(), SinkError> {
        if !self.scale.is_finite() || self.scale == 0.0 || !self.offset.is_finite() {
            return Err(SinkError::InvalidInput(format!(
                "packing scale {} / offset {} must be finite with non-zero scale",
                self.scale, self.offset
            )));
        }
        if let Some((lo, hi)) = self.kind.range() {
            if self.nodata.fract() != 0.0 || self.nodata < lo || self.nodata > hi {
                return Err(SinkError::InvalidInput(format!(
                    "nodata {} is not representable as {:?}",
                    self.nodata, self.kind
                )));
            }
        }
        Ok(())
    }

    /// Stored sample of a cell value.
    pub fn pack(&self, value: f64, cube_nodata: f64) -> f64 {
        if is_nodata(value, cube_nodata) {
            return self.nodata;
        }
        let scaled = (value - self.offset) / self.scale;
        match self.kind.range() {
            Some((lo, hi)) => scaled.round().clamp(lo, hi),
            None => scaled,
        }
    }

    /// Cell value of a stored sample; NaN for nodata.
    pub fn unpack(&self, stored: f64) -> f64 {
        if is_nodata(stored, self.nodata) {
            return f64::NAN;
        }
        stored * self.scale + self.offset
    }

    fn is_stored_nodata(&self, stored: f64) -> bool {
        is_nodata(stored, self.nodata)
    }
}

// ============================================================================
// Overviews
// ============================================================================

/// Resampling used to build overview pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverviewResampling {
    #[default]
    Nearest,
    Average,
    Min,
    Max,
}

/// Options of the per-time-step overview files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CogOptions {
    pub resampling: OverviewResampling,
    /// Explicit overview factors; empty picks powers of two.
    pub levels: Vec<usize>,
    /// Automatic levels stop once the larger side drops below this many cells.
    pub min_size: usize,
}

impl Default for CogOptions {
    fn default() -> Self {
        Self {
            resampling: OverviewResampling::Nearest,
            levels: Vec::new(),
            min_size: 256,
        }
    }
}

impl CogOptions {
    pub fn with_resampling(mut self, resampling: OverviewResampling) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn with_levels(mut self, levels: Vec<usize>) -> Self {
        self.levels = levels;
        self
    }

    /// Overview factors for a `width` × `height` image.
    pub fn overview_factors(&self, width: usize, height: usize) -> Vec<usize> {
        if !self.levels.is_empty() {
            let mut levels: Vec<usize> = self.levels.iter().copied().filter(|&f| f > 1).collect();
            levels.sort_unstable();
            levels.dedup();
            return levels;
        }
        let largest = width.max(height);
        let mut factors = Vec::new();
        let mut factor = 2;
        while largest.div_ceil(factor) >= self.min_size.max(1) {
            factors.push(factor);
            factor *= 2;
        }
        factors
    }
}

/// Downsample a row-major `width` × `height` raster by `factor`.
fn downsample(
    values: &[f64],
    width: usize,
    height: usize,
    factor: usize,
    resampling: OverviewResampling,
    packing: &Packing,
) -> Vec<f64> {
    let out_w = width.div_ceil(factor);
    let out_h = height.div_ceil(factor);
    let integer = packing.kind.range().is_some();
    let mut out = Vec::with_capacity(out_w * out_h);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let (y0, x0) = (oy * factor, ox * factor);
            if resampling == OverviewResampling::Nearest {
                out.push(values[y0 * width + x0]);
                continue;
            }
            let block = (y0..(y0 + factor).min(height))
                .flat_map(|y| (x0..(x0 + factor).min(width)).map(move |x| y * width + x))
                .map(|i| values[i])
                .filter(|&v| !packing.is_stored_nodata(v));
            let (mut n, mut sum, mut min, mut max) = (0usize, 0.0, f64::INFINITY, f64::NEG_INFINITY);
            for v in block {
                n += 1;
                sum += v;
                min = min.min(v);
                max = max.max(v);
            }
            let value = match (n, resampling) {
                (0, _) => packing.nodata,
                (_, OverviewResampling::Min) => min,
                (_, OverviewResampling::Max) => max,
                _ if integer => (sum / n as f64).round(),
                _ => sum / n as f64,
            };
            out.push(value);
        }
    }
    out
}

// ============================================================================
// Page encoding
// ============================================================================

/// Metadata written with every page.
struct PageTags<'a> {
    extent: SpatialExtent,
    dx: f64,
    dy: f64,
    srs: &'a str,
    description: String,
    band: &'a str,
    reduced: bool,
}

fn tiff_error(e: impl std::fmt::Display) -> SinkError {
    SinkError::Tiff(e.to_string())
}

fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn geo_keys(srs: &str) -> Vec<u16> {
    let geographic = is_geographic_srs(srs);
    let mut keys: Vec<u16> = vec![1, 1, 0, 0];
    // GTModelTypeGeoKey, GTRasterTypeGeoKey = PixelIsArea
    keys.extend_from_slice(&[1024, 0, 1, if geographic { 2 } else { 1 }]);
    keys.extend_from_slice(&[1025, 0, 1, 1]);
    if let Some(code) = epsg_code(srs).and_then(|c| u16::try_from(c).ok()) {
        let key = if geographic { 2048 } else { 3072 };
        keys.extend_from_slice(&[key, 0, 1, code]);
    }
    keys[3] = (keys.len() / 4 - 1) as u16;
    keys
}

fn write_typed<W, C>(
    encoder: &mut TiffEncoder<W>,
    width: usize,
    height: usize,
    data: &[C::Inner],
    tags: &PageTags<'_>,
    packing: &Packing,
) -> Result<(), SinkError>
where
    W: Write + Seek,
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let mut image = encoder
        .new_image::<C>(width as u32, height as u32)
        .map_err(tiff_error)?;
    let dir = image.encoder();
    if tags.reduced {
        dir.write_tag(Tag::NewSubfileType, SUBFILE_REDUCED)
            .map_err(tiff_error)?;
    }
    dir.write_tag(Tag::ImageDescription, tags.description.as_str())
        .map_err(tiff_error)?;
    dir.write_tag(Tag::ModelPixelScaleTag, &[tags.dx, tags.dy, 0.0][..])
        .map_err(tiff_error)?;
    dir.write_tag(
        Tag::ModelTiepointTag,
        &[0.0, 0.0, 0.0, tags.extent.left, tags.extent.top, 0.0][..],
    )
    .map_err(tiff_error)?;
    dir.write_tag(Tag::GeoKeyDirectoryTag, geo_keys(tags.srs).as_slice())
        .map_err(tiff_error)?;
    dir.write_tag(Tag::GdalNodata, format!("{}", packing.nodata).as_str())
        .map_err(tiff_error)?;
    let metadata = format!(
        "<GDALMetadata><Item name=\"DESCRIPTION\" sample=\"0\" role=\"description\">{}</Item>\
         <Item name=\"SCALE\" sample=\"0\" role=\"scale\">{}</Item>\
         <Item name=\"OFFSET\" sample=\"0\" role=\"offset\">{}</Item></GDALMetadata>",
        tags.band, packing.scale, packing.offset
    );
    dir.write_tag(Tag::Unknown(GDAL_METADATA), metadata.as_str())
        .map_err(tiff_error)?;
    image.write_data(data).map_err(tiff_error)
}

/// Write one page of already packed samples.
fn write_page<W: Write + Seek>(
    encoder: &mut TiffEncoder<W>,
    width: usize,
    height: usize,
    samples: &[f64],
    tags: &PageTags<'_>,
    packing: &Packing,
) -> Result<(), SinkError> {
    match packing.kind {
        PackingType::Float64 => {
            write_typed::<_, colortype::Gray64Float>(encoder, width, height, samples, tags, packing)
        }
        PackingType::Float32 => {
            let data: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
            write_typed::<_, colortype::Gray32Float>(encoder, width, height, &data, tags, packing)
        }
        PackingType::UInt8 => {
            let data: Vec<u8> = samples.iter().map(|&v| v as u8).collect();
            write_typed::<_, colortype::Gray8>(encoder, width, height, &data, tags, packing)
        }
        PackingType::UInt16 => {
            let data: Vec<u16> = samples.iter().map(|&v| v as u16).collect();
            write_typed::<_, colortype::Gray16>(encoder, width, height, &data, tags, packing)
        }
        PackingType::Int16 => {
            let data: Vec<i16> = samples.iter().map(|&v| v as i16).collect();
            write_typed::<_, colortype::GrayI16>(encoder, width, height, &data, tags, packing)
        }
        PackingType::Int32 => {
            let data: Vec<i32> = samples.iter().map(|&v| v as i32).collect();
            write_typed::<_, colortype::GrayI32>(encoder, width, height, &data, tags, packing)
        }
    }
}

fn decoded_samples(result: DecodingResult) -> Result<Vec<f64>, SinkError> {
    let samples = match result {
        DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F64(buf) => buf,
        _ => return Err(SinkError::Tiff("unexpected sample type".to_string())),
    };
    Ok(samples)
}

/// Stored samples of every page of a TIFF file.
pub fn read_pages(path: &Path) -> Result<Vec<Vec<f64>>, SinkError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(tiff_error)?;
    let mut pages = Vec::new();
    loop {
        pages.push(decoded_samples(decoder.read_image().map_err(tiff_error)?)?);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(tiff_error)?;
    }
    Ok(pages)
}

// ============================================================================
// Sink
// ============================================================================

#[derive(Debug, Serialize)]
struct ChunkBounds {
    file: String,
    extent: SpatialExtent,
    time: TemporalExtent,
}

/// Content of `{prefix}_bounds.json`.
#[derive(Debug, Serialize)]
struct BoundsSidecar {
    srs: String,
    extent: SpatialExtent,
    time: TemporalExtent,
    bands: Vec<String>,
    chunks: Vec<ChunkBounds>,
}

#[derive(Debug)]
struct Layout {
    view: CubeView,
    bands: Vec<String>,
    nodata: f64,
    packing: Packing,
    labels: Vec<String>,
    written: BTreeSet<ChunkId>,
}

/// Writes chunks as GeoTIFF files.
#[derive(Debug)]
pub struct GeoTiffSink {
    dir: PathBuf,
    prefix: String,
    packing: Option<Packing>,
    bounds_sidecar: bool,
    cog: Option<CogOptions>,
    layout: Option<Layout>,
}

impl GeoTiffSink {
    /// Sink writing into `dir`, which is created on `begin`.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            packing: None,
            bounds_sidecar: false,
            cog: None,
            layout: None,
        }
    }

    /// Pack samples; without packing, values are written as float64 with
    /// the cube's nodata.
    pub fn with_packing(mut self, packing: Packing) -> Self {
        self.packing = Some(packing);
        self
    }

    /// Also write `{prefix}_bounds.json`.
    pub fn with_bounds_sidecar(mut self, enabled: bool) -> Self {
        self.bounds_sidecar = enabled;
        self
    }

    /// Also write per-time-step overview files.
    pub fn with_cog(mut self, options: CogOptions) -> Self {
        self.cog = Some(options);
        self
    }

    /// File of the chunk at chunk coordinates `[t, y, x]`.
    pub fn chunk_path(&self, coords: [usize; 3]) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}_{}.tif",
            self.prefix, coords[0], coords[1], coords[2]
        ))
    }

    /// Overview file of the time step labelled `label`.
    pub fn cog_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}{}.tif", self.prefix, label))
    }

    pub fn bounds_path(&self) -> PathBuf {
        self.dir.join(format!("{}_bounds.json", self.prefix))
    }

    /// Chunk files written so far, in chunk id order.
    pub fn written_files(&self) -> Vec<PathBuf> {
        let Some(layout) = &self.layout else {
            return Vec::new();
        };
        layout
            .written
            .iter()
            .filter_map(|id| layout.view.chunk_coords(*id).ok())
            .map(|coords| self.chunk_path(coords))
            .collect()
    }

    fn write_chunk(&self, layout: &Layout, id: ChunkId, chunk: &ChunkData) -> Result<PathBuf, SinkError> {
        let region = layout
            .view
            .chunk_region(id)
            .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
        let [st, sy, sx] = region.size;
        let nb = layout.bands.len();
        if chunk.shape() != [nb, st, sy, sx] {
            return Err(SinkError::InvalidInput(format!(
                "chunk {} has shape {:?}, expected {:?}",
                id,
                chunk.shape(),
                [nb, st, sy, sx]
            )));
        }

        let path = self.chunk_path(region.coords);
        let file = File::create(&path).map_err(|e| io_error(&path, e))?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_error)?;
        let extent = layout.view.region_extent(&region);
        let cells = sy * sx;
        for t in 0..st {
            let label = &layout.labels[region.offset[0] + t];
            for (b, band) in layout.bands.iter().enumerate() {
                let values = &chunk.band(b)[t * cells..(t + 1) * cells];
                let samples: Vec<f64> = values
                    .iter()
                    .map(|&v| layout.packing.pack(v, layout.nodata))
                    .collect();
                let tags = PageTags {
                    extent,
                    dx: layout.view.dx,
                    dy: layout.view.dy,
                    srs: &layout.view.srs,
                    description: format!("band={} time={}", band, label),
                    band,
                    reduced: false,
                };
                write_page(&mut encoder, sx, sy, &samples, &tags, &layout.packing)?;
            }
        }
        Ok(path)
    }

    fn write_bounds(&self, layout: &Layout) -> Result<(), SinkError> {
        let view = &layout.view;
        let mut chunks = Vec::with_capacity(layout.written.len());
        for id in &layout.written {
            let region = view
                .chunk_region(*id)
                .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
            chunks.push(ChunkBounds {
                file: format!(
                    "{}_{}_{}_{}.tif",
                    self.prefix, region.coords[0], region.coords[1], region.coords[2]
                ),
                extent: view.region_extent(&region),
                time: view.region_time(&region),
            });
        }
        let sidecar = BoundsSidecar {
            srs: view.srs.clone(),
            extent: view.space,
            time: TemporalExtent::new(view.time_at(0), view.time_at(view.nt())),
            bands: layout.bands.clone(),
            chunks,
        };
        let path = self.bounds_path();
        let json = serde_json::to_string_pretty(&sidecar)
            .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| io_error(&path, e))
    }

    /// Stitch time step `t` of every band from the chunk files.
    fn assemble_time_step(&self, layout: &Layout, t: usize) -> Result<Vec<Vec<f64>>, SinkError> {
        let view = &layout.view;
        let [_, ny, nx] = view.shape();
        let nb = layout.bands.len();
        let mut rasters = vec![vec![layout.packing.nodata; ny * nx]; nb];
        for id in &layout.written {
            let region = view
                .chunk_region(*id)
                .map_err(|e| SinkError::InvalidInput(e.to_string()))?;
            let [ot, oy, ox] = region.offset;
            let [st, sy, sx] = region.size;
            if t < ot || t >= ot + st {
                continue;
            }
            let path = self.chunk_path(region.coords);
            let pages = read_pages(&path)?;
            for (b, raster) in rasters.iter_mut().enumerate() {
                let page = pages.get((t - ot) * nb + b).ok_or_else(|| {
                    SinkError::InvalidInput(format!("{} has too few pages", path.display()))
                })?;
                for y in 0..sy {
                    let dst = (oy + y) * nx + ox;
                    raster[dst..dst + sx].copy_from_slice(&page[y * sx..(y + 1) * sx]);
                }
            }
        }
        Ok(rasters)
    }

    fn write_overview_files(&self, layout: &Layout, options: &CogOptions) -> Result<(), SinkError> {
        let view = &layout.view;
        let [nt, ny, nx] = view.shape();
        let factors = options.overview_factors(nx, ny);
        for t in 0..nt {
            let rasters = self.assemble_time_step(layout, t)?;
            let label = &layout.labels[t];
            let path = self.cog_path(label);
            let file = File::create(&path).map_err(|e| io_error(&path, e))?;
            let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_error)?;
            for (band, raster) in layout.bands.iter().zip(&rasters) {
                let tags = PageTags {
                    extent: view.space,
                    dx: view.dx,
                    dy: view.dy,
                    srs: &view.srs,
                    description: format!("band={} time={}", band, label),
                    band,
                    reduced: false,
                };
                write_page(&mut encoder, nx, ny, raster, &tags, &layout.packing)?;
            }
            for &factor in &factors {
                for (band, raster) in layout.bands.iter().zip(&rasters) {
                    let samples = downsample(raster, nx, ny, factor, options.resampling, &layout.packing);
                    let tags = PageTags {
                        extent: view.space,
                        dx: view.dx * factor as f64,
                        dy: view.dy * factor as f64,
                        srs: &view.srs,
                        description: format!("band={} time={} overview={}", band, label, factor),
                        band,
                        reduced: true,
                    };
                    write_page(
                        &mut encoder,
                        nx.div_ceil(factor),
                        ny.div_ceil(factor),
                        &samples,
                        &tags,
                        &layout.packing,
                    )?;
                }
            }
            debug!("Wrote {} with {} overview levels", path.display(), factors.len());
        }
        Ok(())
    }
}

impl ChunkSink for GeoTiffSink {
    fn begin(&mut self, cube: &dyn Cube) -> Result<(), SinkError> {
        let packing = self
            .packing
            .unwrap_or_else(|| Packing::new(PackingType::Float64).with_nodata(cube.nodata()));
        packing.validate()?;
        std::fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let view = cube.view().clone();
        self.layout = Some(Layout {
            labels: view.time_labels(),
            view,
            bands: cube.bands().names(),
            nodata: cube.nodata(),
            packing,
            written: BTreeSet::new(),
        });
        Ok(())
    }

    fn consume(&mut self, id: ChunkId, chunk: ChunkData) -> Result<(), SinkError> {
        let layout = self.layout.as_ref().ok_or(SinkError::NotStarted)?;
        let path = self.write_chunk(layout, id, &chunk)?;
        debug!("Wrote chunk {} to {}", id, path.display());
        if let Some(layout) = self.layout.as_mut() {
            layout.written.insert(id);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let layout = self.layout.as_ref().ok_or(SinkError::NotStarted)?;
        if self.bounds_sidecar {
            self.write_bounds(layout)?;
        }
        if let Some(options) = &self.cog {
            self.write_overview_files(layout, options)?;
        }
        info!(
            "Wrote {} GeoTIFF chunk files to {}",
            layout.written.len(),
            self.dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubes::testing::{grid_cube, small_view};

    fn value(b: usize, t: usize, y: usize, x: usize) -> f64 {
        (b * 1000 + t * 100 + y * 10 + x) as f64
    }

    fn write_all(sink: &mut GeoTiffSink, cube: &dyn Cube) {
        sink.begin(cube).unwrap();
        for id in cube.view().chunks() {
            sink.consume(id, cube.read_chunk(id).unwrap()).unwrap();
        }
        sink.finish().unwrap();
    }

    #[test]
    fn test_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let cube = grid_cube(&small_view(), &["B1", "B2"], value);
        let mut sink = GeoTiffSink::new(dir.path(), "out");
        write_all(&mut sink, cube.as_ref());

        let files = sink.written_files();
        assert_eq!(files.len(), 8);
        assert!(files.iter().all(|f| f.exists()));

        // Chunk [0, 0, 0]: 4 time steps × 2 bands of 3 × 2 cells.
        let path = dir.path().join("out_0_0_0.tif");
        let pages = read_pages(&path).unwrap();
        assert_eq!(pages.len(), 8);
        assert_eq!(pages[0], vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        // Page 3 is t = 1, band B2.
        assert_eq!(pages[3][4], value(1, 1, 1, 1));

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (3, 2));
        assert_eq!(
            decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).unwrap(),
            vec![1.0, 1.0, 0.0]
        );
        assert_eq!(
            decoder.get_tag_f64_vec(Tag::ModelTiepointTag).unwrap(),
            vec![0.0, 0.0, 0.0, 0.0, 3.0, 0.0]
        );
        assert_eq!(
            decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).unwrap(),
            geo_keys("EPSG:3857")
        );
        // Raw tag numbers resolve to the same entries.
        assert!(decoder
            .find_tag(Tag::from_u16_exhaustive(33550))
            .unwrap()
            .is_some());
        assert!(decoder
            .find_tag(Tag::Unknown(GDAL_METADATA))
            .unwrap()
            .is_some());
        let description = decoder.get_tag_ascii_string(Tag::ImageDescription).unwrap();
        assert!(description.contains("band=B1"));
        assert!(description.contains("2020-01-01"));

        // The last chunk in y starts at row 2 of 3.
        let mut decoder = Decoder::new(File::open(dir.path().join("out_1_1_1.tif")).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (1, 1));
        assert_eq!(
            decoder.get_tag_f64_vec(Tag::ModelTiepointTag).unwrap(),
            vec![0.0, 0.0, 0.0, 3.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_packing() {
        let packing = Packing::new(PackingType::UInt8).with_scale(0.5, 10.0);
        assert!(packing.validate().is_ok());
        assert_eq!(packing.pack(f64::NAN, f64::NAN), 255.0);
        assert_eq!(packing.pack(-9999.0, -9999.0), 255.0);
        assert_eq!(packing.pack(20.0, f64::NAN), 20.0);
        assert_eq!(packing.pack(0.0, f64::NAN), 0.0);
        assert_eq!(packing.pack(1000.0, f64::NAN), 255.0);
        assert_eq!(packing.unpack(20.0), 20.0);
        assert!(packing.unpack(255.0).is_nan());

        assert!(Packing::new(PackingType::Int16).with_nodata(70000.0).validate().is_err());
        assert!(Packing::new(PackingType::Float32).with_scale(0.0, 0.0).validate().is_err());
        assert!(Packing::new(PackingType::Float32).pack(f64::NAN, -1.0).is_nan());
    }

    #[test]
    fn test_packed_output() {
        let dir = tempfile::tempdir().unwrap();
        let cube = grid_cube(&small_view(), &["B1"], |_, t, y, x| (t * 10 + y * 4 + x) as f64);
        let mut sink = GeoTiffSink::new(dir.path(), "packed")
            .with_packing(Packing::new(PackingType::Int16).with_scale(2.0, 0.0));
        write_all(&mut sink, cube.as_ref());

        let path = dir.path().join("packed_0_0_0.tif");
        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert!(matches!(decoder.read_image().unwrap(), DecodingResult::I16(_)));
        let pages = read_pages(&path).unwrap();
        // t = 1: values 10, 11, 12, 14, 15, 16 halved and rounded half away from zero.
        assert_eq!(pages[1], vec![5.0, 6.0, 6.0, 7.0, 8.0, 8.0]);
    }

    #[test]
    fn test_bounds_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cube = grid_cube(&small_view(), &["B1"], value);
        let mut sink = GeoTiffSink::new(dir.path(), "cube").with_bounds_sidecar(true);
        write_all(&mut sink, cube.as_ref());

        let text = std::fs::read_to_string(sink.bounds_path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["srs"], "EPSG:3857");
        assert_eq!(json["chunks"].as_array().unwrap().len(), 8);
        assert_eq!(json["chunks"][0]["file"], "cube_0_0_0.tif");
        assert_eq!(json["extent"]["top"], 3.0);
    }

    #[test]
    fn test_overview_files() {
        let dir = tempfile::tempdir().unwrap();
        let view = small_view();
        let cube = grid_cube(&view, &["B1", "B2"], value);
        let mut sink = GeoTiffSink::new(dir.path(), "cog_").with_cog(
            CogOptions::default()
                .with_resampling(OverviewResampling::Average)
                .with_levels(vec![2]),
        );
        write_all(&mut sink, cube.as_ref());

        let labels = view.time_labels();
        assert_eq!(labels.len(), 6);
        for label in &labels {
            assert!(sink.cog_path(label).exists());
        }

        let path = sink.cog_path(&labels[2]);
        let pages = read_pages(&path).unwrap();
        // Two full-resolution pages, then one overview page per band.
        assert_eq!(pages.len(), 4);
        let expected: Vec<f64> = (0..3)
            .flat_map(|y| (0..4).map(move |x| value(1, 2, y, x)))
            .collect();
        assert_eq!(pages[1], expected);
        assert_eq!(pages[2].len(), 4);
        assert_eq!(pages[2][0], value(0, 2, 0, 0) + 5.5);
        assert_eq!(pages[2][2], value(0, 2, 2, 0) + 0.5);

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        decoder.next_image().unwrap();
        decoder.next_image().unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (2, 2));
        assert_eq!(
            decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).unwrap(),
            vec![2.0, 2.0, 0.0]
        );
        assert_eq!(decoder.get_tag_u32(Tag::NewSubfileType).unwrap(), SUBFILE_REDUCED);
    }

    #[test]
    fn test_downsample() {
        let packing = Packing::new(PackingType::UInt16).with_nodata(0.0);
        // 3 × 2 raster with one nodata cell.
        let values = [1.0, 0.0, 5.0, 3.0, 4.0, 8.0];
        assert_eq!(
            downsample(&values, 3, 2, 2, OverviewResampling::Average, &packing),
            vec![3.0, 7.0]
        );
        assert_eq!(
            downsample(&values, 3, 2, 2, OverviewResampling::Min, &packing),
            vec![1.0, 5.0]
        );
        assert_eq!(
            downsample(&values, 3, 2, 2, OverviewResampling::Max, &packing),
            vec![4.0, 8.0]
        );
        assert_eq!(
            downsample(&values, 3, 2, 2, OverviewResampling::Nearest, &packing),
            vec![1.0, 5.0]
        );
        assert_eq!(
            downsample(&[0.0, 0.0], 2, 1, 2, OverviewResampling::Max, &packing),
            vec![0.0]
        );
    }

    #[test]
    fn test_overview_factors() {
        let options = CogOptions::default();
        assert!(options.overview_factors(100, 80).is_empty());
        assert_eq!(options.overview_factors(1024, 300), vec![2, 4]);
        let explicit = CogOptions::default().with_levels(vec![4, 1, 2, 4]);
        assert_eq!(explicit.overview_factors(10, 10), vec![2, 4]);
    }

    #[test]
    fn test_geo_keys() {
        let keys = geo_keys("EPSG:32632");
        assert_eq!(keys[3], 3);
        assert_eq!(&keys[4..8], &[1024, 0, 1, 1]);
        assert_eq!(&keys[12..16], &[3072, 0, 1, 32632]);
        let keys = geo_keys("EPSG:4326");
        assert_eq!(&keys[12..16], &[2048, 0, 1, 4326]);
    }

    #[test]
    fn test_requires_begin() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = GeoTiffSink::new(dir.path(), "x");
        assert!(matches!(
            sink.consume(ChunkId(0), ChunkData::nodata([1, 1, 1, 1], f64::NAN)),
            Err(SinkError::NotStarted)
        ));
        assert!(matches!(sink.finish(), Err(SinkError::NotStarted)));
    }
}
