//! Leaf cube reading from an image collection.
//!
//! The catalog itself is an external collaborator behind the
//! [`ImageCollection`] trait: it finds the images intersecting a space-time
//! box and reads a band window of one image. This module turns those windows
//! into chunks: it resamples every window onto the chunk grid (reprojecting
//! cell centres when the SRS differs), stacks images by time step, and
//! resolves images that overlap in the same time step with an
//! [`OverlapPolicy`]. Cells without coverage stay nodata.

use crate::core::error::{ChunkError, ChunkResult, ConstructionError, ConstructionResult, CubeId};
use crate::core::srs::CoordTransformer;
use crate::core::types::{is_nodata, BandCollection, ChunkData};
use crate::core::view::{ChunkId, CubeView, SpatialExtent, TemporalExtent};
use crate::cubes::Cube;
use crate::graph::serialization::CubeSpec;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Collection interface
// ============================================================================

/// One image of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: String,
    pub datetime: NaiveDateTime,
    /// SRS of the image.
    pub srs: String,
    /// Footprint in the image SRS.
    pub footprint: SpatialExtent,
    /// Numeric metadata, e.g. cloud cover, used by overlap policies.
    #[serde(default)]
    pub metadata: IndexMap<String, f64>,
}

/// Pixels of one band of one image, north-up.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceWindow {
    pub width: usize,
    pub height: usize,
    /// Row-major, row 0 is the northern edge.
    pub data: Vec<f64>,
    /// GDAL-style geotransform `[left, dx, 0, top, 0, -dy]`.
    pub geotransform: [f64; 6],
    pub srs: String,
    pub nodata: Option<f64>,
}

impl SourceWindow {
    fn pixel(&self, col: isize, row: isize) -> Option<f64> {
        if col < 0 || row < 0 || col as usize >= self.width || row as usize >= self.height {
            return None;
        }
        let v = self.data[row as usize * self.width + col as usize];
        let missing = v.is_nan() || self.nodata.is_some_and(|nd| v == nd);
        (!missing).then_some(v)
    }

    /// Sample the window at a point given in the window SRS.
    pub fn sample(&self, x: f64, y: f64, resampling: Resampling) -> Option<f64> {
        let px = (x - self.geotransform[0]) / self.geotransform[1];
        let py = (y - self.geotransform[3]) / self.geotransform[5];
        if !(px >= 0.0 && py >= 0.0 && px < self.width as f64 && py < self.height as f64) {
            return None;
        }
        match resampling {
            Resampling::Nearest => self.pixel(px.floor() as isize, py.floor() as isize),
            Resampling::Bilinear => {
                let u = px - 0.5;
                let v = py - 0.5;
                let c0 = u.floor();
                let r0 = v.floor();
                let fu = u - c0;
                let fv = v - r0;
                let (c0, r0) = (c0 as isize, r0 as isize);
                let taps = [
                    (c0, r0, (1.0 - fu) * (1.0 - fv)),
                    (c0 + 1, r0, fu * (1.0 - fv)),
                    (c0, r0 + 1, (1.0 - fu) * fv),
                    (c0 + 1, r0 + 1, fu * fv),
                ];
                let mut sum = 0.0;
                let mut weight = 0.0;
                for (c, r, w) in taps {
                    if w <= 0.0 {
                        continue;
                    }
                    if let Some(value) = self.pixel(c, r) {
                        sum += w * value;
                        weight += w;
                    }
                }
                (weight > 0.0).then(|| sum / weight)
            }
        }
    }
}

/// Extent covered by a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionExtent {
    pub space: SpatialExtent,
    pub srs: String,
    pub time: TemporalExtent,
}

/// Image catalog consumed by [`ImageCollectionCube`].
pub trait ImageCollection: Send + Sync + fmt::Debug {
    /// Name used to reference the collection from graph descriptions.
    fn name(&self) -> &str;

    /// Bands available in every image.
    fn bands(&self) -> BandCollection;

    /// Images whose footprint intersects `extent` (given in `srs`) and whose
    /// datetime lies in `time`.
    fn find(
        &self,
        extent: &SpatialExtent,
        srs: &str,
        time: &TemporalExtent,
    ) -> ChunkResult<Vec<CollectionEntry>>;

    /// Read the part of `band` of `entry` that covers `extent` (given in `srs`).
    ///
    /// Returns `None` if the image does not cover the extent.
    fn read(
        &self,
        entry: &CollectionEntry,
        band: &str,
        extent: &SpatialExtent,
        srs: &str,
    ) -> ChunkResult<Option<SourceWindow>>;

    /// Overall extent, if the collection is not empty.
    fn extent(&self) -> Option<CollectionExtent>;
}

// ============================================================================
// Policies
// ============================================================================

/// Resampling used when mapping image pixels onto cube cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
}

/// Serializable overlap rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum OverlapRule {
    /// Latest acquisition wins.
    #[default]
    MostRecent,
    /// Earliest acquisition wins.
    Oldest,
    /// Lowest metadata value wins, e.g. `cloud_cover`.
    Ascending { key: String },
    /// Highest metadata value wins.
    Descending { key: String },
    /// Caller-supplied comparator; cannot be rebuilt from a description.
    Custom,
}

type Comparator = dyn Fn(&CollectionEntry, &CollectionEntry) -> Ordering + Send + Sync;

/// Orders images that cover the same cell in the same time step.
///
/// Images that sort first have priority: a cell takes the first valid value
/// in policy order.
#[derive(Clone)]
pub struct OverlapPolicy {
    rule: OverlapRule,
    custom: Option<Arc<Comparator>>,
}

impl fmt::Debug for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlapPolicy").field("rule", &self.rule).finish()
    }
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self::most_recent()
    }
}

impl OverlapPolicy {
    /// Latest acquisition wins.
    pub fn most_recent() -> Self {
        Self {
            rule: OverlapRule::MostRecent,
            custom: None,
        }
    }

    /// Earliest acquisition wins.
    pub fn oldest() -> Self {
        Self {
            rule: OverlapRule::Oldest,
            custom: None,
        }
    }

    /// Lowest value of a metadata key wins; images without the key come last.
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            rule: OverlapRule::Ascending { key: key.into() },
            custom: None,
        }
    }

    /// Highest value of a metadata key wins; images without the key come last.
    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            rule: OverlapRule::Descending { key: key.into() },
            custom: None,
        }
    }

    /// Caller-supplied comparator.
    pub fn custom<F>(compare: F) -> Self
    where
        F: Fn(&CollectionEntry, &CollectionEntry) -> Ordering + Send + Sync + 'static,
    {
        Self {
            rule: OverlapRule::Custom,
            custom: Some(Arc::new(compare)),
        }
    }

    /// Build a policy from its serializable rule.
    pub fn from_rule(rule: &OverlapRule) -> ConstructionResult<Self> {
        Ok(match rule {
            OverlapRule::MostRecent => Self::most_recent(),
            OverlapRule::Oldest => Self::oldest(),
            OverlapRule::Ascending { key } => Self::ascending(key.clone()),
            OverlapRule::Descending { key } => Self::descending(key.clone()),
            OverlapRule::Custom => {
                return Err(ConstructionError::Other(
                    "custom overlap comparators cannot be rebuilt from a description".to_string(),
                ))
            }
        })
    }

    /// Serializable rule of this policy.
    pub fn rule(&self) -> &OverlapRule {
        &self.rule
    }

    /// Priority order of two images; ties fall back to datetime then id.
    pub fn compare(&self, a: &CollectionEntry, b: &CollectionEntry) -> Ordering {
        let by_key = |key: &str, descending: bool| match (a.metadata.get(key), b.metadata.get(key)) {
            (Some(x), Some(y)) if descending => y.total_cmp(x),
            (Some(x), Some(y)) => x.total_cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let primary = match (&self.rule, &self.custom) {
            (_, Some(compare)) => compare(a, b),
            (OverlapRule::MostRecent, _) => b.datetime.cmp(&a.datetime),
            (OverlapRule::Oldest, _) => a.datetime.cmp(&b.datetime),
            (OverlapRule::Ascending { key }, _) => by_key(key, false),
            (OverlapRule::Descending { key }, _) => by_key(key, true),
            (OverlapRule::Custom, None) => Ordering::Equal,
        };
        primary
            .then_with(|| b.datetime.cmp(&a.datetime))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Which mask values invalidate a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskRule {
    /// Listed values are masked.
    Values { values: Vec<f64> },
    /// Values in `[min, max]` are masked.
    Range { min: f64, max: f64 },
}

/// Per-image mask read from a band of the same image, e.g. a cloud mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMask {
    pub band: String,
    pub rule: MaskRule,
    /// Mask cells that do *not* match the rule instead.
    #[serde(default)]
    pub invert: bool,
}

impl ImageMask {
    /// Mask cells whose mask band takes one of `values`.
    pub fn values(band: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            band: band.into(),
            rule: MaskRule::Values { values },
            invert: false,
        }
    }

    /// Mask cells whose mask band lies in `[min, max]`.
    pub fn range(band: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            band: band.into(),
            rule: MaskRule::Range { min, max },
            invert: false,
        }
    }

    /// Invert the rule.
    pub fn inverted(mut self) -> Self {
        self.invert = !self.invert;
        self
    }

    /// Whether a mask value invalidates the cell. Missing mask values never do.
    pub fn is_masked(&self, value: Option<f64>) -> bool {
        let Some(v) = value else {
            return false;
        };
        let hit = match &self.rule {
            MaskRule::Values { values } => values.iter().any(|m| *m == v),
            MaskRule::Range { min, max } => v >= *min && v <= *max,
        };
        hit != self.invert
    }
}

// ============================================================================
// Cube
// ============================================================================

/// Leaf cube materializing an image collection on a cube view.
#[derive(Debug)]
pub struct ImageCollectionCube {
    id: CubeId,
    collection: Arc<dyn ImageCollection>,
    view: CubeView,
    bands: BandCollection,
    resampling: Resampling,
    overlap: OverlapPolicy,
    mask: Option<ImageMask>,
    nodata: f64,
}

impl ImageCollectionCube {
    /// Create a cube over all bands of `collection`.
    pub fn new(collection: Arc<dyn ImageCollection>, view: CubeView) -> ConstructionResult<Self> {
        view.validate()?;
        let bands = collection.bands();
        if bands.is_empty() {
            return Err(ConstructionError::NoBands);
        }
        Ok(Self {
            id: CubeId::new(),
            collection,
            view,
            bands,
            resampling: Resampling::default(),
            overlap: OverlapPolicy::default(),
            mask: None,
            nodata: f64::NAN,
        })
    }

    /// Restrict the cube to a subset of collection bands, in the given order.
    pub fn with_bands<S: AsRef<str>>(mut self, names: &[S]) -> ConstructionResult<Self> {
        let available = self.collection.bands();
        let mut bands = BandCollection::new();
        for name in names {
            let index = available.index_of(name.as_ref())?;
            if let Some(band) = available.get_index(index) {
                bands.push(band.clone())?;
            }
        }
        if bands.is_empty() {
            return Err(ConstructionError::NoBands);
        }
        self.bands = bands;
        Ok(self)
    }

    /// Set the resampling method.
    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    /// Set the overlap policy.
    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    /// Apply a per-image mask; the mask band must exist in the collection.
    pub fn with_mask(mut self, mask: ImageMask) -> ConstructionResult<Self> {
        self.collection.bands().index_of(&mask.band)?;
        self.mask = Some(mask);
        Ok(self)
    }

    /// The underlying collection.
    pub fn collection(&self) -> &Arc<dyn ImageCollection> {
        &self.collection
    }

    /// Cell-centre coordinates of a chunk window, in `srs`.
    fn cell_centres(
        &self,
        extent: &SpatialExtent,
        size: [usize; 2],
        srs: &str,
    ) -> ChunkResult<Vec<(f64, f64)>> {
        let transformer = CoordTransformer::new(&self.view.srs, srs)?;
        let mut centres = Vec::with_capacity(size[0] * size[1]);
        for row in 0..size[0] {
            let y = extent.top - (row as f64 + 0.5) * self.view.dy;
            for col in 0..size[1] {
                let x = extent.left + (col as f64 + 0.5) * self.view.dx;
                centres.push(transformer.transform(x, y)?);
            }
        }
        Ok(centres)
    }

    fn resample(
        &self,
        window: &SourceWindow,
        extent: &SpatialExtent,
        size: [usize; 2],
    ) -> ChunkResult<Vec<Option<f64>>> {
        let centres = self.cell_centres(extent, size, &window.srs)?;
        Ok(centres
            .into_iter()
            .map(|(x, y)| window.sample(x, y, self.resampling))
            .collect())
    }
}

impl Cube for ImageCollectionCube {
    fn id(&self) -> CubeId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "image_collection"
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
        let extent = self.view.region_extent(&region);
        let time = self.view.region_time(&region);
        let [st, sy, sx] = region.size;
        let mut out = ChunkData::nodata([self.bands.len(), st, sy, sx], self.nodata);

        let mut entries = self.collection.find(&extent, &self.view.srs, &time)?;
        entries.sort_by(|a, b| self.overlap.compare(a, b));
        debug!(
            "cube {} chunk {}: {} intersecting images",
            self.id,
            id,
            entries.len()
        );

        for entry in &entries {
            let Some(t) = self.view.time_index(entry.datetime) else {
                continue;
            };
            if t < region.offset[0] || t >= region.offset[0] + st {
                continue;
            }
            let t = t - region.offset[0];

            let masked = match &self.mask {
                Some(mask) => {
                    match self
                        .collection
                        .read(entry, &mask.band, &extent, &self.view.srs)?
                    {
                        Some(window) => self
                            .resample(&window, &extent, [sy, sx])?
                            .into_iter()
                            .map(|v| mask.is_masked(v))
                            .collect(),
                        None => vec![false; sy * sx],
                    }
                }
                None => vec![false; sy * sx],
            };

            for (b, band) in self.bands.iter().enumerate() {
                let Some(window) = self
                    .collection
                    .read(entry, &band.name, &extent, &self.view.srs)?
                else {
                    continue;
                };
                let values = self.resample(&window, &extent, [sy, sx])?;
                for (cell, value) in values.into_iter().enumerate() {
                    let (y, x) = (cell / sx, cell % sx);
                    if masked[cell] || !is_nodata(out.get(b, t, y, x), self.nodata) {
                        continue;
                    }
                    let Some(raw) = value else {
                        continue;
                    };
                    if band.nodata.is_some_and(|nd| raw == nd) {
                        continue;
                    }
                    out.set(b, t, y, x, raw * band.scale + band.offset);
                }
            }
        }
        Ok(out)
    }

    fn to_spec(&self) -> CubeSpec {
        CubeSpec::ImageCollection {
            collection: self.collection.name().to_string(),
            view: self.view.clone(),
            bands: Some(self.bands.names()),
            resampling: self.resampling,
            overlap: self.overlap.rule().clone(),
            mask: self.mask.clone(),
        }
    }
}

// ============================================================================
// In-memory collection
// ============================================================================

/// An image held in memory, one buffer per band.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    pub entry: CollectionEntry,
    pub width: usize,
    pub height: usize,
    pub geotransform: [f64; 6],
    pub bands: IndexMap<String, Vec<f64>>,
}

impl MemoryImage {
    /// Create an image without bands; the footprint follows from the geotransform.
    pub fn new(
        id: impl Into<String>,
        datetime: NaiveDateTime,
        srs: impl Into<String>,
        geotransform: [f64; 6],
        width: usize,
        height: usize,
    ) -> Self {
        let left = geotransform[0];
        let top = geotransform[3];
        let right = left + width as f64 * geotransform[1];
        let bottom = top + height as f64 * geotransform[5];
        Self {
            entry: CollectionEntry {
                id: id.into(),
                datetime,
                srs: srs.into(),
                footprint: SpatialExtent::new(left, right, bottom.min(top), top.max(bottom)),
                metadata: IndexMap::new(),
            },
            width,
            height,
            geotransform,
            bands: IndexMap::new(),
        }
    }

    /// Add a band buffer (row-major, north-up).
    pub fn with_band(mut self, name: impl Into<String>, data: Vec<f64>) -> Self {
        self.bands.insert(name.into(), data);
        self
    }

    /// Attach a numeric metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: f64) -> Self {
        self.entry.metadata.insert(key.into(), value);
        self
    }
}

/// Image collection kept entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    name: String,
    bands: BandCollection,
    images: Vec<MemoryImage>,
}

impl MemoryCollection {
    /// Create an empty collection with a fixed band list.
    pub fn new(name: impl Into<String>, bands: BandCollection) -> Self {
        Self {
            name: name.into(),
            bands,
            images: Vec::new(),
        }
    }

    /// Add an image; every band buffer must match the image size and name a
    /// band of the collection.
    pub fn add_image(&mut self, image: MemoryImage) -> ConstructionResult<()> {
        for (name, data) in &image.bands {
            self.bands.index_of(name)?;
            if data.len() != image.width * image.height {
                return Err(ConstructionError::Other(format!(
                    "band '{}' of image '{}' has {} values, expected {}",
                    name,
                    image.entry.id,
                    data.len(),
                    image.width * image.height
                )));
            }
        }
        if self.images.iter().any(|i| i.entry.id == image.entry.id) {
            return Err(ConstructionError::Other(format!(
                "duplicate image id '{}'",
                image.entry.id
            )));
        }
        self.images.push(image);
        Ok(())
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether the collection holds no images.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn image(&self, entry: &CollectionEntry) -> ChunkResult<&MemoryImage> {
        self.images
            .iter()
            .find(|i| i.entry.id == entry.id)
            .ok_or_else(|| ChunkError::AssetRead {
                asset: entry.id.clone(),
                reason: "image not in collection".to_string(),
            })
    }
}

impl ImageCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn bands(&self) -> BandCollection {
        self.bands.clone()
    }

    fn find(
        &self,
        extent: &SpatialExtent,
        srs: &str,
        time: &TemporalExtent,
    ) -> ChunkResult<Vec<CollectionEntry>> {
        let mut found = Vec::new();
        for image in &self.images {
            if !time.contains(image.entry.datetime) {
                continue;
            }
            let query = CoordTransformer::new(srs, &image.entry.srs)?.transform_extent(extent)?;
            if query.intersects(&image.entry.footprint) {
                found.push(image.entry.clone());
            }
        }
        Ok(found)
    }

    fn read(
        &self,
        entry: &CollectionEntry,
        band: &str,
        extent: &SpatialExtent,
        srs: &str,
    ) -> ChunkResult<Option<SourceWindow>> {
        let image = self.image(entry)?;
        let Some(data) = image.bands.get(band) else {
            return Ok(None);
        };
        let query = CoordTransformer::new(srs, &entry.srs)?.transform_extent(extent)?;
        let gt = image.geotransform;
        let clamp = |v: f64, n: usize| v.max(0.0).min(n as f64) as usize;
        // One pixel of margin for bilinear taps.
        let col0 = clamp(((query.left - gt[0]) / gt[1]).floor() - 1.0, image.width);
        let col1 = clamp(((query.right - gt[0]) / gt[1]).ceil() + 1.0, image.width);
        let row0 = clamp(((query.top - gt[3]) / gt[5]).floor() - 1.0, image.height);
        let row1 = clamp(((query.bottom - gt[3]) / gt[5]).ceil() + 1.0, image.height);
        if col0 >= col1 || row0 >= row1 {
            return Ok(None);
        }
        let width = col1 - col0;
        let height = row1 - row0;
        let mut window = Vec::with_capacity(width * height);
        for row in row0..row1 {
            let start = row * image.width;
            window.extend_from_slice(&data[start + col0..start + col1]);
        }
        Ok(Some(SourceWindow {
            width,
            height,
            data: window,
            geotransform: [
                gt[0] + col0 as f64 * gt[1],
                gt[1],
                0.0,
                gt[3] + row0 as f64 * gt[5],
                0.0,
                gt[5],
            ],
            srs: entry.srs.clone(),
            nodata: self.bands.get(band).and_then(|b| b.nodata),
        }))
    }

    fn extent(&self) -> Option<CollectionExtent> {
        let first = self.images.first()?;
        let mut space = first.entry.footprint;
        let mut start = first.entry.datetime;
        let mut end = first.entry.datetime;
        for image in &self.images[1..] {
            let f = image.entry.footprint;
            space.left = space.left.min(f.left);
            space.right = space.right.max(f.right);
            space.bottom = space.bottom.min(f.bottom);
            space.top = space.top.max(f.top);
            start = start.min(image.entry.datetime);
            end = end.max(image.entry.datetime);
        }
        Some(CollectionExtent {
            space,
            srs: first.entry.srs.clone(),
            time: TemporalExtent::new(start, end),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Band;
    use crate::core::view::tests::{date, test_view};
    use crate::core::view::ChunkShape;
    use crate::cubes::testing::{grid_cube, materialize};

    fn two_image_collection() -> MemoryCollection {
        let bands = BandCollection::from_bands(vec![Band::new("B1"), Band::new("CLOUD")]).unwrap();
        let mut collection = MemoryCollection::new("scenes", bands);
        let gt = [0.0, 1.0, 0.0, 2.0, 0.0, -1.0];
        collection
            .add_image(
                MemoryImage::new("a", date(2020, 1, 1), "EPSG:3857", gt, 2, 2)
                    .with_band("B1", vec![1.0, 1.0, 1.0, f64::NAN])
                    .with_band("CLOUD", vec![0.0, 0.0, 1.0, 0.0])
                    .with_metadata("cloud_cover", 40.0),
            )
            .unwrap();
        let later = date(2020, 1, 1) + chrono::Duration::hours(6);
        collection
            .add_image(
                MemoryImage::new("b", later, "EPSG:3857", gt, 2, 2)
                    .with_band("B1", vec![2.0, f64::NAN, 2.0, 2.0])
                    .with_band("CLOUD", vec![0.0, 0.0, 0.0, 0.0])
                    .with_metadata("cloud_cover", 10.0),
            )
            .unwrap();
        collection
    }

    fn cube(policy: OverlapPolicy) -> ImageCollectionCube {
        let view = test_view(2, 2, 2, ChunkShape::new(2, 2, 2));
        ImageCollectionCube::new(Arc::new(two_image_collection()), view)
            .unwrap()
            .with_bands(&["B1"])
            .unwrap()
            .with_overlap(policy)
    }

    #[test]
    fn test_grid_aligned_read() {
        let view = test_view(3, 4, 5, ChunkShape::new(2, 3, 3));
        let cube = grid_cube(&view, &["B1"], |_, t, y, x| (t * 100 + y * 10 + x) as f64);
        let all = materialize(cube.as_ref());
        assert_eq!(all.get(0, 2, 3, 4), 234.0);
        assert_eq!(all.get(0, 1, 0, 2), 102.0);
    }

    #[test]
    fn test_overlap_most_recent() {
        let chunk = cube(OverlapPolicy::most_recent()).read_chunk(ChunkId(0)).unwrap();
        // Image b wins where it is valid, a fills the gap.
        assert_eq!(chunk.band(0)[..4], [2.0, 1.0, 2.0, 2.0]);
        // Second day has no image.
        assert!(chunk.band(0)[4..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_overlap_oldest_and_metadata() {
        let chunk = cube(OverlapPolicy::oldest()).read_chunk(ChunkId(0)).unwrap();
        assert_eq!(chunk.band(0)[..4], [1.0, 1.0, 1.0, 2.0]);

        let chunk = cube(OverlapPolicy::descending("cloud_cover"))
            .read_chunk(ChunkId(0))
            .unwrap();
        assert_eq!(chunk.band(0)[..4], [1.0, 1.0, 1.0, 2.0]);

        let chunk = cube(OverlapPolicy::custom(|a, b| a.id.cmp(&b.id)))
            .read_chunk(ChunkId(0))
            .unwrap();
        assert_eq!(chunk.band(0)[..4], [1.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_mask() {
        let cube = cube(OverlapPolicy::oldest())
            .with_mask(ImageMask::values("CLOUD", vec![1.0]))
            .unwrap();
        let chunk = cube.read_chunk(ChunkId(0)).unwrap();
        // Cell (1, 0) is cloudy in a, so b fills it.
        assert_eq!(chunk.band(0)[..4], [1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_bilinear_sampling() {
        let window = SourceWindow {
            width: 2,
            height: 1,
            data: vec![0.0, 10.0],
            geotransform: [0.0, 1.0, 0.0, 1.0, 0.0, -1.0],
            srs: "EPSG:3857".to_string(),
            nodata: None,
        };
        let v = window.sample(1.0, 0.5, Resampling::Bilinear).unwrap();
        assert!((v - 5.0).abs() < 1e-12);
        assert_eq!(window.sample(1.0, 0.5, Resampling::Nearest), Some(10.0));
        assert_eq!(window.sample(2.5, 0.5, Resampling::Nearest), None);
    }

    #[test]
    fn test_unknown_mask_band() {
        let view = test_view(1, 2, 2, ChunkShape::new(1, 2, 2));
        let result = ImageCollectionCube::new(Arc::new(two_image_collection()), view)
            .unwrap()
            .with_mask(ImageMask::values("QA", vec![1.0]));
        assert!(matches!(result, Err(ConstructionError::UnknownBand { .. })));
    }

    #[test]
    fn test_collection_extent() {
        let extent = two_image_collection().extent().unwrap();
        assert_eq!(extent.space, SpatialExtent::new(0.0, 2.0, 0.0, 2.0));
        assert_eq!(extent.time.start, date(2020, 1, 1));
    }

    #[test]
    fn test_add_image_validates_size() {
        let mut collection = two_image_collection();
        let gt = [0.0, 1.0, 0.0, 2.0, 0.0, -1.0];
        let bad = MemoryImage::new("c", date(2020, 1, 2), "EPSG:3857", gt, 2, 2)
            .with_band("B1", vec![1.0]);
        assert!(collection.add_image(bad).is_err());
        assert_eq!(collection.len(), 2);
    }
}
