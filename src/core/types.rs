//! Core value types: bands, band collections and chunk buffers.

use crate::core::error::{ConstructionError, ConstructionResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared pixel type of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    UInt8,
    UInt16,
    Int16,
    Int32,
    Float32,
    #[default]
    Float64,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/// A named band of a cube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    /// Band-specific nodata value of the source, if any.
    #[serde(default)]
    pub nodata: Option<f64>,
}

fn default_scale() -> f64 {
    1.0
}

impl Band {
    /// Create a float64 band with no scale, offset or unit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Float64,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            nodata: None,
        }
    }

    /// Set the declared data type.
    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Set scale and offset.
    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set a band-specific nodata value.
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    /// Copy of this band under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Ordered collection of bands with unique names.
///
/// Order defines the buffer layout of every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandCollection {
    bands: IndexMap<String, Band>,
}

impl BandCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection, rejecting duplicate names.
    pub fn from_bands(bands: impl IntoIterator<Item = Band>) -> ConstructionResult<Self> {
        let mut collection = Self::new();
        for band in bands {
            collection.push(band)?;
        }
        Ok(collection)
    }

    /// Build a float64 collection from plain names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> ConstructionResult<Self> {
        Self::from_bands(names.iter().map(|n| Band::new(n.as_ref())))
    }

    /// Append a band.
    pub fn push(&mut self, band: Band) -> ConstructionResult<()> {
        if self.bands.contains_key(&band.name) {
            return Err(ConstructionError::DuplicateBand(band.name));
        }
        self.bands.insert(band.name.clone(), band);
        Ok(())
    }

    /// Append every band of another collection.
    pub fn extend(&mut self, other: &BandCollection) -> ConstructionResult<()> {
        for band in other.iter() {
            self.push(band.clone())?;
        }
        Ok(())
    }

    /// Number of bands.
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Iterate over bands in order.
    pub fn iter(&self) -> impl Iterator<Item = &Band> {
        self.bands.values()
    }

    /// Band names in order.
    pub fn names(&self) -> Vec<String> {
        self.bands.keys().cloned().collect()
    }

    /// Look up a band by name.
    pub fn get(&self, name: &str) -> Option<&Band> {
        self.bands.get(name)
    }

    /// Band at a position.
    pub fn get_index(&self, index: usize) -> Option<&Band> {
        self.bands.get_index(index).map(|(_, band)| band)
    }

    /// Position of a band, or a construction error naming the available bands.
    pub fn index_of(&self, name: &str) -> ConstructionResult<usize> {
        self.bands
            .get_index_of(name)
            .ok_or_else(|| ConstructionError::UnknownBand {
                band: name.to_string(),
                available: self.names(),
            })
    }

    /// Copy with every band name prefixed by `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let bands = self
            .iter()
            .map(|b| {
                let name = format!("{}{}", prefix, b.name);
                (name.clone(), b.renamed(name))
            })
            .collect();
        Self { bands }
    }
}

/// Whether `value` marks a missing cell.
#[inline]
pub fn is_nodata(value: f64, nodata: f64) -> bool {
    value.is_nan() || value == nodata
}

/// Dense buffer of one chunk.
///
/// Layout is band-major: `data[((b * nt + t) * ny + y) * nx + x]`.
/// Equality treats NaN cells and NaN sentinels as equal.
#[derive(Debug, Clone)]
pub struct ChunkData {
    shape: [usize; 4],
    data: Vec<f64>,
    nodata: f64,
}

#[inline]
fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl PartialEq for ChunkData {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && same_value(self.nodata, other.nodata)
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(&a, &b)| same_value(a, b))
    }
}

impl ChunkData {
    /// Chunk of `shape = [bands, t, y, x]` filled with `value`.
    pub fn filled(shape: [usize; 4], value: f64, nodata: f64) -> Self {
        Self {
            shape,
            data: vec![value; shape.iter().product()],
            nodata,
        }
    }

    /// Chunk of `shape` with every cell set to nodata.
    pub fn nodata(shape: [usize; 4], nodata: f64) -> Self {
        Self::filled(shape, nodata, nodata)
    }

    /// Wrap an existing buffer; `None` if its length does not match the shape.
    pub fn from_vec(shape: [usize; 4], data: Vec<f64>, nodata: f64) -> Option<Self> {
        if data.len() != shape.iter().product::<usize>() {
            return None;
        }
        Some(Self {
            shape,
            data,
            nodata,
        })
    }

    /// Shape `[bands, t, y, x]`.
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    /// Number of bands.
    pub fn bands(&self) -> usize {
        self.shape[0]
    }

    /// Number of cells per band.
    pub fn band_len(&self) -> usize {
        self.shape[1] * self.shape[2] * self.shape[3]
    }

    /// Nodata sentinel.
    pub fn nodata_value(&self) -> f64 {
        self.nodata
    }

    /// Whether `value` is nodata for this chunk.
    #[inline]
    pub fn is_nodata(&self, value: f64) -> bool {
        is_nodata(value, self.nodata)
    }

    /// Whether every cell is nodata.
    pub fn is_all_nodata(&self) -> bool {
        self.data.iter().all(|&v| self.is_nodata(v))
    }

    #[inline]
    fn index(&self, b: usize, t: usize, y: usize, x: usize) -> usize {
        ((b * self.shape[1] + t) * self.shape[2] + y) * self.shape[3] + x
    }

    /// Cell value.
    #[inline]
    pub fn get(&self, b: usize, t: usize, y: usize, x: usize) -> f64 {
        self.data[self.index(b, t, y, x)]
    }

    /// Set a cell value.
    #[inline]
    pub fn set(&mut self, b: usize, t: usize, y: usize, x: usize, value: f64) {
        let i = self.index(b, t, y, x);
        self.data[i] = value;
    }

    /// Flat buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable flat buffer.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Cells of one band.
    pub fn band(&self, b: usize) -> &[f64] {
        let n = self.band_len();
        &self.data[b * n..(b + 1) * n]
    }

    /// Mutable cells of one band.
    pub fn band_mut(&mut self, b: usize) -> &mut [f64] {
        let n = self.band_len();
        &mut self.data[b * n..(b + 1) * n]
    }

    /// Take the flat buffer.
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Approximate memory footprint in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }
}
