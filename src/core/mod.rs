//! Core types for the rastercube engine.
//!
//! This module contains the foundational pieces every cube builds on:
//! - Cube views, chunk addressing and time steps
//! - Bands, band collections and chunk buffers
//! - Reducers and per-cell expressions
//! - Coordinate transformation
//! - Error types

pub mod error;
pub mod expression;
pub mod reducer;
pub mod srs;
pub mod types;
pub mod view;

// Re-export commonly used types
pub use error::{
    ChunkError, ChunkResult, ConfigError, ConstructionError, ConstructionResult, CubeError,
    CubeId, CubeResult, SinkError,
};
pub use expression::{Expression, PixelEvaluator};
pub use reducer::{Accumulator, Reducer};
pub use srs::CoordTransformer;
pub use types::{Band, BandCollection, ChunkData, DataType};
pub use view::{
    ChunkId, ChunkIterator, ChunkRegion, ChunkShape, CubeView, SpatialExtent, TemporalExtent,
    TimeStep, TimeUnit,
};
