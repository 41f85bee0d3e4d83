//! # Rastercube - chunked raster data cubes
//!
//! Rastercube turns collections of georeferenced images into regular
//! space-time data cubes and evaluates operator graphs over them lazily,
//! one chunk at a time, on a thread pool or a swarm of remote workers.
//!
//! ## Features
//!
//! - **Lazy operator graphs**: reduce over time or space, moving windows and
//!   kernels, per-pixel expressions, band selection and joins, gap filling
//! - **Chunked evaluation**: every node computes independent chunks, so
//!   evaluation parallelizes across chunks without shared mutable state
//! - **External processes**: stream chunks through any program speaking a
//!   small binary protocol on stdin/stdout
//! - **Outputs**: chunked GeoTIFF files with overview pyramids, zonal
//!   statistics over polygons and point sampling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rastercube::prelude::*;
//!
//! let engine = Engine::init(EngineConfig::default().with_threads(4))?;
//!
//! let view = CubeView::new(
//!     "EPSG:32632",
//!     SpatialExtent::new(300000.0, 310000.0, 5000000.0, 5010000.0),
//!     (100.0, 100.0),
//!     TemporalExtent::new(start, end),
//!     TimeStep::months(1),
//!     ChunkShape::new(4, 64, 64),
//! )?;
//! let s2: CubeRef = Arc::new(ImageCollectionCube::new(collection, view)?);
//! let ndvi: CubeRef = Arc::new(ApplyPixelCube::new(
//!     s2,
//!     &["(B08 - B04) / (B08 + B04)"],
//!     &["ndvi"],
//!     false,
//! )?);
//! let median: CubeRef = Arc::new(ReduceTimeCube::single(ndvi, Reducer::Median)?);
//!
//! let mut sink = GeoTiffSink::new("out", "ndvi");
//! engine.scheduler().run(&median, ChunkSelection::All, &mut sink)?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: views, chunk buffers, reducers, expressions and errors
//! - [`cubes`]: the [`Cube`](cubes::Cube) trait and every operator node
//! - [`graph`]: serializable graph descriptions and the collection registry
//! - [`execution`]: engine configuration, chunk scheduling and swarm workers
//! - [`sinks`]: consumers of evaluated chunks

#![warn(clippy::all)]

pub mod core;
pub mod cubes;
pub mod execution;
pub mod graph;
pub mod sinks;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use rastercube::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::error::{
        ChunkError, ChunkResult, ConfigError, ConstructionError, ConstructionResult, CubeError,
        CubeId, CubeResult, SinkError,
    };
    pub use crate::core::reducer::Reducer;
    pub use crate::core::types::{Band, BandCollection, ChunkData, DataType};
    pub use crate::core::view::{
        ChunkId, ChunkShape, CubeView, SpatialExtent, TemporalExtent, TimeStep, TimeUnit,
    };

    // Cubes
    pub use crate::cubes::{
        ApplyPixelCube, Cube, CubeInfo, CubeRef, DummyCube, FillMethod, FillTimeCube,
        FilterPredicateCube, ImageCollection, ImageCollectionCube, JoinBandsCube,
        MemoryCollection, MemoryImage, ReduceSpaceCube, ReduceTimeCube, ReducerBand,
        SelectBandsCube, StreamApplyPixelCube, StreamCommand, StreamCube, StreamReduceTimeCube,
        WindowTimeCube,
    };

    // Graph
    pub use crate::graph::{CollectionRegistry, CubeSpec, SerializedCube};

    // Execution
    pub use crate::execution::{
        ChunkScheduler, ChunkSelection, Engine, EngineConfig, ErrorPolicy, EvaluationReport,
        ProgressTracker, ProgressUpdate,
    };

    // Sinks
    pub use crate::sinks::{
        ChunkSink, CogOptions, GeoTiffSink, MemorySink, Packing, PackingType, PointQuery,
        PointSampler, ZonalStatistics,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
