//! Error types for rastercube.
//!
//! Uses thiserror for structured errors with context. Errors fall into three groups:
//! - Construction errors, raised eagerly while a cube graph is built
//! - Per-chunk errors, isolated to the chunk that produced them
//! - Fatal errors, which abort a whole evaluation

use crate::core::view::ChunkId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a cube node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CubeId(pub Uuid);

impl CubeId {
    /// Create a new random cube ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CubeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CubeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Top-level error type for rastercube.
#[derive(Error, Debug)]
pub enum CubeError {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Chunk {chunk} failed: {source}")]
    ChunkFailed {
        chunk: ChunkId,
        #[source]
        source: ChunkError,
    },

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Evaluation cancelled after {completed}/{total} chunks")]
    Cancelled { completed: usize, total: usize },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while building a cube node.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstructionError {
    #[error("Unknown band '{band}' (available: {available:?})")]
    UnknownBand { band: String, available: Vec<String> },

    #[error("Duplicate band name '{0}'")]
    DuplicateBand(String),

    #[error("Cube views differ: {reason}")]
    IncompatibleViews { reason: String },

    #[error("Invalid cube view: {reason}")]
    InvalidView { reason: String },

    #[error("Cannot parse expression '{expression}': {reason}")]
    Expression { expression: String, reason: String },

    #[error("Invalid window or kernel: {reason}")]
    InvalidWindow { reason: String },

    #[error("Invalid stream command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Unknown reducer '{0}'")]
    UnknownReducer(String),

    #[error("Unknown image collection '{0}'")]
    UnknownCollection(String),

    #[error("Cube has no bands")]
    NoBands,

    #[error("{0}")]
    Other(String),
}

/// Errors isolated to a single chunk.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChunkError {
    #[error("Chunk {chunk} is outside of the chunk grid ({total} chunks)")]
    OutOfRange { chunk: ChunkId, total: u64 },

    #[error("Reading asset '{asset}' failed: {reason}")]
    AssetRead { asset: String, reason: String },

    #[error("Failed to start stream process '{command}': {reason}")]
    StreamSpawn { command: String, reason: String },

    #[error("Stream process '{command}' exited with status {status}: {stderr}")]
    StreamExit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Stream process '{command}' timed out after {timeout_secs:.1} s")]
    StreamTimeout { command: String, timeout_secs: f64 },

    #[error("Malformed stream output: {reason}")]
    StreamMalformed { reason: String },

    #[error("Reprojection failed: {0}")]
    Reprojection(String),

    #[error("Remote worker '{endpoint}' failed: {reason}")]
    Remote { endpoint: String, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Errors raised by output sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TIFF encoding error: {0}")]
    Tiff(String),

    #[error("Sink was not started before receiving chunks")]
    NotStarted,

    #[error("Invalid sink input: {0}")]
    InvalidInput(String),
}

/// Errors from reading or validating the engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

// ============================================================================
// Error Utilities
// ============================================================================

impl ChunkError {
    /// Whether tolerant evaluation may replace the chunk by nodata and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChunkError::StreamSpawn { .. }
                | ChunkError::StreamExit { .. }
                | ChunkError::StreamTimeout { .. }
                | ChunkError::StreamMalformed { .. }
                | ChunkError::AssetRead { .. }
                | ChunkError::Remote { .. }
        )
    }
}

impl CubeError {
    /// Get the chunk that caused this error, if applicable.
    pub fn chunk(&self) -> Option<ChunkId> {
        match self {
            CubeError::ChunkFailed { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}

/// Result type alias for rastercube operations.
pub type CubeResult<T> = Result<T, CubeError>;

/// Result type alias for cube construction.
pub type ConstructionResult<T> = Result<T, ConstructionError>;

/// Result type alias for chunk reads.
pub type ChunkResult<T> = Result<T, ChunkError>;
