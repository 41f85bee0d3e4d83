//! Evaluation of cube graphs.
//!
//! An [`Engine`] owns the worker pool and the collection registry. Its
//! [`ChunkScheduler`] evaluates chunks locally or on swarm workers and feeds
//! them to a [`ChunkSink`](crate::sinks::ChunkSink).

pub mod config;
pub mod engine;
pub mod progress;
pub mod swarm;

pub use config::{Engine, EngineConfig};
pub use engine::{ChunkScheduler, ChunkSelection, ErrorPolicy, EvaluationReport};
pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate};
pub use swarm::{ChunkWorker, LocalWorker, RemoteWorker, SwarmWorker};
