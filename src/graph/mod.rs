//! Graph descriptions.
//!
//! A cube graph can be written as a [`CubeSpec`] tree, shipped to a swarm
//! worker or stored on disk, and rebuilt by a [`CollectionRegistry`] that
//! knows the named image collections it refers to.

pub mod registry;
pub mod serialization;

pub use registry::{CollectionRegistry, FormatDescription};
pub use serialization::{CubeSpec, SerializedCube};
