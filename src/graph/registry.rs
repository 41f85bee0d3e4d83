//! Registry of named image collections used to build graphs from descriptions.

use crate::core::error::{ConstructionError, ConstructionResult};
use crate::cubes::{
    ApplyPixelCube, CubeRef, DummyCube, FillTimeCube, FilterPredicateCube, ImageCollection,
    ImageCollectionCube, JoinBandsCube, OverlapPolicy, ReduceSpaceCube, ReduceTimeCube,
    SelectBandsCube, StreamApplyPixelCube, StreamCube, StreamReduceTimeCube, WindowTimeCube,
};
use crate::graph::serialization::CubeSpec;
use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An image collection format description found in a search directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescription {
    /// File stem, e.g. `Sentinel2_L2A`.
    pub name: String,
    pub path: PathBuf,
    /// `description` field of the file, if present.
    pub description: Option<String>,
}

/// Resolves collection names and turns [`CubeSpec`] descriptions into cube graphs.
#[derive(Debug, Default, Clone)]
pub struct CollectionRegistry {
    collections: IndexMap<String, Arc<dyn ImageCollection>>,
    format_dirs: Vec<PathBuf>,
    stream_timeout_secs: Option<f64>,
}

impl CollectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection under its own name, replacing any previous one.
    pub fn register(&mut self, collection: Arc<dyn ImageCollection>) {
        let name = collection.name().to_string();
        if self.collections.insert(name.clone(), collection).is_some() {
            debug!("Replaced image collection '{}'", name);
        }
    }

    /// Look up a collection.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ImageCollection>> {
        self.collections.get(name)
    }

    /// Registered collection names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(|s| s.as_str())
    }

    /// Default timeout for stream commands built by this registry.
    pub fn with_stream_timeout(mut self, timeout_secs: f64) -> Self {
        self.stream_timeout_secs = Some(timeout_secs);
        self
    }

    /// Default stream timeout, if one was set.
    pub fn stream_timeout_secs(&self) -> Option<f64> {
        self.stream_timeout_secs
    }

    /// Add a directory searched by [`Self::list_formats`].
    pub fn add_format_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if !self.format_dirs.contains(&dir) {
            self.format_dirs.push(dir);
        }
    }

    /// Format descriptions (`*.json`) in all search directories, sorted by name.
    pub fn list_formats(&self) -> Vec<FormatDescription> {
        let mut formats: Vec<FormatDescription> = self
            .format_dirs
            .iter()
            .flat_map(|dir| formats_in(dir))
            .collect();
        formats.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
        formats
    }

    /// Build the graph described by `spec`.
    pub fn build(&self, spec: &CubeSpec) -> ConstructionResult<CubeRef> {
        match self.stream_timeout_secs {
            Some(timeout) if spec.is_streaming() => {
                let mut spec = spec.clone();
                spec.apply_stream_timeout(timeout);
                self.build_node(&spec)
            }
            _ => self.build_node(spec),
        }
    }

    fn build_node(&self, spec: &CubeSpec) -> ConstructionResult<CubeRef> {
        let cube: CubeRef = match spec {
            CubeSpec::ImageCollection {
                collection,
                view,
                bands,
                resampling,
                overlap,
                mask,
            } => {
                let source = self
                    .collections
                    .get(collection)
                    .ok_or_else(|| ConstructionError::UnknownCollection(collection.clone()))?;
                let mut cube = ImageCollectionCube::new(source.clone(), view.clone())?
                    .with_resampling(*resampling)
                    .with_overlap(OverlapPolicy::from_rule(overlap)?);
                if let Some(bands) = bands {
                    cube = cube.with_bands(bands)?;
                }
                if let Some(mask) = mask {
                    cube = cube.with_mask(mask.clone())?;
                }
                Arc::new(cube)
            }
            CubeSpec::Dummy {
                view,
                bands,
                fill,
                nodata,
            } => {
                let cube = DummyCube::new(view.clone(), *bands, *fill)?;
                match nodata {
                    Some(nodata) => Arc::new(cube.with_nodata(*nodata)),
                    None => Arc::new(cube),
                }
            }
            CubeSpec::ReduceTime {
                input,
                reducers,
                keep_names,
            } => Arc::new(ReduceTimeCube::build(
                self.build_node(input)?,
                reducers,
                *keep_names,
            )?),
            CubeSpec::ReduceSpace { input, reducers } => {
                Arc::new(ReduceSpaceCube::new(self.build_node(input)?, reducers)?)
            }
            CubeSpec::WindowTime {
                input,
                reducers,
                window,
            } => Arc::new(WindowTimeCube::reduce(
                self.build_node(input)?,
                reducers,
                window[0],
                window[1],
            )?),
            CubeSpec::WindowKernel {
                input,
                kernel,
                window,
            } => Arc::new(WindowTimeCube::kernel_with_window(
                self.build_node(input)?,
                kernel.clone(),
                window[0],
                window[1],
            )?),
            CubeSpec::ApplyPixel {
                input,
                expressions,
                names,
                keep_bands,
            } => Arc::new(ApplyPixelCube::new(
                self.build_node(input)?,
                expressions,
                names,
                *keep_bands,
            )?),
            CubeSpec::SelectBands { input, bands } => {
                Arc::new(SelectBandsCube::new(self.build_node(input)?, bands)?)
            }
            CubeSpec::JoinBands {
                left,
                right,
                prefix_left,
                prefix_right,
            } => Arc::new(JoinBandsCube::new(
                self.build_node(left)?,
                self.build_node(right)?,
                prefix_left.clone(),
                prefix_right.clone(),
            )?),
            CubeSpec::FilterPredicate { input, predicate } => {
                Arc::new(FilterPredicateCube::new(self.build_node(input)?, predicate)?)
            }
            CubeSpec::FillTime { input, method } => {
                Arc::new(FillTimeCube::new(self.build_node(input)?, *method))
            }
            CubeSpec::StreamReduceTime {
                input,
                command,
                names,
            } => Arc::new(StreamReduceTimeCube::new(
                self.build_node(input)?,
                command.clone(),
                names,
            )?),
            CubeSpec::StreamApplyPixel {
                input,
                command,
                names,
                keep_bands,
            } => Arc::new(StreamApplyPixelCube::new(
                self.build_node(input)?,
                command.clone(),
                names,
                *keep_bands,
            )?),
            CubeSpec::Stream {
                input,
                command,
                names,
            } => Arc::new(StreamCube::new(
                self.build_node(input)?,
                command.clone(),
                names.clone(),
            )?),
        };
        Ok(cube)
    }
}

fn formats_in(dir: &Path) -> Vec<FormatDescription> {
    let pattern = dir.join("*.json");
    let paths = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Invalid format directory '{}': {}", dir.display(), e);
            return Vec::new();
        }
    };
    paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable format file: {}", e);
                None
            }
        })
        .filter_map(|path| {
            let name = path.file_stem()?.to_string_lossy().into_owned();
            let description = std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                .and_then(|json| json.get("description")?.as_str().map(str::to_string));
            Some(FormatDescription {
                name,
                path,
                description,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reducer::Reducer;
    use crate::core::view::tests::test_view;
    use crate::core::view::ChunkShape;
    use crate::cubes::testing::{assert_same, materialize};
    use crate::cubes::{Cube, MemoryCollection, MemoryImage, ReducerBand};
    use crate::core::types::BandCollection;
    use crate::cubes::StreamCommand;
    use crate::graph::serialization::SerializedCube;

    fn registry() -> CollectionRegistry {
        let view = test_view(2, 2, 2, ChunkShape::new(1, 2, 2));
        let mut collection =
            MemoryCollection::new("s2", BandCollection::from_names(&["red", "nir"]).unwrap());
        for t in 0..2 {
            let image = MemoryImage::new(
                format!("img{}", t),
                view.time_at(t),
                view.srs.clone(),
                [0.0, 1.0, 0.0, 2.0, 0.0, -1.0],
                2,
                2,
            )
            .with_band("red", vec![1.0 + t as f64; 4])
            .with_band("nir", vec![3.0; 4]);
            collection.add_image(image).unwrap();
        }
        let mut registry = CollectionRegistry::new();
        registry.register(Arc::new(collection));
        registry
    }

    #[test]
    fn test_build_roundtrip() {
        let registry = registry();
        let view = test_view(2, 2, 2, ChunkShape::new(1, 2, 2));
        let spec = CubeSpec::ReduceTime {
            input: Box::new(CubeSpec::ApplyPixel {
                input: Box::new(CubeSpec::ImageCollection {
                    collection: "s2".to_string(),
                    view,
                    bands: None,
                    resampling: Default::default(),
                    overlap: Default::default(),
                    mask: None,
                }),
                expressions: vec!["nir - red".to_string()],
                names: vec!["diff".to_string()],
                keep_bands: false,
            }),
            reducers: vec![ReducerBand::new(Reducer::Sum, "diff")],
            keep_names: false,
        };
        let cube = registry.build(&spec).unwrap();
        assert_eq!(cube.bands().names(), vec!["diff_sum"]);
        let all = materialize(cube.as_ref());
        assert!(all.as_slice().iter().all(|&v| v == 3.0));

        let rebuilt = registry.build(&cube.to_spec()).unwrap();
        assert_same(materialize(rebuilt.as_ref()).as_slice(), all.as_slice());
        let json = SerializedCube::from_cube(cube.as_ref()).to_json().unwrap();
        let parsed = SerializedCube::from_json(&json).unwrap();
        assert_eq!(parsed.root, cube.to_spec());
    }

    #[test]
    fn test_unknown_collection() {
        let spec = CubeSpec::ImageCollection {
            collection: "landsat".to_string(),
            view: test_view(2, 2, 2, ChunkShape::new(1, 2, 2)),
            bands: None,
            resampling: Default::default(),
            overlap: Default::default(),
            mask: None,
        };
        assert!(matches!(
            registry().build(&spec),
            Err(ConstructionError::UnknownCollection(_))
        ));
        assert_eq!(registry().names().collect::<Vec<_>>(), vec!["s2"]);
    }

    #[test]
    fn test_default_stream_timeout() {
        let spec = CubeSpec::Stream {
            input: Box::new(CubeSpec::Dummy {
                view: test_view(2, 2, 2, ChunkShape::new(1, 2, 2)),
                bands: 1,
                fill: 1.0,
                nodata: None,
            }),
            command: StreamCommand::new("cat"),
            names: None,
        };
        let cube = registry().with_stream_timeout(7.0).build(&spec).unwrap();
        match cube.to_spec() {
            CubeSpec::Stream { command, .. } => assert_eq!(command.timeout_secs, Some(7.0)),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_list_formats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Sentinel2_L2A.json"),
            r#"{"description": "Sentinel 2 level 2A"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("Broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut registry = CollectionRegistry::new();
        registry.add_format_dir(dir.path());
        registry.add_format_dir(dir.path());
        let formats = registry.list_formats();
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].name, "Broken");
        assert_eq!(formats[0].description, None);
        assert_eq!(formats[1].name, "Sentinel2_L2A");
        assert_eq!(formats[1].description.as_deref(), Some("Sentinel 2 level 2A"));
    }
}
