//! Cube graph serialization for saving, loading and shipping to workers.

use crate::cubes::image_collection::{ImageMask, OverlapRule, Resampling};
use crate::cubes::stream::StreamCommand;
use crate::cubes::{Cube, FillMethod, ReducerBand};
use crate::core::view::CubeView;
use serde::{Deserialize, Serialize};

/// Serializable description of one node and, recursively, its inputs.
///
/// Nodata sentinels are written as `null` when they are NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CubeSpec {
    /// Leaf over a named image collection.
    ImageCollection {
        collection: String,
        view: CubeView,
        /// `None` selects every band of the collection.
        #[serde(default)]
        bands: Option<Vec<String>>,
        #[serde(default)]
        resampling: Resampling,
        #[serde(default)]
        overlap: OverlapRule,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mask: Option<ImageMask>,
    },
    /// Constant leaf.
    Dummy {
        view: CubeView,
        bands: usize,
        fill: f64,
        #[serde(default)]
        nodata: Option<f64>,
    },
    ReduceTime {
        input: Box<CubeSpec>,
        reducers: Vec<ReducerBand>,
        /// Keep input band names instead of `{band}_{reducer}`.
        #[serde(default)]
        keep_names: bool,
    },
    ReduceSpace {
        input: Box<CubeSpec>,
        reducers: Vec<ReducerBand>,
    },
    /// Moving-window reduction; `window` is `[before, after]`.
    WindowTime {
        input: Box<CubeSpec>,
        reducers: Vec<ReducerBand>,
        window: [usize; 2],
    },
    /// Moving-window convolution; `window` is `[before, after]`.
    WindowKernel {
        input: Box<CubeSpec>,
        kernel: Vec<f64>,
        window: [usize; 2],
    },
    ApplyPixel {
        input: Box<CubeSpec>,
        expressions: Vec<String>,
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        keep_bands: bool,
    },
    SelectBands {
        input: Box<CubeSpec>,
        bands: Vec<String>,
    },
    JoinBands {
        left: Box<CubeSpec>,
        right: Box<CubeSpec>,
        #[serde(default)]
        prefix_left: Option<String>,
        #[serde(default)]
        prefix_right: Option<String>,
    },
    FilterPredicate {
        input: Box<CubeSpec>,
        predicate: String,
    },
    FillTime {
        input: Box<CubeSpec>,
        #[serde(default)]
        method: FillMethod,
    },
    StreamReduceTime {
        input: Box<CubeSpec>,
        command: StreamCommand,
        names: Vec<String>,
    },
    StreamApplyPixel {
        input: Box<CubeSpec>,
        command: StreamCommand,
        names: Vec<String>,
        #[serde(default)]
        keep_bands: bool,
    },
    Stream {
        input: Box<CubeSpec>,
        command: StreamCommand,
        #[serde(default)]
        names: Option<Vec<String>>,
    },
}

impl CubeSpec {
    /// Operator kind, matching [`Cube::kind`] of the built node.
    pub fn kind(&self) -> &'static str {
        match self {
            CubeSpec::ImageCollection { .. } => "image_collection",
            CubeSpec::Dummy { .. } => "dummy",
            CubeSpec::ReduceTime { .. } => "reduce_time",
            CubeSpec::ReduceSpace { .. } => "reduce_space",
            CubeSpec::WindowTime { .. } | CubeSpec::WindowKernel { .. } => "window_time",
            CubeSpec::ApplyPixel { .. } => "apply_pixel",
            CubeSpec::SelectBands { .. } => "select_bands",
            CubeSpec::JoinBands { .. } => "join_bands",
            CubeSpec::FilterPredicate { .. } => "filter_predicate",
            CubeSpec::FillTime { .. } => "fill_time",
            CubeSpec::StreamReduceTime { .. } => "stream_reduce_time",
            CubeSpec::StreamApplyPixel { .. } => "stream_apply_pixel",
            CubeSpec::Stream { .. } => "stream",
        }
    }

    /// Direct inputs.
    pub fn inputs(&self) -> Vec<&CubeSpec> {
        match self {
            CubeSpec::ImageCollection { .. } | CubeSpec::Dummy { .. } => Vec::new(),
            CubeSpec::JoinBands { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            CubeSpec::ReduceTime { input, .. }
            | CubeSpec::ReduceSpace { input, .. }
            | CubeSpec::WindowTime { input, .. }
            | CubeSpec::WindowKernel { input, .. }
            | CubeSpec::ApplyPixel { input, .. }
            | CubeSpec::SelectBands { input, .. }
            | CubeSpec::FilterPredicate { input, .. }
            | CubeSpec::FillTime { input, .. }
            | CubeSpec::StreamReduceTime { input, .. }
            | CubeSpec::StreamApplyPixel { input, .. }
            | CubeSpec::Stream { input, .. } => vec![input.as_ref()],
        }
    }

    /// Names of every image collection referenced by the graph, in first-use order.
    pub fn collections(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.visit(&mut |spec| {
            if let CubeSpec::ImageCollection { collection, .. } = spec {
                if !names.contains(&collection.as_str()) {
                    names.push(collection.as_str());
                }
            }
        });
        names
    }

    /// Whether the graph contains a streaming node.
    pub fn is_streaming(&self) -> bool {
        self.command().is_some() || self.inputs().iter().any(|i| i.is_streaming())
    }

    /// Set `timeout_secs` on stream commands that do not carry their own.
    pub fn apply_stream_timeout(&mut self, timeout_secs: f64) {
        if let CubeSpec::StreamReduceTime { command, .. }
        | CubeSpec::StreamApplyPixel { command, .. }
        | CubeSpec::Stream { command, .. } = self
        {
            if command.timeout_secs.is_none() {
                command.timeout_secs = Some(timeout_secs);
            }
        }
        match self {
            CubeSpec::ImageCollection { .. } | CubeSpec::Dummy { .. } => {}
            CubeSpec::JoinBands { left, right, .. } => {
                left.apply_stream_timeout(timeout_secs);
                right.apply_stream_timeout(timeout_secs);
            }
            CubeSpec::ReduceTime { input, .. }
            | CubeSpec::ReduceSpace { input, .. }
            | CubeSpec::WindowTime { input, .. }
            | CubeSpec::WindowKernel { input, .. }
            | CubeSpec::ApplyPixel { input, .. }
            | CubeSpec::SelectBands { input, .. }
            | CubeSpec::FilterPredicate { input, .. }
            | CubeSpec::FillTime { input, .. }
            | CubeSpec::StreamReduceTime { input, .. }
            | CubeSpec::StreamApplyPixel { input, .. }
            | CubeSpec::Stream { input, .. } => input.apply_stream_timeout(timeout_secs),
        }
    }

    fn command(&self) -> Option<&StreamCommand> {
        match self {
            CubeSpec::StreamReduceTime { command, .. }
            | CubeSpec::StreamApplyPixel { command, .. }
            | CubeSpec::Stream { command, .. } => Some(command),
            _ => None,
        }
    }

    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a CubeSpec)) {
        f(self);
        for input in self.inputs() {
            input.visit(f);
        }
    }
}

/// Versioned envelope around a graph description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedCube {
    /// Format version
    pub version: String,
    /// Root node
    pub root: CubeSpec,
}

impl SerializedCube {
    /// Current format version.
    pub const VERSION: &'static str = "1.0.0";

    /// Wrap a description.
    pub fn new(root: CubeSpec) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            root,
        }
    }

    /// Describe the graph rooted at `cube`.
    pub fn from_cube(cube: &dyn Cube) -> Self {
        Self::new(cube.to_spec())
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string.
    ///
    /// Accepts both the envelope and a bare node description.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<SerializedCube>(json) {
            Ok(graph) => Ok(graph),
            Err(envelope_error) => serde_json::from_str::<CubeSpec>(json)
                .map(Self::new)
                .map_err(|_| envelope_error),
        }
    }

    /// Serialize to compact JSON (no whitespace).
    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reducer::Reducer;
    use crate::core::view::tests::test_view;
    use crate::core::view::ChunkShape;
    use crate::cubes::{CubeRef, DummyCube, ReduceTimeCube, StreamCube};
    use std::sync::Arc;

    fn dummy_spec() -> CubeSpec {
        CubeSpec::Dummy {
            view: test_view(4, 2, 2, ChunkShape::new(2, 2, 2)),
            bands: 2,
            fill: 1.5,
            nodata: None,
        }
    }

    #[test]
    fn test_serialize_graph() {
        let dummy: CubeRef =
            Arc::new(DummyCube::new(test_view(4, 2, 2, ChunkShape::new(2, 2, 2)), 2, 1.5).unwrap());
        let reduced = ReduceTimeCube::cross(dummy, &[Reducer::Mean], &["band1"]).unwrap();
        let graph = SerializedCube::from_cube(&reduced);

        let json = graph.to_json().unwrap();
        assert!(json.contains("\"type\": \"reduce_time\""));
        assert!(json.contains("\"reducer\": \"mean\""));

        let restored = SerializedCube::from_json(&json).unwrap();
        assert_eq!(restored, graph);
        assert_eq!(restored.version, SerializedCube::VERSION);
    }

    #[test]
    fn test_bare_spec_and_defaults() {
        let json = r#"{
            "type": "fill_time",
            "input": {
                "type": "apply_pixel",
                "input": {"type": "collection_missing"},
                "expressions": ["band1 * 2"]
            }
        }"#;
        assert!(SerializedCube::from_json(json).is_err());

        let inner = serde_json::to_value(dummy_spec()).unwrap();
        let json = serde_json::json!({
            "type": "fill_time",
            "input": {"type": "apply_pixel", "input": inner, "expressions": ["band1 * 2"]}
        })
        .to_string();
        let graph = SerializedCube::from_json(&json).unwrap();
        match &graph.root {
            CubeSpec::FillTime { input, method } => {
                assert_eq!(*method, FillMethod::Linear);
                assert!(matches!(
                    input.as_ref(),
                    CubeSpec::ApplyPixel { keep_bands: false, names, .. } if names.is_empty()
                ));
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_graph_queries_and_timeout() {
        let input: CubeRef =
            Arc::new(DummyCube::new(test_view(4, 2, 2, ChunkShape::new(2, 2, 2)), 1, 0.0).unwrap());
        let stream = StreamCube::new(input, StreamCommand::new("cat"), None).unwrap();
        let mut spec = CubeSpec::JoinBands {
            left: Box::new(dummy_spec()),
            right: Box::new(stream.to_spec()),
            prefix_left: Some("a".into()),
            prefix_right: None,
        };
        assert!(spec.is_streaming());
        assert!(!dummy_spec().is_streaming());
        assert_eq!(spec.inputs().len(), 2);
        assert!(spec.collections().is_empty());

        spec.apply_stream_timeout(5.0);
        match &spec {
            CubeSpec::JoinBands { right, .. } => match right.as_ref() {
                CubeSpec::Stream { command, .. } => assert_eq!(command.timeout_secs, Some(5.0)),
                other => panic!("unexpected node {:?}", other),
            },
            other => panic!("unexpected root {:?}", other),
        }
    }
}
