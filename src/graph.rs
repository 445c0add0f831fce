//! Minimal model graph: named inputs, outputs, operator nodes and
//! initializers.
//!
//! Graphs are stored as JSON documents. Initializer data is either embedded in
//! the document or stored in external data files in the same directory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::{load_error, LoadError, LoadErrorImpl};
use crate::external_data::{
    dir_path_from_model_path, DataLoader, DataLocation, DataSlice, ExternalDataError, FileLoader,
};
use crate::prepack::{PrepackKey, PREPACK_SEPARATOR};

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Int64,
    Int32,
    Int8,
    UInt8,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Int64 => 8,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
        }
    }
}

/// Tensor shape.
pub type Shape = SmallVec<[usize; 4]>;

/// Storage for an initializer's data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    /// Data embedded in the graph document.
    Inline(Vec<u8>),

    /// Data stored in an external file.
    External(DataLocation),
}

/// A named constant tensor in a graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub dtype: DataType,
    pub shape: Shape,
    pub data: TensorData,
}

impl Initializer {
    /// Create an initializer with data embedded in the graph.
    pub fn inline(name: &str, dtype: DataType, shape: &[usize], data: Vec<u8>) -> Initializer {
        Initializer {
            name: name.to_string(),
            dtype,
            shape: shape.into(),
            data: TensorData::Inline(data),
        }
    }

    /// Create an initializer whose data is stored at `location`.
    pub fn external(
        name: &str,
        dtype: DataType,
        shape: &[usize],
        location: DataLocation,
    ) -> Initializer {
        Initializer {
            name: name.to_string(),
            dtype,
            shape: shape.into(),
            data: TensorData::External(location),
        }
    }

    /// Return the number of elements in the tensor.
    pub fn numel(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, size| acc.checked_mul(*size))
    }

    /// Return the length of the tensor data in bytes.
    pub fn data_len(&self) -> u64 {
        match &self.data {
            TensorData::Inline(data) => data.len() as u64,
            TensorData::External(location) => location.length,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.data, TensorData::External(_))
    }

    /// Return the external location of the data, if stored externally.
    pub fn location(&self) -> Option<&DataLocation> {
        match &self.data {
            TensorData::External(location) => Some(location),
            TensorData::Inline(_) => None,
        }
    }
}

/// An operator node in a graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,

    /// Names of input values. An empty name indicates an omitted optional
    /// input.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Node {
    pub fn new(name: &str, op_type: &str, inputs: &[&str], outputs: &[&str]) -> Node {
        let to_vec =
            |names: &[&str]| -> Vec<String> { names.iter().map(|n| n.to_string()).collect() };
        Node {
            name: name.to_string(),
            op_type: op_type.to_string(),
            inputs: to_vec(inputs),
            outputs: to_vec(outputs),
        }
    }
}

/// Bytes of an initializer, either borrowed from the graph or loaded from an
/// external data file.
pub enum TensorBytes<'a> {
    Borrowed(&'a [u8]),
    Loaded(DataSlice),
}

impl Deref for TensorBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            TensorBytes::Borrowed(data) => data,
            TensorBytes::Loaded(slice) => slice.data(),
        }
    }
}

/// A model graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    inputs: Vec<String>,

    #[serde(default)]
    outputs: Vec<String>,

    #[serde(default)]
    nodes: Vec<Node>,

    /// Initializers in the order they appear in the document. This order
    /// determines the layout of external data files written for the graph.
    #[serde(default)]
    initializers: Vec<Initializer>,

    /// Directory that external data file names are resolved against. This is
    /// not serialized.
    #[serde(skip)]
    data_dir: PathBuf,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Load a graph from a JSON document.
    ///
    /// External data referenced by the graph is resolved relative to the
    /// directory containing `path`.
    pub fn load(path: &Path) -> Result<Graph, LoadError> {
        let json = std::fs::read_to_string(path).map_err(LoadErrorImpl::ReadFailed)?;
        let graph = Graph::from_json(&json)?;
        let data_dir = dir_path_from_model_path(path)?;
        Ok(graph.with_data_dir(data_dir))
    }

    /// Parse a graph from a JSON string.
    ///
    /// External data is resolved relative to the current directory unless
    /// changed with [`with_data_dir`](Graph::with_data_dir).
    pub fn from_json(json: &str) -> Result<Graph, LoadError> {
        serde_json::from_str(json).map_err(|err| LoadErrorImpl::ParseFailed(err.into()).into())
    }

    /// Serialize the graph to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the graph as a JSON document to `path`, replacing any existing
    /// file.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()
    }

    /// Add a graph input.
    pub fn add_input(&mut self, name: &str) {
        self.inputs.push(name.to_string());
    }

    /// Add a graph output.
    pub fn add_output(&mut self, name: &str) {
        self.outputs.push(name.to_string());
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn add_initializer(&mut self, init: Initializer) {
        self.initializers.push(init);
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Return the graph's initializers in document order.
    pub fn initializers(&self) -> &[Initializer] {
        &self.initializers
    }

    pub fn find_initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|init| init.name == name)
    }

    /// Return a copy of this graph with its initializers replaced.
    pub fn with_initializers(&self, initializers: Vec<Initializer>) -> Graph {
        Graph {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            nodes: self.nodes.clone(),
            initializers,
            data_dir: self.data_dir.clone(),
        }
    }

    /// Directory that external data file names are resolved against.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Graph {
        self.data_dir = dir.into();
        self
    }

    /// Return a loader for this graph's external data files.
    pub fn data_loader(&self) -> FileLoader {
        FileLoader::new(&self.data_dir)
    }

    /// Return the bytes of `init`, reading them through `loader` if they are
    /// stored externally.
    pub fn initializer_data<'a>(
        &self,
        init: &'a Initializer,
        loader: &impl DataLoader,
    ) -> Result<TensorBytes<'a>, ExternalDataError> {
        match &init.data {
            TensorData::Inline(data) => Ok(TensorBytes::Borrowed(data)),
            TensorData::External(location) => loader.load(location).map(TensorBytes::Loaded),
        }
    }

    /// Check that the graph is well-formed.
    ///
    /// This verifies that initializer names are unique, that data lengths
    /// match the type and shape of each initializer and that every node input
    /// and graph output refers to a known value.
    ///
    /// Node inputs can also be satisfied by a pre-packed initializer named
    /// `{input}:{node_name}`. The data of such initializers may be longer
    /// than their shape implies, but not shorter.
    pub fn resolve(&self) -> Result<(), LoadError> {
        let mut values: FxHashSet<&str> = FxHashSet::default();
        values.extend(self.inputs.iter().map(|s| s.as_str()));

        for init in &self.initializers {
            let name = Some(init.name.as_str());
            if !values.insert(init.name.as_str()) {
                return Err(load_error!(
                    ValidationFailed,
                    name,
                    "duplicate value name"
                ));
            }

            let expected_len = init
                .numel()
                .and_then(|n| n.checked_mul(init.dtype.size()))
                .ok_or_else(|| load_error!(ValidationFailed, name, "tensor size overflows"))?;
            // Pre-packed tensors may carry padding or metadata beyond the
            // elements their shape describes.
            let is_prepacked = PrepackKey::split_name(&init.name).is_some();
            let len_ok = if is_prepacked {
                init.data_len() >= expected_len as u64
            } else {
                init.data_len() == expected_len as u64
            };
            if !len_ok {
                return Err(load_error!(
                    ValidationFailed,
                    name,
                    "data length {} does not match {:?} tensor of shape {:?}",
                    init.data_len(),
                    init.dtype,
                    init.shape.as_slice()
                ));
            }

            if let Some(location) = init.location() {
                if location.end().is_none() {
                    return Err(load_error!(
                        ValidationFailed,
                        name,
                        "external data range overflows"
                    ));
                }
            }
        }

        for node in &self.nodes {
            let name = Some(node.name.as_str());
            for input in node.inputs.iter().filter(|input| !input.is_empty()) {
                let prepacked = format!("{}{}{}", input, PREPACK_SEPARATOR, node.name);
                if !values.contains(input.as_str()) && !values.contains(prepacked.as_str()) {
                    return Err(load_error!(
                        ValidationFailed,
                        name,
                        "unknown input \"{}\"",
                        input
                    ));
                }
            }
            for output in &node.outputs {
                if !values.insert(output.as_str()) {
                    return Err(load_error!(
                        ValidationFailed,
                        name,
                        "output \"{}\" is already defined",
                        output
                    ));
                }
            }
        }

        for output in &self.outputs {
            if !values.contains(output.as_str()) {
                return Err(load_error!(
                    ValidationFailed,
                    Some(output.as_str()),
                    "graph output is not defined"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rten_extdata_testing::{TempDir, TestCases};

    use super::{DataType, Graph, Initializer, Node, TensorData};
    use crate::errors::LoadErrorKind;
    use crate::external_data::DataLocation;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn matmul_graph() -> Graph {
        let mut graph = Graph::new();
        graph.add_input("x");
        graph.add_initializer(Initializer::inline(
            "w",
            DataType::Float32,
            &[2, 2],
            f32_bytes(&[1., 2., 3., 4.]),
        ));
        graph.add_node(Node::new("MatMul_0", "MatMul", &["x", "w"], &["y"]));
        graph.add_output("y");
        graph
    }

    #[test]
    fn test_json_round_trip() {
        let mut graph = matmul_graph();
        graph.add_initializer(Initializer::external(
            "b",
            DataType::Int64,
            &[3],
            DataLocation {
                path: "model.data".into(),
                offset: 64,
                length: 24,
            },
        ));

        let json = graph.to_json().unwrap();
        let parsed = Graph::from_json(&json).unwrap();
        assert_eq!(parsed, graph);
        assert!(json.contains("\"external\""));
        assert!(json.contains("\"float32\""));
    }

    #[test]
    fn test_parse_minimal_document() {
        let graph = Graph::from_json(
            r#"{"initializers": [
                {"name": "a", "dtype": "uint8", "shape": [2], "data": {"inline": [1, 2]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(graph.initializers().len(), 1);
        assert_eq!(graph.initializers()[0].data, TensorData::Inline(vec![1, 2]));
        assert!(graph.nodes().is_empty());

        let err = Graph::from_json("{\"initializers\": 5}").err().unwrap();
        assert_eq!(err.kind(), LoadErrorKind::ParseError);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new("test_graph_save_and_load").unwrap();
        let path = dir.join("model.json");
        let graph = matmul_graph();

        graph.save(&path).unwrap();
        let loaded = Graph::load(&path).unwrap();

        assert_eq!(loaded.initializers(), graph.initializers());
        assert_eq!(
            loaded.data_dir(),
            dir.path().canonicalize().unwrap().as_path()
        );

        let err = Graph::load(&dir.join("missing.json")).err().unwrap();
        assert_eq!(err.kind(), LoadErrorKind::IoError);
    }

    #[test]
    fn test_initializer_data() {
        let dir = TempDir::new("test_initializer_data").unwrap();
        std::fs::write(dir.join("model.data"), [0, 1, 2, 3, 4, 5]).unwrap();

        let mut graph = matmul_graph();
        graph.add_initializer(Initializer::external(
            "ext",
            DataType::UInt8,
            &[4],
            DataLocation {
                path: "model.data".into(),
                offset: 2,
                length: 4,
            },
        ));
        let graph = graph.with_data_dir(dir.path());
        let loader = graph.data_loader();

        let ext = graph.find_initializer("ext").unwrap();
        assert_eq!(&*graph.initializer_data(ext, &loader).unwrap(), &[2, 3, 4, 5]);

        let w = graph.find_initializer("w").unwrap();
        assert_eq!(graph.initializer_data(w, &loader).unwrap().len(), 16);
    }

    #[test]
    fn test_resolve() {
        #[derive(Debug)]
        struct Case {
            graph: Graph,
            expected_error: Option<&'static str>,
        }

        let with_init = |init: Initializer| {
            let mut graph = matmul_graph();
            graph.add_initializer(init);
            graph
        };
        let prepacked = matmul_graph().with_initializers(vec![Initializer::inline(
            "w:MatMul_0",
            DataType::UInt8,
            &[178],
            vec![0; 178],
        )]);
        let padded_prepacked = matmul_graph().with_initializers(vec![Initializer::inline(
            "w:MatMul_0",
            DataType::Float32,
            &[25],
            vec![0; 178],
        )]);
        let short_prepacked = matmul_graph().with_initializers(vec![Initializer::inline(
            "w:MatMul_0",
            DataType::Float32,
            &[25],
            vec![0; 96],
        )]);
        let mut unknown_input = matmul_graph();
        unknown_input.add_node(Node::new("Add_1", "Add", &["y", "bias"], &["z"]));
        let mut optional_input = matmul_graph();
        optional_input.add_node(Node::new("Clip_1", "Clip", &["y", "", ""], &["z"]));
        let mut undefined_output = matmul_graph();
        undefined_output.add_output("z");

        let cases = [
            Case {
                graph: matmul_graph(),
                expected_error: None,
            },
            Case {
                graph: prepacked,
                expected_error: None,
            },
            Case {
                graph: padded_prepacked,
                expected_error: None,
            },
            Case {
                graph: short_prepacked,
                expected_error: Some("data length 96 does not match Float32 tensor of shape [25]"),
            },
            Case {
                graph: optional_input,
                expected_error: None,
            },
            Case {
                graph: with_init(Initializer::inline("w", DataType::UInt8, &[1], vec![0])),
                expected_error: Some("in \"w\": invalid graph: duplicate value name"),
            },
            Case {
                graph: with_init(Initializer::inline("c", DataType::Int32, &[2], vec![0; 7])),
                expected_error: Some("data length 7 does not match Int32 tensor of shape [2]"),
            },
            Case {
                graph: unknown_input,
                expected_error: Some("unknown input \"bias\""),
            },
            Case {
                graph: undefined_output,
                expected_error: Some("in \"z\": invalid graph: graph output is not defined"),
            },
        ];

        cases.test_each(|case| {
            let result = case.graph.resolve();
            match (result, case.expected_error) {
                (Ok(()), None) => {}
                (Err(err), Some(expected)) => {
                    assert_eq!(err.kind(), LoadErrorKind::ValidationError);
                    assert!(
                        err.to_string().contains(expected),
                        "\"{}\" does not contain \"{}\"",
                        err,
                        expected
                    );
                }
                (result, expected) => panic!("expected {:?} got {:?}", expected, result),
            }
        })
    }
}
