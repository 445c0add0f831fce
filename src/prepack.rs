//! Pre-packed replacements for initializers.
//!
//! Operators such as MatMul can pre-pack their weights into a layout suited to
//! a particular kernel. When a graph is saved, these pre-packed tensors can
//! be written in place of the original weights, so the work does not need to
//! be repeated when the graph is loaded again.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{LoadError, LoadErrorImpl};
use crate::graph::{DataType, Shape};

/// Separator between the original initializer name and the consumer key in
/// the names of pre-packed initializers.
pub const PREPACK_SEPARATOR: char = ':';

/// Identifies a pre-packed tensor by the name of the original initializer and
/// the consumer (usually an operator node name) it was packed for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrepackKey {
    pub name: String,
    pub consumer: String,
}

impl PrepackKey {
    pub fn new(name: &str, consumer: &str) -> PrepackKey {
        PrepackKey {
            name: name.to_string(),
            consumer: consumer.to_string(),
        }
    }

    /// Return the name of the initializer that holds this tensor in a saved
    /// graph, ie. `{name}:{consumer}`.
    pub fn initializer_name(&self) -> String {
        format!("{}{}{}", self.name, PREPACK_SEPARATOR, self.consumer)
    }

    /// Split an initializer name into the original name and consumer key.
    ///
    /// Returns `None` if `name` contains no separator.
    pub fn split_name(name: &str) -> Option<(&str, &str)> {
        name.split_once(PREPACK_SEPARATOR)
    }
}

/// Return the name of the original initializer for an initializer in a
/// saved graph, by removing any consumer suffix.
pub fn original_name(name: &str) -> &str {
    PrepackKey::split_name(name).map_or(name, |(original, _)| original)
}

/// A pre-packed tensor. This has its own type and shape, which may differ
/// from the original initializer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrepackedTensor {
    pub dtype: DataType,
    pub shape: Shape,
    pub data: Vec<u8>,
}

impl PrepackedTensor {
    pub fn new(dtype: DataType, shape: &[usize], data: Vec<u8>) -> PrepackedTensor {
        PrepackedTensor {
            dtype,
            shape: shape.into(),
            data,
        }
    }

    /// Create a zero-filled tensor with a given type and shape.
    pub fn zeros(dtype: DataType, shape: &[usize]) -> PrepackedTensor {
        let len = shape.iter().product::<usize>() * dtype.size();
        PrepackedTensor::new(dtype, shape, vec![0; len])
    }
}

/// A pre-packed tensor for one consumer of an initializer.
#[derive(Clone, Debug, PartialEq)]
pub struct PrepackedEntry {
    pub consumer: String,
    pub tensor: PrepackedTensor,
}

/// Entry in the JSON representation of a [`PrepackTable`].
#[derive(Deserialize)]
struct EntryDoc {
    name: String,
    consumer: String,
    #[serde(flatten)]
    tensor: PrepackedTensor,
}

/// Table of pre-packed tensors, keyed by original initializer name.
#[derive(Clone, Debug, Default)]
pub struct PrepackTable {
    entries: FxHashMap<String, Vec<PrepackedEntry>>,
}

impl PrepackTable {
    pub fn new() -> PrepackTable {
        PrepackTable::default()
    }

    /// Register a pre-packed tensor for initializer `name` and consumer
    /// `consumer`.
    ///
    /// Entries for the same initializer are kept in insertion order. If an
    /// entry already exists for the same consumer it is replaced in place.
    pub fn insert(&mut self, name: &str, consumer: &str, tensor: PrepackedTensor) {
        let entries = self.entries.entry(name.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.consumer == consumer) {
            entry.tensor = tensor;
        } else {
            entries.push(PrepackedEntry {
                consumer: consumer.to_string(),
                tensor,
            });
        }
    }

    /// Return the pre-packed tensors for initializer `name`, in insertion
    /// order.
    pub fn lookup(&self, name: &str) -> &[PrepackedEntry] {
        self.entries.get(name).map(|e| e.as_slice()).unwrap_or(&[])
    }

    /// Return the total number of pre-packed tensors.
    pub fn len(&self) -> usize {
        self.entries.values().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a table from a JSON array of entries.
    ///
    /// Each entry has the form `{"name": ..., "consumer": ..., "dtype": ...,
    /// "shape": [...], "data": [...]}`.
    pub fn from_json(json: &str) -> Result<PrepackTable, LoadError> {
        let docs: Vec<EntryDoc> =
            serde_json::from_str(json).map_err(|err| LoadErrorImpl::ParseFailed(err.into()))?;
        let mut table = PrepackTable::new();
        for doc in docs {
            table.insert(&doc.name, &doc.consumer, doc.tensor);
        }
        Ok(table)
    }

    /// Load a table from a JSON file. See [`from_json`](Self::from_json).
    pub fn load(path: &Path) -> Result<PrepackTable, LoadError> {
        let json = std::fs::read_to_string(path).map_err(LoadErrorImpl::ReadFailed)?;
        PrepackTable::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use rten_extdata_testing::TestCases;

    use super::{original_name, PrepackKey, PrepackTable, PrepackedTensor};
    use crate::errors::LoadErrorKind;
    use crate::graph::DataType;

    #[test]
    fn test_lookup() {
        let mut table = PrepackTable::new();
        assert!(table.is_empty());
        assert!(table.lookup("weight").is_empty());

        table.insert("weight", "B", PrepackedTensor::zeros(DataType::UInt8, &[4]));
        table.insert("weight", "A", PrepackedTensor::zeros(DataType::UInt8, &[8]));
        table.insert("scales", "A", PrepackedTensor::zeros(DataType::Float32, &[2]));

        let consumers: Vec<_> = table
            .lookup("weight")
            .iter()
            .map(|e| e.consumer.as_str())
            .collect();
        assert_eq!(consumers, ["B", "A"]);
        assert_eq!(table.len(), 3);

        let scales = table.lookup("scales");
        assert_eq!(scales.len(), 1);
        assert_eq!(scales[0].tensor.data.len(), 8);
    }

    #[test]
    fn test_insert_replaces_existing_consumer() {
        let mut table = PrepackTable::new();
        table.insert("w", "A", PrepackedTensor::zeros(DataType::UInt8, &[4]));
        table.insert("w", "B", PrepackedTensor::zeros(DataType::UInt8, &[4]));
        table.insert("w", "A", PrepackedTensor::zeros(DataType::UInt8, &[16]));

        let entries = table.lookup("w");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].consumer, "A");
        assert_eq!(entries[0].tensor.data.len(), 16);
    }

    #[test]
    fn test_names() {
        #[derive(Debug)]
        struct Case {
            name: &'static str,
            original: &'static str,
            split: Option<(&'static str, &'static str)>,
        }

        let cases = [
            Case {
                name: "MatMul.Weight:MatMul_0",
                original: "MatMul.Weight",
                split: Some(("MatMul.Weight", "MatMul_0")),
            },
            Case {
                name: "scales",
                original: "scales",
                split: None,
            },
            // Only the first separator is significant.
            Case {
                name: "a:b:c",
                original: "a",
                split: Some(("a", "b:c")),
            },
        ];

        cases.test_each(|case| {
            assert_eq!(original_name(case.name), case.original);
            assert_eq!(PrepackKey::split_name(case.name), case.split);
        });

        assert_eq!(
            PrepackKey::new("MatMul.Weight", "MatMul_0").initializer_name(),
            "MatMul.Weight:MatMul_0"
        );
    }

    #[test]
    fn test_from_json() {
        let table = PrepackTable::from_json(
            r#"[
                {"name": "w", "consumer": "MatMul_0", "dtype": "uint8", "shape": [3], "data": [1, 2, 3]},
                {"name": "w", "consumer": "MatMul_1", "dtype": "int8", "shape": [1], "data": [4]}
            ]"#,
        )
        .unwrap();

        let entries = table.lookup("w");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].tensor,
            PrepackedTensor::new(DataType::UInt8, &[3], vec![1, 2, 3])
        );
        assert_eq!(entries[1].consumer, "MatMul_1");

        let err = PrepackTable::from_json("{}").err().unwrap();
        assert_eq!(err.kind(), LoadErrorKind::ParseError);
    }
}
