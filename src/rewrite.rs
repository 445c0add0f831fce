//! Rewriting a graph so that large initializers are stored in an external
//! data file.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;

use crate::align::AlignmentInfo;
use crate::env::{env_flag, VERBOSE_VAR};
use crate::errors::{ConfigError, RewriteError};
use crate::external_data::is_allowed_external_data_path;
use crate::graph::{DataType, Graph, Initializer, Shape, TensorBytes, TensorData};
use crate::prepack::{PrepackKey, PrepackTable, PrepackedEntry};
use crate::writer::ExternalDataWriter;

/// Options that control how initializers are saved.
#[derive(Clone, Debug, PartialEq)]
pub struct RewriteConfig {
    /// Initializers with at least this many bytes are stored externally.
    /// Smaller initializers are embedded in the graph.
    pub size_threshold: u64,

    /// Alignment of tensor data in the external data file.
    pub alignment: AlignmentInfo,

    /// Replace initializers with pre-packed tensors, where available.
    pub apply_prepacked: bool,

    /// Log where each initializer is stored.
    pub verbose: bool,
}

impl RewriteConfig {
    /// Default value for [`size_threshold`](RewriteConfig::size_threshold).
    pub const DEFAULT_SIZE_THRESHOLD: u64 = 1024;

    pub fn with_size_threshold(mut self, threshold: u64) -> Self {
        self.size_threshold = threshold;
        self
    }

    pub fn with_alignment(mut self, alignment: AlignmentInfo) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_prepacked(mut self, apply: bool) -> Self {
        self.apply_prepacked = apply;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.alignment.validate()
    }

    /// Return true if an initializer of `len` bytes should be stored
    /// externally.
    pub fn is_external(&self, len: u64) -> bool {
        len >= self.size_threshold
    }
}

impl Default for RewriteConfig {
    /// Return the default configuration.
    ///
    /// Verbose logging can be enabled by setting the `RTEN_EXTDATA_VERBOSE`
    /// environment variable.
    fn default() -> Self {
        RewriteConfig {
            size_threshold: Self::DEFAULT_SIZE_THRESHOLD,
            alignment: AlignmentInfo::default(),
            apply_prepacked: false,
            verbose: env_flag(VERBOSE_VAR, false),
        }
    }
}

enum UnitData<'a> {
    /// Data of the original initializer.
    Original(&'a Initializer),

    /// Data of a pre-packed replacement.
    Prepacked(&'a [u8]),
}

/// An initializer to be written to the rewritten graph.
struct EmissionUnit<'a> {
    name: String,
    dtype: DataType,
    shape: &'a Shape,
    data: UnitData<'a>,
}

/// Determine the initializers to write, in output order, and check that their
/// names are unique.
fn plan<'a>(
    graph: &'a Graph,
    config: &RewriteConfig,
    prepacked: &'a PrepackTable,
) -> Result<Vec<EmissionUnit<'a>>, RewriteError> {
    let mut units = Vec::with_capacity(graph.initializers().len());

    for init in graph.initializers() {
        let entries: &[PrepackedEntry] = if config.apply_prepacked {
            prepacked.lookup(&init.name)
        } else {
            &[]
        };

        if entries.is_empty() {
            units.push(EmissionUnit {
                name: init.name.clone(),
                dtype: init.dtype,
                shape: &init.shape,
                data: UnitData::Original(init),
            });
        }

        for entry in entries {
            units.push(EmissionUnit {
                name: PrepackKey::new(&init.name, &entry.consumer).initializer_name(),
                dtype: entry.tensor.dtype,
                shape: &entry.tensor.shape,
                data: UnitData::Prepacked(&entry.tensor.data),
            });
        }
    }

    let mut names = FxHashSet::default();
    for unit in &units {
        if !names.insert(unit.name.as_str()) {
            return Err(RewriteError::DuplicateName(unit.name.clone()));
        }
    }

    Ok(units)
}

/// Write the data for `units` and return the rewritten initializers.
fn write_units(
    graph: &Graph,
    units: &[EmissionUnit],
    config: &RewriteConfig,
    mut writer: ExternalDataWriter,
) -> Result<Vec<Initializer>, RewriteError> {
    let loader = graph.data_loader();
    let mut initializers = Vec::with_capacity(units.len());

    for unit in units {
        let bytes = match unit.data {
            UnitData::Original(init) => graph.initializer_data(init, &loader).map_err(|error| {
                RewriteError::DataError {
                    name: init.name.clone(),
                    error,
                }
            })?,
            UnitData::Prepacked(data) => TensorBytes::Borrowed(data),
        };
        let len = bytes.len() as u64;

        let init = if config.is_external(len) {
            let prev_end = writer.position();
            let location = writer.write(&bytes, &config.alignment)?;
            if config.verbose {
                println!(
                    "Initializer \"{}\" ({} bytes) stored in \"{}\" at offset {} (padding {})",
                    unit.name,
                    len,
                    location.path,
                    location.offset,
                    location.offset - prev_end,
                );
            }
            Initializer {
                name: unit.name.clone(),
                dtype: unit.dtype,
                shape: unit.shape.clone(),
                data: TensorData::External(location),
            }
        } else {
            if config.verbose {
                println!("Initializer \"{}\" ({} bytes) stored inline", unit.name, len);
            }
            Initializer {
                name: unit.name.clone(),
                dtype: unit.dtype,
                shape: unit.shape.clone(),
                data: TensorData::Inline(bytes.to_vec()),
            }
        };
        initializers.push(init);
    }

    let file_name = writer.file_name().to_string();
    let data_len = writer.finish()?;
    if config.verbose {
        let n_external = initializers.iter().filter(|i| i.is_external()).count();
        println!(
            "Saved {} initializers, {} external. \"{}\" is {} bytes",
            initializers.len(),
            n_external,
            file_name,
            data_len
        );
    }

    Ok(initializers)
}

/// Return true if any initializer in `graph` has data stored in the file at
/// `path`.
fn reads_from(graph: &Graph, path: &Path) -> bool {
    let Ok(target) = path.canonicalize() else {
        return false;
    };
    graph
        .initializers()
        .iter()
        .filter_map(|init| init.location())
        .any(|location| {
            graph
                .data_dir()
                .join(&location.path)
                .canonicalize()
                .is_ok_and(|source| source == target)
        })
}

/// Rewrite the initializers of `graph` so that those with at least
/// `config.size_threshold` bytes are stored in the external data file
/// `data_path`.
///
/// If `config.apply_prepacked` is set, initializers with entries in
/// `prepacked` are replaced by one initializer per entry, named
/// `{name}:{consumer}`. Initializers without entries are kept under their
/// original name.
///
/// Initializers are written in graph order, so the result is deterministic.
/// `data_path` is created or truncated. It must not be a file that `graph`
/// reads data from. The configuration and initializer names are checked
/// before it is created, and it is removed again if writing fails.
///
/// Returns the rewritten graph, whose external data is resolved relative to
/// the directory of `data_path`, and the path of the data file.
pub fn rewrite(
    graph: &Graph,
    config: &RewriteConfig,
    prepacked: &PrepackTable,
    data_path: &Path,
) -> Result<(Graph, PathBuf), RewriteError> {
    config.validate()?;
    let file_name = data_path.file_name().map(Path::new);
    if !file_name.is_some_and(is_allowed_external_data_path) {
        return Err(ConfigError::InvalidDataPath(data_path.to_path_buf()).into());
    }

    if reads_from(graph, data_path) {
        return Err(ConfigError::DataPathInUse(data_path.to_path_buf()).into());
    }

    let units = plan(graph, config, prepacked)?;

    let writer = ExternalDataWriter::create(data_path)?;
    let initializers = match write_units(graph, &units, config, writer) {
        Ok(inits) => inits,
        Err(err) => {
            // A partially written file is not valid output.
            let _ = std::fs::remove_file(data_path);
            return Err(err);
        }
    };

    let data_dir = data_path.parent().unwrap_or(Path::new(""));
    let rewritten = graph
        .with_initializers(initializers)
        .with_data_dir(data_dir);
    Ok((rewritten, data_path.to_path_buf()))
}

/// Save `graph` to `model_path`, with large initializers stored in
/// `data_file_name` in the same directory.
///
/// See [`rewrite`] for details of how initializers are stored. Existing files
/// at either path are replaced. The graph and data files must have different
/// names.
pub fn save_with_external_data(
    graph: &Graph,
    model_path: &Path,
    data_file_name: &str,
    config: &RewriteConfig,
    prepacked: &PrepackTable,
) -> Result<Graph, RewriteError> {
    if !is_allowed_external_data_path(Path::new(data_file_name)) {
        return Err(ConfigError::InvalidDataPath(data_file_name.into()).into());
    }
    let model_dir = model_path
        .parent()
        .ok_or_else(|| ConfigError::InvalidDataPath(model_path.to_path_buf()))?;
    let data_path = model_dir.join(data_file_name);
    if model_path.file_name() == data_path.file_name() {
        return Err(ConfigError::InvalidDataPath(data_path).into());
    }

    let (rewritten, data_path) = rewrite(graph, config, prepacked, &data_path)?;
    if let Err(err) = rewritten.save(model_path) {
        let _ = std::fs::remove_file(&data_path);
        return Err(err.into());
    }

    Ok(rewritten)
}
