//! rten-extdata saves model graphs with their initializers (weights and other
//! constant tensors) split between the graph file and an external data file.
//!
//! # Saving a graph
//!
//! The basic workflow is:
//!
//! 1. Load the graph using [`Graph::load`].
//! 2. Choose a [`RewriteConfig`]. Initializers with at least
//!    [`size_threshold`](RewriteConfig::size_threshold) bytes are written to
//!    the external data file. Smaller ones stay inline in the graph.
//! 3. Call [`save_with_external_data`], or [`rewrite`] to produce the
//!    rewritten graph without saving it.
//! 4. Optionally check the result with [`verify`].
//!
//! External data files are written sequentially in graph order, so saving the
//! same graph with the same configuration produces identical files.
//!
//! # Alignment
//!
//! When [`AlignmentInfo::align_offset`] is set, tensors of at least
//! [`align_threshold`](AlignmentInfo::align_threshold) bytes are padded so
//! their offsets are multiples of the
//! [`allocation_granularity`](AlignmentInfo::allocation_granularity). This
//! allows them to be memory-mapped directly on platforms where mappings must
//! start at such boundaries.
//!
//! # Pre-packed weights
//!
//! Operators can prepare initializers in a kernel-specific layout. If
//! [`RewriteConfig::apply_prepacked`] is set, entries in a [`PrepackTable`]
//! are saved in place of the original initializer, under the name
//! `{name}:{consumer}`.
//!
//! # Crate features
//!
//! - `mmap` enables [`MmapLoader`], which reads external data via memory
//!   mapping instead of copying it into memory.

mod align;
mod env;
mod errors;
mod external_data;
mod graph;
mod prepack;
mod rewrite;
mod verify;
mod writer;

pub use align::{compute_offset, AlignmentInfo};
pub use env::VERBOSE_VAR;
pub use errors::{ConfigError, LoadError, LoadErrorKind, RewriteError};
#[cfg(feature = "mmap")]
pub use external_data::MmapLoader;
pub use external_data::{
    is_allowed_external_data_path, DataLoader, DataLocation, DataSlice, DataStorage,
    ExternalDataError, FileLoader,
};
pub use graph::{DataType, Graph, Initializer, Node, Shape, TensorBytes, TensorData};
pub use prepack::{
    original_name, PrepackKey, PrepackTable, PrepackedEntry, PrepackedTensor, PREPACK_SEPARATOR,
};
pub use rewrite::{rewrite, save_with_external_data, RewriteConfig};
pub use verify::{verify, verify_with_loaders, VerifyError, VerifyErrorKind};
pub use writer::ExternalDataWriter;
