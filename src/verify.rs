//! Verification that a rewritten graph preserves the initializers of the
//! original.

use std::error::Error;
use std::fmt::{Display, Formatter};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::ConfigError;
use crate::external_data::{DataLoader, ExternalDataError};
use crate::graph::{Graph, Initializer};
use crate::prepack::{original_name, PrepackKey};
use crate::rewrite::RewriteConfig;

/// The rule that a rewritten graph violated.
#[derive(Debug)]
pub enum VerifyErrorKind {
    /// A rewritten initializer has no counterpart in the original graph.
    OrphanInitializer,

    /// More than one rewritten initializer has this name.
    DuplicateName,

    /// The initializer is stored inline when it should be external, or vice
    /// versa.
    LocationMismatch {
        /// Whether the initializer is stored externally.
        external: bool,
        len: u64,
        threshold: u64,
    },

    /// The data differs from the original.
    DataMismatch {
        original_len: u64,
        rewritten_len: u64,
        /// Offset of the first differing byte, if the lengths match.
        first_difference: Option<usize>,
    },

    /// A pre-packed tensor is smaller than the initializer it replaces.
    PrepackSizeViolation { original_len: u64, packed_len: u64 },

    /// External data is not aligned to the allocation granularity.
    OffsetMisaligned { offset: u64, granularity: u64 },

    /// The number of original initializers does not match the number of
    /// distinct originals referenced by the rewritten graph.
    CountMismatch { original: usize, rewritten: usize },

    /// Initializer data could not be read.
    DataError(ExternalDataError),

    /// The alignment configuration is invalid.
    InvalidConfig(ConfigError),
}

/// Error returned by [`verify`].
#[derive(Debug)]
pub struct VerifyError {
    initializer: Option<String>,
    kind: VerifyErrorKind,
}

impl VerifyError {
    fn new(initializer: Option<&str>, kind: VerifyErrorKind) -> VerifyError {
        VerifyError {
            initializer: initializer.map(|s| s.to_string()),
            kind,
        }
    }

    /// Name of the rewritten initializer that failed verification, or `None`
    /// for errors about the graph as a whole.
    pub fn initializer(&self) -> Option<&str> {
        self.initializer.as_deref()
    }

    pub fn kind(&self) -> &VerifyErrorKind {
        &self.kind
    }
}

impl Display for VerifyErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrphanInitializer => write!(f, "no matching initializer in original graph"),
            Self::DuplicateName => write!(f, "initializer name is not unique"),
            Self::LocationMismatch {
                external,
                len,
                threshold,
            } => write!(
                f,
                "location mismatch. {} bytes stored {} with threshold {}",
                len,
                if *external { "externally" } else { "inline" },
                threshold
            ),
            Self::DataMismatch {
                original_len,
                rewritten_len,
                first_difference,
            } => match first_difference {
                Some(pos) => write!(f, "data mismatch at byte {}", pos),
                None => write!(
                    f,
                    "data mismatch. original has {} bytes, rewritten has {}",
                    original_len, rewritten_len
                ),
            },
            Self::PrepackSizeViolation {
                original_len,
                packed_len,
            } => write!(
                f,
                "pre-packed tensor has {} bytes, smaller than original {}",
                packed_len, original_len
            ),
            Self::OffsetMisaligned {
                offset,
                granularity,
            } => write!(
                f,
                "offset {} is not a multiple of {}",
                offset, granularity
            ),
            Self::CountMismatch {
                original,
                rewritten,
            } => write!(
                f,
                "count mismatch. original has {} initializers, rewritten graph has {}",
                original, rewritten
            ),
            Self::DataError(err) => write!(f, "failed to read data: {}", err),
            Self::InvalidConfig(err) => write!(f, "invalid config: {}", err),
        }
    }
}

impl Display for VerifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = self.initializer.as_deref() {
            write!(f, "initializer \"{}\": {}", name, self.kind)
        } else {
            self.kind.fmt(f)
        }
    }
}

impl Error for VerifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            VerifyErrorKind::DataError(err) => Some(err),
            VerifyErrorKind::InvalidConfig(err) => Some(err),
            _ => None,
        }
    }
}

/// Check that `rewritten` is a valid result of saving `original` with
/// `config`.
///
/// `applied_prepack` indicates whether pre-packed replacements were applied,
/// in which case rewritten initializers named `{name}:{consumer}` are matched
/// with original initializer `name` and only need to be at least as large as
/// it. All other initializers must match the original byte-for-byte.
///
/// External data is read with each graph's [`data_loader`](Graph::data_loader).
/// The first violation found is returned.
pub fn verify(
    original: &Graph,
    rewritten: &Graph,
    config: &RewriteConfig,
    applied_prepack: bool,
) -> Result<(), VerifyError> {
    verify_with_loaders(
        original,
        rewritten,
        config,
        applied_prepack,
        &original.data_loader(),
        &rewritten.data_loader(),
    )
}

/// Variant of [`verify`] which reads external data for the original and
/// rewritten graphs through the given loaders.
pub fn verify_with_loaders(
    original: &Graph,
    rewritten: &Graph,
    config: &RewriteConfig,
    applied_prepack: bool,
    original_loader: &impl DataLoader,
    rewritten_loader: &impl DataLoader,
) -> Result<(), VerifyError> {
    config
        .validate()
        .map_err(|err| VerifyError::new(None, VerifyErrorKind::InvalidConfig(err)))?;

    let originals: FxHashMap<&str, &Initializer> = original
        .initializers()
        .iter()
        .map(|init| (init.name.as_str(), init))
        .collect();
    let mut matched_names: FxHashSet<&str> = FxHashSet::default();
    let mut rewritten_names: FxHashSet<&str> = FxHashSet::default();

    for init in rewritten.initializers() {
        let name = init.name.as_str();
        let fail = |kind| Err(VerifyError::new(Some(name), kind));

        if !rewritten_names.insert(name) {
            return fail(VerifyErrorKind::DuplicateName);
        }

        let data = rewritten
            .initializer_data(init, rewritten_loader)
            .map_err(|err| VerifyError::new(Some(name), VerifyErrorKind::DataError(err)))?;
        let len = data.len() as u64;

        let is_prepacked = applied_prepack && PrepackKey::split_name(name).is_some();
        let orig_name = if applied_prepack {
            original_name(name)
        } else {
            name
        };
        let Some(orig_init) = originals.get(orig_name) else {
            return fail(VerifyErrorKind::OrphanInitializer);
        };
        matched_names.insert(orig_name);

        if init.is_external() != config.is_external(len) {
            return fail(VerifyErrorKind::LocationMismatch {
                external: init.is_external(),
                len,
                threshold: config.size_threshold,
            });
        }

        if is_prepacked {
            let original_len = orig_init.data_len();
            if len < original_len {
                return fail(VerifyErrorKind::PrepackSizeViolation {
                    original_len,
                    packed_len: len,
                });
            }
        } else {
            let orig_data = original
                .initializer_data(orig_init, original_loader)
                .map_err(|err| VerifyError::new(Some(name), VerifyErrorKind::DataError(err)))?;
            if *orig_data != *data {
                let first_difference = if orig_data.len() == data.len() {
                    orig_data.iter().zip(data.iter()).position(|(a, b)| a != b)
                } else {
                    None
                };
                return fail(VerifyErrorKind::DataMismatch {
                    original_len: orig_data.len() as u64,
                    rewritten_len: len,
                    first_difference,
                });
            }
        }

        if let Some(location) = init.location() {
            let align = &config.alignment;
            if align.applies_to(len) && location.offset % align.allocation_granularity != 0 {
                return fail(VerifyErrorKind::OffsetMisaligned {
                    offset: location.offset,
                    granularity: align.allocation_granularity,
                });
            }
        }

        if config.verbose {
            println!(
                "Verified initializer \"{}\" ({} bytes, {})",
                name,
                len,
                if init.is_external() {
                    "external"
                } else {
                    "inline"
                }
            );
        }
    }

    if originals.len() != matched_names.len() {
        return Err(VerifyError::new(
            None,
            VerifyErrorKind::CountMismatch {
                original: originals.len(),
                rewritten: matched_names.len(),
            },
        ));
    }

    Ok(())
}
