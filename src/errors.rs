use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::external_data::ExternalDataError;

/// Errors in a rewrite or alignment configuration.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// Offset alignment is enabled but the allocation granularity is zero.
    ZeroGranularity,

    /// Aligning or advancing an offset would overflow a `u64`.
    OffsetOverflow,

    /// The external data path is not a plain file name, or has no parent
    /// directory to create it in.
    InvalidDataPath(PathBuf),

    /// The external data file would overwrite data that the source graph
    /// reads from.
    DataPathInUse(PathBuf),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroGranularity => {
                write!(f, "allocation granularity must be > 0 when aligning offsets")
            }
            Self::OffsetOverflow => write!(f, "data offset overflows u64"),
            Self::InvalidDataPath(path) => {
                write!(f, "invalid external data path \"{}\"", path.display())
            }
            Self::DataPathInUse(path) => write!(
                f,
                "external data path \"{}\" is used by the source graph",
                path.display()
            ),
        }
    }
}

impl Error for ConfigError {}

/// Errors that occur when loading or validating a graph.
#[derive(Debug)]
pub struct LoadError {
    inner: LoadErrorImpl,
    name: Option<String>,
}

impl LoadError {
    pub(crate) fn new(kind: LoadErrorImpl) -> Self {
        Self {
            inner: kind,
            name: None,
        }
    }

    pub(crate) fn for_name(name: Option<&str>, kind: LoadErrorImpl) -> Self {
        Self {
            inner: kind,
            name: name.map(|n| n.to_string()),
        }
    }

    /// The name of the initializer or node that this error relates to.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Return the category of error.
    pub fn kind(&self) -> LoadErrorKind {
        self.inner.kind()
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = self.name.as_deref() {
            write!(f, "in \"{}\": {}", name, self.inner)
        } else {
            self.inner.fmt(f)
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

impl From<LoadErrorImpl> for LoadError {
    fn from(val: LoadErrorImpl) -> Self {
        Self::new(val)
    }
}

impl From<ExternalDataError> for LoadError {
    fn from(err: ExternalDataError) -> LoadError {
        LoadErrorImpl::ExternalDataError(Box::new(err)).into()
    }
}

/// Categories of error when loading a graph.
///
/// See [`LoadError::kind`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum LoadErrorKind {
    /// An I/O error occurred reading the graph document.
    IoError,

    /// The graph document could not be parsed.
    ParseError,

    /// The graph is structurally invalid.
    ValidationError,

    /// There was a problem reading tensor data from an external file.
    ExternalDataError,
}

#[derive(Debug)]
pub(crate) enum LoadErrorImpl {
    ReadFailed(std::io::Error),
    ParseFailed(Box<dyn Error + Send + Sync>),
    ValidationFailed(Box<dyn Error + Send + Sync>),
    ExternalDataError(Box<dyn Error + Send + Sync>),
}

impl LoadErrorImpl {
    fn kind(&self) -> LoadErrorKind {
        type Kind = LoadErrorKind;

        match self {
            Self::ReadFailed(_) => Kind::IoError,
            Self::ParseFailed(_) => Kind::ParseError,
            Self::ValidationFailed(_) => Kind::ValidationError,
            Self::ExternalDataError(_) => Kind::ExternalDataError,
        }
    }

    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ReadFailed(err) => Some(err),
            Self::ParseFailed(err) => Some(err.as_ref()),
            Self::ValidationFailed(err) => Some(err.as_ref()),
            Self::ExternalDataError(err) => Some(err.as_ref()),
        }
    }
}

impl Display for LoadErrorImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(e) => write!(f, "read error: {e}"),
            Self::ParseFailed(e) => write!(f, "parse error: {e}"),
            Self::ValidationFailed(e) => write!(f, "invalid graph: {e}"),
            Self::ExternalDataError(e) => write!(f, "external data error: {e}"),
        }
    }
}

/// Create a [`LoadError`] that relates to a named initializer or node.
macro_rules! load_error {
    ($kind:ident, $name:expr, $format_str:literal, $($arg:tt)*) => {{
        let err = format!($format_str, $($arg)*);
        LoadError::for_name($name, LoadErrorImpl::$kind(err.into()))
    }};

    ($kind:ident, $name:expr, $err:expr) => {{
        LoadError::for_name($name, LoadErrorImpl::$kind($err.into()))
    }}
}

pub(crate) use load_error;

/// Errors that occur when rewriting a graph's initializers.
#[derive(Debug)]
pub enum RewriteError {
    /// The external data file could not be created or written, or the
    /// rewritten graph could not be saved.
    IoError(std::io::Error),

    /// Two initializers in the rewritten graph would have the same name.
    DuplicateName(String),

    /// The rewrite configuration is invalid.
    InvalidConfig(ConfigError),

    /// The data for a source initializer could not be read.
    DataError {
        name: String,
        error: ExternalDataError,
    },
}

impl Display for RewriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(err) => write!(f, "io error: {}", err),
            Self::DuplicateName(name) => write!(f, "duplicate initializer name \"{}\"", name),
            Self::InvalidConfig(err) => write!(f, "invalid config: {}", err),
            Self::DataError { name, error } => {
                write!(f, "failed to read data for \"{}\": {}", name, error)
            }
        }
    }
}

impl Error for RewriteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            Self::DuplicateName(_) => None,
            Self::InvalidConfig(err) => Some(err),
            Self::DataError { error, .. } => Some(error),
        }
    }
}

impl From<std::io::Error> for RewriteError {
    fn from(val: std::io::Error) -> Self {
        Self::IoError(val)
    }
}

impl From<ConfigError> for RewriteError {
    fn from(val: ConfigError) -> Self {
        Self::InvalidConfig(val)
    }
}
