//! Reading tensor data stored in external data files.
//!
//! Initializers whose data is stored externally reference a region of a file
//! in the same directory as the graph document, via a [`DataLocation`].

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "mmap")]
use memmap2::Mmap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Location of tensor data stored in an external file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLocation {
    /// Name of the external data file, relative to the directory containing
    /// the graph.
    pub path: String,

    /// Offset of the start of the tensor data in bytes.
    pub offset: u64,

    /// Length of the tensor data in bytes.
    pub length: u64,
}

impl DataLocation {
    /// Return the offset of the first byte after the tensor data.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Buffer holding the contents of some or all of an external data file.
#[derive(Debug)]
pub enum DataStorage {
    /// Data read into memory.
    Buffer(Vec<u8>),

    /// A memory-mapped file.
    #[cfg(feature = "mmap")]
    Mmap(Mmap),
}

impl DataStorage {
    pub fn data(&self) -> &[u8] {
        match self {
            DataStorage::Buffer(buf) => buf,
            #[cfg(feature = "mmap")]
            DataStorage::Mmap(mmap) => mmap,
        }
    }
}

/// The data for one tensor, as a range of a possibly shared buffer.
#[derive(Debug)]
pub struct DataSlice {
    pub storage: Arc<DataStorage>,
    pub bytes: Range<usize>,
}

impl DataSlice {
    pub fn data(&self) -> &[u8] {
        &self.storage.data()[self.bytes.clone()]
    }
}

/// Errors reading tensor data from an external file.
#[derive(Debug)]
pub enum ExternalDataError {
    /// An IO error occurred when accessing the external file.
    IoError(std::io::Error),

    /// The length of the external data is too large to load.
    InvalidLength,

    /// External data is not supported in the current environment.
    NotSupported,

    /// The file is too short for the offset and length of the external data.
    TooShort {
        /// Minimum length the file would need to be in bytes.
        required_len: u64,
        /// Actual length of the file in bytes.
        actual_len: u64,
    },

    /// The external data file path is disallowed.
    DisallowedPath(PathBuf),
}

impl std::fmt::Display for ExternalDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(err) => write!(f, "io error: {}", err),
            Self::InvalidLength => write!(f, "invalid data length"),
            Self::NotSupported => write!(f, "external data not supported"),
            Self::TooShort {
                required_len,
                actual_len,
            } => write!(
                f,
                "file too short. required {} actual {}",
                required_len, actual_len
            ),
            Self::DisallowedPath(path) => write!(f, "disallowed path \"{}\"", path.display()),
        }
    }
}

impl std::error::Error for ExternalDataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExternalDataError {
    fn from(val: std::io::Error) -> Self {
        Self::IoError(val)
    }
}

/// Trait for loading data from an external file.
pub trait DataLoader {
    /// Load data from the file and offset specified by `location`.
    fn load(&self, location: &DataLocation) -> Result<DataSlice, ExternalDataError>;
}

/// Return true if `path` may be used as the name of an external data file.
///
/// Data files must be plain file names, so they live in the same directory as
/// the graph, and must have one of the extensions used for tensor data
/// ("data", "onnx_data", "bin", or these followed by a suffix, as used when
/// large files are split into pieces). This stops a graph document from
/// referencing arbitrary files on the system.
pub fn is_allowed_external_data_path(path: &Path) -> bool {
    let mut components = path.components();
    let Some(Component::Normal(_)) = components.next() else {
        return false;
    };
    if components.next().is_some() {
        return false;
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => ["data", "onnx_data", "bin"]
            .iter()
            .any(|allowed| ext.starts_with(allowed)),
        None => false,
    }
}

fn check_path(data_path: &Path) -> Result<(), ExternalDataError> {
    if !is_allowed_external_data_path(data_path) {
        return Err(ExternalDataError::DisallowedPath(data_path.into()));
    }
    Ok(())
}

/// External data loader that uses standard file IO.
pub struct FileLoader {
    /// Directory containing the external data files.
    dir_path: PathBuf,

    /// Map of external data file name to open file.
    files: RefCell<FxHashMap<PathBuf, File>>,
}

impl FileLoader {
    /// Create a loader which resolves data file names relative to `dir_path`.
    ///
    /// An empty path refers to the current directory.
    pub fn new(dir_path: impl Into<PathBuf>) -> FileLoader {
        FileLoader {
            dir_path: dir_path.into(),
            files: RefCell::new(FxHashMap::default()),
        }
    }

    fn read(&self, location: &DataLocation) -> Result<Vec<u8>, ExternalDataError> {
        // Tensor data is stored little-endian and is not byte-swapped.
        if cfg!(target_endian = "big") {
            return Err(ExternalDataError::NotSupported);
        }
        let len = usize::try_from(location.length)
            .ok()
            .filter(|len| *len <= isize::MAX as usize)
            .ok_or(ExternalDataError::InvalidLength)?;
        let required_len = location.end().ok_or(ExternalDataError::InvalidLength)?;

        let data_path = Path::new(&location.path);
        check_path(data_path)?;

        let mut files = self.files.borrow_mut();
        let file = match files.entry(data_path.to_path_buf()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(File::open(self.dir_path.join(data_path))?)
            }
        };

        let actual_len = file.metadata()?.len();
        if actual_len < required_len {
            return Err(ExternalDataError::TooShort {
                required_len,
                actual_len,
            });
        }

        file.seek(SeekFrom::Start(location.offset))?;
        let mut buf = Vec::with_capacity(len);
        (&mut *file).take(location.length).read_to_end(&mut buf)?;

        // The file may have been truncated after the length check.
        if buf.len() != len {
            return Err(ExternalDataError::TooShort {
                required_len,
                actual_len: location.offset + buf.len() as u64,
            });
        }

        Ok(buf)
    }
}

impl DataLoader for FileLoader {
    fn load(&self, location: &DataLocation) -> Result<DataSlice, ExternalDataError> {
        let bytes = self.read(location)?;
        Ok(DataSlice {
            bytes: 0..bytes.len(),
            storage: Arc::new(DataStorage::Buffer(bytes)),
        })
    }
}

/// Return the directory containing the graph document at `model_path`.
pub fn dir_path_from_model_path(model_path: &Path) -> Result<PathBuf, ExternalDataError> {
    // Resolve the path now so that data is not loaded from an unexpected
    // location if the working directory changes later.
    let model_path = if !cfg!(target_arch = "wasm32") {
        model_path.canonicalize()?
    } else {
        model_path.to_path_buf()
    };

    match model_path.parent() {
        Some(parent) if model_path.is_file() => Ok(parent.to_path_buf()),
        _ => Err(ExternalDataError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("\"{}\" is not a file", model_path.display()),
        ))),
    }
}

/// External data loader that uses memory mapping.
///
/// One memory map is created per data file and shared by all tensors that
/// reference it.
#[cfg(feature = "mmap")]
pub struct MmapLoader {
    dir_path: PathBuf,
    mmaps: RefCell<FxHashMap<PathBuf, Arc<DataStorage>>>,
}

#[cfg(feature = "mmap")]
impl MmapLoader {
    /// Create a loader which maps data files in `dir_path`.
    ///
    /// # Safety
    ///
    /// Truncating a data file while it is mapped causes undefined behavior.
    /// The caller must ensure the files are not modified while the loader,
    /// or any [`DataSlice`] it returned, is alive.
    pub unsafe fn new(dir_path: impl Into<PathBuf>) -> MmapLoader {
        MmapLoader {
            dir_path: dir_path.into(),
            mmaps: RefCell::new(FxHashMap::default()),
        }
    }

    fn get_or_open_mmap(&self, data_path: &Path) -> Result<Arc<DataStorage>, ExternalDataError> {
        check_path(data_path)?;

        let mut mmaps = self.mmaps.borrow_mut();
        if let Some(storage) = mmaps.get(data_path) {
            return Ok(storage.clone());
        }

        let file = File::open(self.dir_path.join(data_path))?;

        // Safety: By constructing `Self`, the caller accepted the risks of
        // mapping the file.
        let mmap = unsafe { Mmap::map(&file) }?;
        let storage = Arc::new(DataStorage::Mmap(mmap));
        mmaps.insert(data_path.to_path_buf(), storage.clone());
        Ok(storage)
    }
}

#[cfg(feature = "mmap")]
impl DataLoader for MmapLoader {
    fn load(&self, location: &DataLocation) -> Result<DataSlice, ExternalDataError> {
        let storage = self.get_or_open_mmap(Path::new(&location.path))?;

        let actual_len = storage.data().len() as u64;
        let end = location.end().ok_or(ExternalDataError::InvalidLength)?;
        if end > actual_len {
            return Err(ExternalDataError::TooShort {
                required_len: end,
                actual_len,
            });
        }

        Ok(DataSlice {
            storage,
            bytes: location.offset as usize..end as usize,
        })
    }
}
