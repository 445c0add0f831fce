//! Sequential writer for external data files.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::align::AlignmentInfo;
use crate::errors::{ConfigError, RewriteError};
use crate::external_data::DataLocation;

/// Appends tensor data to an external data file.
///
/// Data is only ever appended, so offsets of successive tensors are
/// non-decreasing and their byte ranges never overlap. The file is closed when
/// the writer is dropped.
pub struct ExternalDataWriter<W: Write = BufWriter<File>> {
    out: W,

    /// Name recorded in the [`DataLocation`]s returned by [`write`](Self::write).
    file_name: String,

    /// Number of bytes written so far, including padding.
    cursor: u64,

    /// Set if a write failed. The file contents after `cursor` are then
    /// unknown, so further writes are refused.
    failed: bool,
}

impl ExternalDataWriter {
    /// Create or truncate the file at `path` and return a writer for it.
    ///
    /// Locations returned by the writer record only the file name of `path`.
    pub fn create(path: &Path) -> Result<ExternalDataWriter, RewriteError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ConfigError::InvalidDataPath(path.to_path_buf()))?;
        let file = File::create(path)?;
        Ok(ExternalDataWriter::from_writer(
            BufWriter::new(file),
            file_name,
        ))
    }
}

impl<W: Write> ExternalDataWriter<W> {
    /// Create a writer which appends to `out`, which is assumed to be empty.
    pub fn from_writer(out: W, file_name: &str) -> ExternalDataWriter<W> {
        ExternalDataWriter {
            out,
            file_name: file_name.to_string(),
            cursor: 0,
            failed: false,
        }
    }

    /// Return the number of bytes written so far.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Name of the file that data is written to.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Append `payload` to the file, preceded by any padding needed to align
    /// it according to `align`.
    ///
    /// Returns the location of the payload within the file.
    pub fn write(
        &mut self,
        payload: &[u8],
        align: &AlignmentInfo,
    ) -> Result<DataLocation, RewriteError> {
        if self.failed {
            return Err(RewriteError::IoError(std::io::Error::other(
                "external data writer failed previously",
            )));
        }

        let length = payload.len() as u64;
        let (offset, padding) = align.compute_offset(self.cursor, length)?;
        let end = offset
            .checked_add(length)
            .ok_or(ConfigError::OffsetOverflow)?;

        if let Err(err) = self.write_padded(payload, padding) {
            self.failed = true;
            return Err(err.into());
        }
        self.cursor = end;

        Ok(DataLocation {
            path: self.file_name.clone(),
            offset,
            length,
        })
    }

    fn write_padded(&mut self, payload: &[u8], padding: u64) -> std::io::Result<()> {
        if padding > 0 {
            std::io::copy(&mut std::io::repeat(0).take(padding), &mut self.out)?;
        }
        self.out.write_all(payload)
    }

    /// Flush buffered data and return the final length of the file.
    pub fn finish(mut self) -> Result<u64, RewriteError> {
        self.out.flush()?;
        Ok(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rten_extdata_testing::TempDir;

    use super::ExternalDataWriter;
    use crate::align::AlignmentInfo;
    use crate::errors::{ConfigError, RewriteError};
    use crate::external_data::DataLocation;

    #[test]
    fn test_write_unaligned() {
        let mut writer = ExternalDataWriter::from_writer(Vec::new(), "model.data");
        let align = AlignmentInfo::default();

        let first = writer.write(&[1; 10], &align).unwrap();
        let second = writer.write(&[2; 5], &align).unwrap();

        assert_eq!(
            first,
            DataLocation {
                path: "model.data".into(),
                offset: 0,
                length: 10,
            }
        );
        assert_eq!((second.offset, second.length), (10, 5));
        assert_eq!(writer.position(), 15);
    }

    #[test]
    fn test_write_aligned() {
        let mut buf = Vec::new();
        let mut writer = ExternalDataWriter::from_writer(&mut buf, "model.data");
        let align = AlignmentInfo::aligned(0, 64);

        let first = writer.write(&[1; 10], &align).unwrap();
        let second = writer.write(&[2; 500], &align).unwrap();
        assert_eq!(writer.finish().unwrap(), 564);

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 64);
        assert_eq!(buf.len(), 564);
        assert!(buf[10..64].iter().all(|x| *x == 0));
        assert!(buf[64..].iter().all(|x| *x == 2));
    }

    #[test]
    fn test_write_below_align_threshold() {
        let mut writer = ExternalDataWriter::from_writer(Vec::new(), "model.data");
        let align = AlignmentInfo::aligned(100, 64);

        writer.write(&[1; 10], &align).unwrap();
        let small = writer.write(&[2; 20], &align).unwrap();
        let large = writer.write(&[3; 100], &align).unwrap();

        assert_eq!(small.offset, 10);
        assert_eq!(large.offset, 64);
    }

    #[test]
    fn test_write_invalid_alignment() {
        let mut writer = ExternalDataWriter::from_writer(Vec::new(), "model.data");
        let result = writer.write(&[1; 10], &AlignmentInfo::aligned(0, 0));
        assert!(matches!(
            result,
            Err(RewriteError::InvalidConfig(ConfigError::ZeroGranularity))
        ));
        assert_eq!(writer.position(), 0);
    }

    struct FailingWriter {
        capacity: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.capacity == 0 {
                return Err(std::io::Error::other("disk full"));
            }
            let n = buf.len().min(self.capacity);
            self.capacity -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure() {
        let mut writer = ExternalDataWriter::from_writer(FailingWriter { capacity: 16 }, "x.data");
        let align = AlignmentInfo::default();

        assert!(writer.write(&[0; 8], &align).is_ok());
        let err = writer.write(&[0; 16], &align).err().unwrap();
        assert!(err.to_string().contains("disk full"));

        // Writer refuses further writes after a failure.
        let err = writer.write(&[0; 1], &align).err().unwrap();
        assert!(matches!(err, RewriteError::IoError(_)));
        assert_eq!(writer.position(), 8);
    }

    #[test]
    fn test_create_truncates_existing_file() {
        let dir = TempDir::new("test_create_truncates").unwrap();
        let path = dir.join("model.data");
        std::fs::write(&path, [9; 100]).unwrap();

        let mut writer = ExternalDataWriter::create(&path).unwrap();
        let location = writer.write(&[1, 2, 3], &AlignmentInfo::default()).unwrap();
        assert_eq!(location.path, "model.data");
        assert_eq!(writer.finish().unwrap(), 3);

        assert_eq!(std::fs::read(&path).unwrap(), [1, 2, 3]);
    }
}
