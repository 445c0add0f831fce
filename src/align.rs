//! Alignment of tensor data offsets in external data files.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Controls the alignment of tensor data written to an external data file.
///
/// Aligning large tensors to the allocation granularity (typically the page
/// size, or the granularity of `MapViewOfFile` on Windows) allows them to be
/// memory-mapped individually when loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentInfo {
    /// Whether to align tensor offsets at all.
    pub align_offset: bool,

    /// Tensors whose size in bytes is less than this are not aligned.
    pub align_threshold: u64,

    /// Offsets of aligned tensors are a multiple of this value.
    pub allocation_granularity: u64,
}

impl AlignmentInfo {
    /// Default value for [`align_threshold`](AlignmentInfo::align_threshold).
    pub const DEFAULT_ALIGN_THRESHOLD: u64 = 1024 * 1024;

    /// Default value for
    /// [`allocation_granularity`](AlignmentInfo::allocation_granularity).
    pub const DEFAULT_ALLOCATION_GRANULARITY: u64 = 64 * 1024;

    /// Return an `AlignmentInfo` which aligns tensors with at least
    /// `threshold` bytes to multiples of `granularity`.
    pub fn aligned(threshold: u64, granularity: u64) -> AlignmentInfo {
        AlignmentInfo {
            align_offset: true,
            align_threshold: threshold,
            allocation_granularity: granularity,
        }
    }

    /// Check that this configuration can be used to compute offsets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.align_offset && self.allocation_granularity == 0 {
            return Err(ConfigError::ZeroGranularity);
        }
        Ok(())
    }

    /// Return true if a tensor of `len` bytes must start at an aligned
    /// offset.
    pub fn applies_to(&self, len: u64) -> bool {
        self.align_offset && len >= self.align_threshold
    }

    /// Compute where a payload of `payload_len` bytes should be written,
    /// given that `current_offset` bytes have been written so far.
    ///
    /// Returns `(write_offset, padding)`, where `padding` is the number of
    /// filler bytes to insert before the payload.
    pub fn compute_offset(
        &self,
        current_offset: u64,
        payload_len: u64,
    ) -> Result<(u64, u64), ConfigError> {
        self.validate()?;

        if !self.applies_to(payload_len) {
            return Ok((current_offset, 0));
        }

        let write_offset = current_offset
            .checked_next_multiple_of(self.allocation_granularity)
            .ok_or(ConfigError::OffsetOverflow)?;
        Ok((write_offset, write_offset - current_offset))
    }
}

impl Default for AlignmentInfo {
    fn default() -> Self {
        AlignmentInfo {
            align_offset: false,
            align_threshold: Self::DEFAULT_ALIGN_THRESHOLD,
            allocation_granularity: Self::DEFAULT_ALLOCATION_GRANULARITY,
        }
    }
}

/// Free-function form of [`AlignmentInfo::compute_offset`].
pub fn compute_offset(
    current_offset: u64,
    payload_len: u64,
    info: &AlignmentInfo,
) -> Result<(u64, u64), ConfigError> {
    info.compute_offset(current_offset, payload_len)
}

#[cfg(test)]
mod tests {
    use rten_extdata_testing::TestCases;

    use super::{compute_offset, AlignmentInfo};
    use crate::errors::ConfigError;

    #[test]
    fn test_compute_offset() {
        #[derive(Debug)]
        struct Case {
            info: AlignmentInfo,
            current_offset: u64,
            payload_len: u64,
            expected: Result<(u64, u64), ConfigError>,
        }

        let cases = [
            // Alignment disabled
            Case {
                info: AlignmentInfo::default(),
                current_offset: 10,
                payload_len: 1 << 30,
                expected: Ok((10, 0)),
            },
            // Offset rounded up to next multiple
            Case {
                info: AlignmentInfo::aligned(0, 64),
                current_offset: 10,
                payload_len: 500,
                expected: Ok((64, 54)),
            },
            // Already aligned
            Case {
                info: AlignmentInfo::aligned(0, 64),
                current_offset: 128,
                payload_len: 1,
                expected: Ok((128, 0)),
            },
            // Zero offset is always aligned
            Case {
                info: AlignmentInfo::aligned(0, 4096),
                current_offset: 0,
                payload_len: 1,
                expected: Ok((0, 0)),
            },
            // Payload below alignment threshold
            Case {
                info: AlignmentInfo::aligned(100, 64),
                current_offset: 10,
                payload_len: 99,
                expected: Ok((10, 0)),
            },
            // Payload exactly at alignment threshold
            Case {
                info: AlignmentInfo::aligned(100, 64),
                current_offset: 10,
                payload_len: 100,
                expected: Ok((64, 54)),
            },
            // Granularity which is not a power of two
            Case {
                info: AlignmentInfo::aligned(0, 100),
                current_offset: 150,
                payload_len: 8,
                expected: Ok((200, 50)),
            },
            Case {
                info: AlignmentInfo::aligned(0, 0),
                current_offset: 10,
                payload_len: 8,
                expected: Err(ConfigError::ZeroGranularity),
            },
            Case {
                info: AlignmentInfo::aligned(0, 64),
                current_offset: u64::MAX - 1,
                payload_len: 8,
                expected: Err(ConfigError::OffsetOverflow),
            },
        ];

        cases.test_each(|case| {
            let result = compute_offset(case.current_offset, case.payload_len, &case.info);
            assert_eq!(result, case.expected);
        })
    }

    #[test]
    fn test_zero_granularity_allowed_when_disabled() {
        let info = AlignmentInfo {
            align_offset: false,
            align_threshold: 0,
            allocation_granularity: 0,
        };
        assert_eq!(info.validate(), Ok(()));
        assert_eq!(info.compute_offset(7, 8), Ok((7, 0)));
    }
}
