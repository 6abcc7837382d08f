//! Part layout for chunked transfers
//!
//! Plaintext parts are contiguous `chunk_size` slices of the file. When the
//! object is encrypted, part `i` lives at `i * block * (chunk / block + 2)` in
//! the remote object regardless of how long earlier parts really are, so any
//! part can be range-fetched on its own.

use crate::{ClientError, Result};
use cloudstore_crypto::BLOCK_SIZE;

/// Default part size (5 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Object stores reject multipart uploads with more parts than this
pub const MAX_PARTS: u64 = 10_000;

/// Pick a part size for a file: 5 MiB, grown by half until the part count fits
pub fn default_chunk_size(file_length: u64) -> u64 {
    let mut chunk_size = DEFAULT_CHUNK_SIZE;
    while file_length / chunk_size >= MAX_PARTS {
        chunk_size += chunk_size / 2;
    }
    chunk_size
}

/// Layout of a single part
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSpec {
    /// Zero-based part index
    pub index: usize,
    /// First plaintext byte of the part
    pub plaintext_start: u64,
    /// Plaintext bytes in the part
    pub plaintext_len: u64,
    /// First byte of the part in the remote object
    pub remote_start: u64,
    /// Bytes the part occupies in the remote object
    pub remote_len: u64,
}

impl PartSpec {
    /// One-based part number as used by multipart APIs
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// Immutable layout of one object transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    file_length: u64,
    chunk_size: u64,
    block_size: Option<u64>,
    parts: Vec<PartSpec>,
}

impl TransferPlan {
    /// Plan a transfer.
    ///
    /// `block_size` is the cipher block size when the parts are encrypted.
    pub fn new(file_length: u64, chunk_size: u64, block_size: Option<u64>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ClientError::Usage("chunk size must be positive".to_string()));
        }
        if block_size == Some(0) {
            return Err(ClientError::Usage("cipher block size must be positive".to_string()));
        }

        let part_count = file_length.div_ceil(chunk_size).max(1);
        let stride = match block_size {
            Some(bs) => bs * (chunk_size / bs + 2),
            None => chunk_size,
        };

        let parts = (0..part_count)
            .map(|i| {
                let plaintext_start = i * chunk_size;
                let plaintext_len = chunk_size.min(file_length - plaintext_start);
                let remote_len = match block_size {
                    Some(bs) => bs * (plaintext_len / bs + 2),
                    None => plaintext_len,
                };
                PartSpec {
                    index: i as usize,
                    plaintext_start,
                    plaintext_len,
                    remote_start: i * stride,
                    remote_len,
                }
            })
            .collect();

        Ok(Self {
            file_length,
            chunk_size,
            block_size,
            parts,
        })
    }

    /// Plan an unencrypted transfer
    pub fn plain(file_length: u64, chunk_size: u64) -> Result<Self> {
        Self::new(file_length, chunk_size, None)
    }

    /// Plan a transfer encrypted with the part cipher
    pub fn encrypted(file_length: u64, chunk_size: u64) -> Result<Self> {
        Self::new(file_length, chunk_size, Some(BLOCK_SIZE as u64))
    }

    /// Total plaintext bytes
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Nominal part size
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Whether parts are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.block_size.is_some()
    }

    /// Number of parts, at least one
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// All parts in index order
    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    /// Size of the object once every part is stored
    pub fn remote_length(&self) -> u64 {
        self.parts
            .last()
            .map(|p| p.remote_start + p.remote_len)
            .unwrap_or(0)
    }

    /// Inclusive byte range of a part within a remote object of `object_length` bytes.
    ///
    /// The end is clamped to the last byte of the object. `None` when the part
    /// occupies no bytes.
    pub fn remote_range(&self, part: &PartSpec, object_length: u64) -> Option<(u64, u64)> {
        if part.remote_len == 0 || object_length == 0 || part.remote_start >= object_length {
            return None;
        }
        let end = (part.remote_start + part.remote_len - 1).min(object_length - 1);
        Some((part.remote_start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_three_part_scenario() {
        let plan = TransferPlan::plain(12_000_000, 5_242_880).unwrap();
        assert_eq!(plan.part_count(), 3);
        let ranges: Vec<(u64, u64)> = plan
            .parts()
            .iter()
            .map(|p| (p.plaintext_start, p.plaintext_start + p.plaintext_len))
            .collect();
        assert_eq!(
            ranges,
            vec![(0, 5_242_880), (5_242_880, 10_485_760), (10_485_760, 12_000_000)]
        );
    }

    #[test]
    fn test_zero_length_file_has_one_part() {
        let plan = TransferPlan::plain(0, 1024).unwrap();
        assert_eq!(plan.part_count(), 1);
        assert_eq!(plan.parts()[0].plaintext_len, 0);
        assert_eq!(plan.remote_range(&plan.parts()[0], 0), None);

        let plan = TransferPlan::encrypted(0, 1024).unwrap();
        assert_eq!(plan.part_count(), 1);
        assert_eq!(plan.parts()[0].remote_len, 32);
        assert_eq!(plan.remote_range(&plan.parts()[0], 32), Some((0, 31)));
    }

    #[test]
    fn test_encrypted_stride() {
        // chunk 100: stride = 16 * (100 / 16 + 2) = 128
        let plan = TransferPlan::encrypted(250, 100).unwrap();
        let parts = plan.parts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].remote_start, 0);
        assert_eq!(parts[1].remote_start, 128);
        assert_eq!(parts[2].remote_start, 256);
        assert_eq!(parts[0].remote_len, 128);
        // final part holds 50 bytes: 16 * (50 / 16 + 2) = 80
        assert_eq!(parts[2].remote_len, 80);
    }

    #[test]
    fn test_stride_matches_cipher_when_chunk_is_block_aligned() {
        let plan = TransferPlan::encrypted(3 * 1024 + 10, 1024).unwrap();
        let parts = plan.parts();
        for pair in parts.windows(2) {
            assert_eq!(pair[0].remote_start + pair[0].remote_len, pair[1].remote_start);
        }
        assert_eq!(
            plan.remote_length(),
            parts.iter().map(|p| p.remote_len).sum::<u64>()
        );
    }

    #[test]
    fn test_remote_range_clamped_to_object() {
        let plan = TransferPlan::encrypted(250, 100).unwrap();
        let last = plan.parts()[2];
        assert_eq!(plan.remote_range(&last, 256 + 80), Some((256, 335)));
        assert_eq!(plan.remote_range(&last, 300), Some((256, 299)));
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        assert!(matches!(
            TransferPlan::plain(10, 0),
            Err(ClientError::Usage(_))
        ));
    }

    #[test]
    fn test_default_chunk_size() {
        assert_eq!(default_chunk_size(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(default_chunk_size(1024 * 1024 * 1024), DEFAULT_CHUNK_SIZE);
        let huge = DEFAULT_CHUNK_SIZE * MAX_PARTS;
        let chunk = default_chunk_size(huge);
        assert!(chunk > DEFAULT_CHUNK_SIZE);
        assert!(huge / chunk < MAX_PARTS);
    }

    proptest! {
        #[test]
        fn prop_parts_cover_file_exactly(
            file_length in 0u64..1_000_000,
            chunk_size in 64u64..50_000,
            encrypted in any::<bool>(),
        ) {
            let plan = if encrypted {
                TransferPlan::encrypted(file_length, chunk_size).unwrap()
            } else {
                TransferPlan::plain(file_length, chunk_size).unwrap()
            };
            prop_assert!(plan.part_count() >= 1);
            if file_length == 0 {
                prop_assert_eq!(plan.part_count(), 1);
            }

            let mut next = 0u64;
            for (i, part) in plan.parts().iter().enumerate() {
                prop_assert_eq!(part.index, i);
                prop_assert_eq!(part.plaintext_start, next);
                prop_assert!(part.plaintext_len <= chunk_size);
                if file_length > 0 {
                    prop_assert!(part.plaintext_len > 0);
                }
                next += part.plaintext_len;
            }
            prop_assert_eq!(next, file_length);

            for pair in plan.parts().windows(2) {
                prop_assert!(pair[0].remote_start + pair[0].remote_len <= pair[1].remote_start);
            }
        }
    }
}
