//! CRC-32 checksum for firmware images.
//!
//! The node validates an upgrade image with an unreflected CRC-32 (polynomial
//! `0x04C11DB7`, seed `0xFFFFFFFF`, no final XOR) computed over 32-bit words.
//! Each word is read little-endian from a 4-byte group and shifted through the
//! register most significant bit first, so the image length must be a multiple
//! of four.
//!
//! Feeding a word MSB-first is the same as feeding its big-endian bytes to a
//! byte-oriented CRC-32/MPEG-2, which is what the digest below does.

use core::fmt;

use crc::{Crc, CRC_32_MPEG_2};

/// CRC-32/MPEG-2 calculator with 256-entry lookup table.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Checksum of an empty image: the seed, untouched.
pub const CRC32_SEED: u32 = 0xFFFF_FFFF;

/// Word size the checksum operates on.
pub const CRC32_WORD: usize = 4;

/// Error type for checksum calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CrcError {
    /// Input length is not a multiple of [`CRC32_WORD`].
    Unaligned {
        /// Length of the rejected buffer.
        len: usize,
    },
}

impl fmt::Display for CrcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrcError::Unaligned { len } => {
                write!(f, "crc input of {len} bytes is not 4-byte aligned")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CrcError {}

/// Calculate the device CRC-32 of a 4-byte aligned buffer.
///
/// Returns [`CrcError::Unaligned`] instead of reading past the end when the
/// length is not a multiple of four; callers truncate first (see
/// [`aligned_prefix`]).
///
/// # Example
///
/// ```
/// use bluest_proto::crc::{crc32, CRC32_SEED};
///
/// assert_eq!(crc32(&[]), Ok(CRC32_SEED));
/// assert!(crc32(&[1, 2, 3]).is_err());
/// ```
pub fn crc32(data: &[u8]) -> Result<u32, CrcError> {
    if data.len() % CRC32_WORD != 0 {
        return Err(CrcError::Unaligned { len: data.len() });
    }

    let mut digest = Crc32Digest::new();
    for word in data.chunks_exact(CRC32_WORD) {
        digest.update_word(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }
    Ok(digest.finalize())
}

/// Longest prefix of `data` whose length is a multiple of four.
#[inline]
#[must_use]
pub fn aligned_prefix(data: &[u8]) -> &[u8] {
    &data[..data.len() - data.len() % CRC32_WORD]
}

/// CRC-32 digest for incremental, word-at-a-time calculation.
pub struct Crc32Digest {
    digest: crc::Digest<'static, u32>,
}

impl Crc32Digest {
    /// Create a new digest seeded with [`CRC32_SEED`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    /// Update the digest with one 32-bit word.
    #[inline]
    pub fn update_word(&mut self, word: u32) {
        self.digest.update(&word.to_be_bytes());
    }

    /// Finalize and return the checksum value.
    #[inline]
    #[must_use]
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}
