//! Fixed-width little-endian value readers.
//!
//! Every BlueST notification packs its fields little-endian at known byte
//! offsets. These readers check `offset + width` against the buffer before
//! touching it and never allocate.

use core::fmt;

/// Error type for value decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// The read would run past the end of the buffer.
    OutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Width of the requested value.
        width: usize,
        /// Length of the buffer.
        len: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::OutOfBounds { offset, width, len } => write!(
                f,
                "read of {width} bytes at offset {offset} overruns {len}-byte payload"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CodecError {}

/// Borrow exactly `N` bytes at `offset`.
#[inline]
fn take<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], CodecError> {
    offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(CodecError::OutOfBounds {
            offset,
            width: N,
            len: buf.len(),
        })
}

/// Read a `u8` at `offset`.
#[inline]
pub fn read_u8(buf: &[u8], offset: usize) -> Result<u8, CodecError> {
    take::<1>(buf, offset).map(|b| b[0])
}

/// Read an `i8` at `offset`.
#[inline]
pub fn read_i8(buf: &[u8], offset: usize) -> Result<i8, CodecError> {
    take::<1>(buf, offset).map(i8::from_le_bytes)
}

/// Read a little-endian `u16` at `offset`.
#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    take::<2>(buf, offset).map(u16::from_le_bytes)
}

/// Read a little-endian `i16` at `offset`.
#[inline]
pub fn read_i16(buf: &[u8], offset: usize) -> Result<i16, CodecError> {
    take::<2>(buf, offset).map(i16::from_le_bytes)
}

/// Read a little-endian `u32` at `offset`.
#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    take::<4>(buf, offset).map(u32::from_le_bytes)
}

/// Read a little-endian `i32` at `offset`.
#[inline]
pub fn read_i32(buf: &[u8], offset: usize) -> Result<i32, CodecError> {
    take::<4>(buf, offset).map(i32::from_le_bytes)
}

/// Read three consecutive little-endian `i16` values (X, Y, Z).
pub fn read_i16x3(buf: &[u8], offset: usize) -> Result<[i16; 3], CodecError> {
    let raw = take::<6>(buf, offset)?;
    Ok([
        i16::from_le_bytes([raw[0], raw[1]]),
        i16::from_le_bytes([raw[2], raw[3]]),
        i16::from_le_bytes([raw[4], raw[5]]),
    ])
}

/// Read three little-endian 16-bit words followed by one byte.
///
/// The words are returned raw; the battery layout reinterprets the first one
/// as unsigned.
pub fn read_i16x3_u8(buf: &[u8], offset: usize) -> Result<([i16; 3], u8), CodecError> {
    let raw = take::<7>(buf, offset)?;
    Ok((
        [
            i16::from_le_bytes([raw[0], raw[1]]),
            i16::from_le_bytes([raw[2], raw[3]]),
            i16::from_le_bytes([raw[4], raw[5]]),
        ],
        raw[6],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers_little_endian() {
        let buf = [0x34, 0x12, 0xFF, 0xFF, 0x78, 0x56, 0x34, 0x12];

        assert_eq!(read_u8(&buf, 0), Ok(0x34));
        assert_eq!(read_i8(&buf, 2), Ok(-1));
        assert_eq!(read_u16(&buf, 0), Ok(0x1234));
        assert_eq!(read_i16(&buf, 2), Ok(-1));
        assert_eq!(read_u32(&buf, 4), Ok(0x1234_5678));
        assert_eq!(read_i32(&buf, 0), Ok(-0x0000_EDCC));
    }

    #[test]
    fn test_read_at_exact_end() {
        let buf = [0u8, 0, 0x01, 0x02];
        assert_eq!(read_u16(&buf, 2), Ok(0x0201));
    }

    #[test]
    fn test_read_past_end_fails() {
        let buf = [0u8; 4];

        assert_eq!(
            read_u32(&buf, 1),
            Err(CodecError::OutOfBounds {
                offset: 1,
                width: 4,
                len: 4
            })
        );
        assert!(read_u8(&buf, 4).is_err());
        assert!(read_i16x3(&buf, 0).is_err());
        assert!(read_u16(&buf, usize::MAX).is_err());
    }

    #[test]
    fn test_read_i16x3() {
        let buf = [0, 0, 0x0A, 0x00, 0xF6, 0xFF, 0xE8, 0x03];
        assert_eq!(read_i16x3(&buf, 2), Ok([10, -10, 1000]));
    }

    #[test]
    fn test_read_i16x3_u8() {
        let buf = [0x64, 0x00, 0xE8, 0x03, 0x0A, 0x00, 0x03];
        assert_eq!(read_i16x3_u8(&buf, 0), Ok(([100, 1000, 10], 3)));
        assert!(read_i16x3_u8(&buf, 1).is_err());
    }
}
