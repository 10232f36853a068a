//! Firmware upgrade framing on the debug terminal.
//!
//! ```text
//! host  -> "upgradeFw" | len u32 LE | crc u32 LE      (write with response)
//! node  -> crc u32 LE                                  (echo of the checksum)
//! host  -> chunk (<= 16 bytes) ...                     (write without response)
//! node  -> 0x01                                        (image accepted)
//! ```

use crate::crc;

/// ASCII tag that opens an upgrade.
pub const UPGRADE_TAG: &[u8] = b"upgradeFw";

/// Length of the upgrade command frame.
pub const UPGRADE_COMMAND_LEN: usize = UPGRADE_TAG.len() + 8;

/// Largest chunk the node accepts in one write.
pub const MAX_CHUNK_LEN: usize = 16;

/// First byte of the completion acknowledgement.
pub const ACK_COMPLETE: u8 = 0x01;

/// Length of the checksum echo.
pub const CRC_ACK_LEN: usize = 4;

/// The frame that announces an image to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpgradeCommand {
    /// Full image length, including any trailing bytes the checksum skips.
    pub length: u32,
    /// Checksum over the 4-byte aligned prefix of the image.
    pub crc: u32,
}

impl UpgradeCommand {
    /// Describe `image`: the checksum covers its aligned prefix, the length
    /// is the untruncated size.
    ///
    /// Images longer than `u32::MAX` bytes are not representable and yield
    /// `None`.
    #[must_use]
    pub fn for_image(image: &[u8]) -> Option<Self> {
        let length = u32::try_from(image.len()).ok()?;
        let crc = crc::crc32(crc::aligned_prefix(image)).ok()?;
        Some(Self { length, crc })
    }

    /// Serialize the frame.
    ///
    /// # Example
    ///
    /// ```
    /// use bluest_proto::firmware::UpgradeCommand;
    ///
    /// let frame = UpgradeCommand { length: 40, crc: 0x1122_3344 }.to_bytes();
    /// assert_eq!(&frame[..9], b"upgradeFw");
    /// assert_eq!(&frame[9..13], &40u32.to_le_bytes());
    /// assert_eq!(&frame[13..], &[0x44, 0x33, 0x22, 0x11]);
    /// ```
    #[must_use]
    pub fn to_bytes(&self) -> [u8; UPGRADE_COMMAND_LEN] {
        let mut frame = [0u8; UPGRADE_COMMAND_LEN];
        let tag = UPGRADE_TAG.len();
        frame[..tag].copy_from_slice(UPGRADE_TAG);
        frame[tag..tag + 4].copy_from_slice(&self.length.to_le_bytes());
        frame[tag + 4..].copy_from_slice(&self.crc.to_le_bytes());
        frame
    }

    /// Parse a frame as the node receives it.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let rest = frame.strip_prefix(UPGRADE_TAG)?;
        if rest.len() != 8 {
            return None;
        }
        Some(Self {
            length: u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
            crc: u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]),
        })
    }
}

/// Checksum echoed by the node, if `data` is long enough to carry one.
#[inline]
#[must_use]
pub fn parse_crc_ack(data: &[u8]) -> Option<u32> {
    match data {
        [a, b, c, d, ..] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// Whether `data` is the completion acknowledgement.
#[inline]
#[must_use]
pub fn is_completion_ack(data: &[u8]) -> bool {
    data.first() == Some(&ACK_COMPLETE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = UpgradeCommand {
            length: 0x0102_0304,
            crc: 0xA1B2_C3D4,
        }
        .to_bytes();
        assert_eq!(frame.len(), 17);
        assert_eq!(&frame[9..], &[0x04, 0x03, 0x02, 0x01, 0xD4, 0xC3, 0xB2, 0xA1]);
    }

    #[test]
    fn test_for_image_keeps_untruncated_length() {
        let image = [0x5Au8; 42];
        let cmd = UpgradeCommand::for_image(&image).unwrap();
        assert_eq!(cmd.length, 42);
        assert_eq!(cmd.crc, crc::crc32(&image[..40]).unwrap());
    }

    #[test]
    fn test_parse_frame() {
        let cmd = UpgradeCommand {
            length: 40,
            crc: 7,
        };
        assert_eq!(UpgradeCommand::parse(&cmd.to_bytes()), Some(cmd));
        assert_eq!(UpgradeCommand::parse(b"upgradeFw\x01"), None);
        assert_eq!(UpgradeCommand::parse(b"versionFw\r\n"), None);
    }

    #[test]
    fn test_acks() {
        assert_eq!(parse_crc_ack(&[0x78, 0x56, 0x34, 0x12]), Some(0x1234_5678));
        assert_eq!(parse_crc_ack(&[0x78, 0x56]), None);
        assert!(is_completion_ack(&[0x01]));
        assert!(is_completion_ack(&[0x01, b'x']));
        assert!(!is_completion_ack(b"Error\r\n"));
        assert!(!is_completion_ack(&[]));
    }
}
