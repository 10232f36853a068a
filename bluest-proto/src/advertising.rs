//! BlueST manufacturer-specific advertisement data.
//!
//! ```text
//! compact (6 bytes): | ver | dev type | feature mask (4) |
//! full   (12 bytes): | ver | dev type | feature mask (4) | MAC (6) |
//! ```

use core::fmt;

/// Length of the compact advertisement form.
pub const COMPACT_LEN: usize = 6;

/// Length of the full advertisement form, which adds the MAC address.
pub const FULL_LEN: usize = 12;

/// Lowest protocol version a BlueST node advertises.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Parsed BlueST advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Advertisement {
    pub protocol_version: u8,
    pub device_type: u8,
    /// Features the node exposes, big-endian on the wire.
    pub feature_mask: u32,
    /// Present only in the full form.
    pub mac: Option<MacAddress>,
}

impl Advertisement {
    /// Parse manufacturer data; returns `None` for anything that is not a
    /// BlueST packet.
    ///
    /// # Example
    ///
    /// ```
    /// use bluest_proto::advertising::Advertisement;
    ///
    /// let adv = Advertisement::parse(&[1, 0x80, 0x00, 0xE0, 0x00, 0x00]).unwrap();
    /// assert_eq!(adv.device_type, 0x80);
    /// assert!(adv.mac.is_none());
    /// assert!(Advertisement::parse(&[0, 0x80, 0, 0, 0, 0]).is_none());
    /// ```
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_LEN && data.len() != FULL_LEN {
            return None;
        }
        if data[0] < MIN_PROTOCOL_VERSION {
            return None;
        }

        let mac = (data.len() == FULL_LEN).then(|| {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&data[6..12]);
            MacAddress(bytes)
        });

        Some(Self {
            protocol_version: data[0],
            device_type: data[1],
            feature_mask: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            mac,
        })
    }
}

/// Bluetooth device address as advertised, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn test_full_packet_has_mac() {
        let data = [2, 0x01, 0x00, 0xFC, 0x00, 0x00, 0xC0, 0x85, 0x12, 0x34, 0x56, 0x78];
        let adv = Advertisement::parse(&data).unwrap();

        assert_eq!(adv.protocol_version, 2);
        assert_eq!(adv.feature_mask, 0x00FC_0000);
        assert_eq!(adv.mac.unwrap().to_string(), "c0:85:12:34:56:78");
    }

    #[test]
    fn test_rejects_wrong_length_and_version() {
        assert!(Advertisement::parse(&[1, 0, 0, 0, 0]).is_none());
        assert!(Advertisement::parse(&[1; 8]).is_none());
        assert!(Advertisement::parse(&[0; FULL_LEN]).is_none());
    }
}
