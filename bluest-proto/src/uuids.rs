//! GATT UUIDs used by BlueST nodes.
//!
//! Feature characteristics live in services whose UUID ends with
//! [`FEATURE_SERVICE_SUFFIX`]; the first four bytes of a feature
//! characteristic's UUID are its capability mask. The debug service exposes a
//! bidirectional terminal and a read-only error stream.

use uuid::Uuid;

/// Low 96 bits shared by every BlueST feature service (`xxxxxxxx-0001-11E1-9AB4-0002A5D5C51B`).
pub const FEATURE_SERVICE_SUFFIX: u128 = 0x0000_0000_0001_11e1_9ab4_0002a5d5c51b;

/// Low 96 bits shared by every BlueST feature characteristic.
pub const FEATURE_CHARACTERISTIC_SUFFIX: u128 = 0x0000_0000_0001_11e1_ac36_0002a5d5c51b;

/// Mask selecting the suffix part of a UUID.
const SUFFIX_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

/// Debug service.
pub const DEBUG_SERVICE: Uuid = Uuid::from_u128(0x0000_0000_000e_11e1_9ab4_0002a5d5c51b);

/// Debug terminal: read, write, notify. Carries text commands and the
/// firmware upgrade exchange.
pub const DEBUG_TERMINAL: Uuid = Uuid::from_u128(0x0000_0001_000e_11e1_ac36_0002a5d5c51b);

/// Debug error stream: read, notify.
pub const DEBUG_STDERR: Uuid = Uuid::from_u128(0x0000_0002_000e_11e1_ac36_0002a5d5c51b);

/// Whether `service` is a BlueST feature service.
#[inline]
#[must_use]
pub fn is_feature_service(service: &Uuid) -> bool {
    service.as_u128() & SUFFIX_MASK == FEATURE_SERVICE_SUFFIX
}

/// Capability mask carried in the first four bytes of a characteristic UUID.
///
/// UUID bytes are big-endian, so `00E00000-0001-11E1-...` yields `0x00E0_0000`.
#[inline]
#[must_use]
pub fn feature_mask(characteristic: &Uuid) -> u32 {
    let bytes = characteristic.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// UUID of the feature characteristic that carries `mask`.
#[inline]
#[must_use]
pub const fn feature_characteristic(mask: u32) -> Uuid {
    Uuid::from_u128(((mask as u128) << 96) | FEATURE_CHARACTERISTIC_SUFFIX)
}

/// UUID of a feature service with the given leading 32 bits.
#[inline]
#[must_use]
pub const fn feature_service(prefix: u32) -> Uuid {
    Uuid::from_u128(((prefix as u128) << 96) | FEATURE_SERVICE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_from_characteristic() {
        let uuid = Uuid::from_u128(0x00e0_0000_0001_11e1_ac36_0002a5d5c51b);
        assert_eq!(feature_mask(&uuid), 0x00E0_0000);
        assert_eq!(feature_characteristic(0x00E0_0000), uuid);
    }

    #[test]
    fn test_feature_service_suffix() {
        assert!(is_feature_service(&Uuid::from_u128(
            0x0000_0000_0001_11e1_9ab4_0002a5d5c51b
        )));
        assert!(is_feature_service(&feature_service(0x1234_5678)));
        assert!(!is_feature_service(&DEBUG_SERVICE));
        assert!(!is_feature_service(&DEBUG_TERMINAL));
    }

    #[test]
    fn test_debug_characteristics_differ() {
        assert_ne!(DEBUG_TERMINAL, DEBUG_STDERR);
        assert_eq!(feature_mask(&DEBUG_TERMINAL), 1);
    }
}
