//! Feature mask parsing.
//!
//! A feature characteristic carries a 32-bit capability mask in the first four
//! bytes of its UUID. Every set bit in the high half names one feature, and the
//! notification payload packs those features contiguously, in bit-descending
//! order, right after a 2-byte timestamp:
//!
//! ```text
//! | ts (2) | feature 0x0080_0000 (6) | feature 0x0040_0000 (6) | ...
//! ```
//!
//! [`parse`] walks the mask and assigns each known feature its byte offset.

use heapless::Vec;
use log::debug;

use crate::feature::{self, FeatureDefinition, MASK_AUDIO_ADPCM};

/// Bytes reserved for the timestamp at the start of every notification.
pub const TIMESTAMP_LEN: usize = 2;

/// Number of mask bits that can name a feature.
pub const MASK_FEATURE_BITS: usize = 16;

/// Highest mask bit; the walk starts here.
const FIRST_FEATURE_BIT: u32 = 0x8000_0000;

/// What a deny-listed feature does to the payload layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeniedWidth {
    /// The device omits the field; no bytes are consumed.
    Skip,
    /// The field is still present on the wire; its width is consumed but the
    /// feature is not bound.
    Reserve,
}

/// Which mask bits are never surfaced, and how they affect offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MaskPolicy {
    /// Bits that are never bound even when the device reports them.
    pub deny: u32,
    pub denied_width: DeniedWidth,
}

/// Default policy: hide the ADPCM audio stream and consume no width for it.
pub const DEFAULT_MASK_POLICY: MaskPolicy = MaskPolicy {
    deny: MASK_AUDIO_ADPCM,
    denied_width: DeniedWidth::Skip,
};

impl Default for MaskPolicy {
    fn default() -> Self {
        DEFAULT_MASK_POLICY
    }
}

/// A feature definition placed at a byte offset within a channel payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binding {
    pub definition: &'static FeatureDefinition,
    pub offset: usize,
}

/// Ordered bindings for one mask, at most one per feature bit.
pub type Bindings = Vec<Binding, MASK_FEATURE_BITS>;

/// Parse `mask` with the [`DEFAULT_MASK_POLICY`].
///
/// # Example
///
/// ```
/// use bluest_proto::mask::parse;
///
/// let bindings = parse(0x00C0_0000);
/// assert_eq!(bindings[0].definition.name, "Accelerometer");
/// assert_eq!(bindings[0].offset, 2);
/// assert_eq!(bindings[1].definition.name, "Gyroscope");
/// assert_eq!(bindings[1].offset, 8);
/// ```
#[must_use]
pub fn parse(mask: u32) -> Bindings {
    parse_with_policy(mask, &DEFAULT_MASK_POLICY)
}

/// Walk the 16 high bits of `mask`, most significant first, and bind every
/// set bit that has a registry entry and is not denied.
///
/// Unknown bits are skipped without consuming width since their size is not
/// known. Denied bits follow [`MaskPolicy::denied_width`].
#[must_use]
pub fn parse_with_policy(mask: u32, policy: &MaskPolicy) -> Bindings {
    let mut bindings = Bindings::new();
    for slot in Walk::new(mask, policy).filter(|slot| slot.bound) {
        // One push per distinct bit; capacity equals the bit count.
        let _ = bindings.push(Binding {
            definition: slot.definition,
            offset: slot.offset,
        });
    }
    bindings
}

/// Payload length needed to carry every feature of `mask` under `policy`.
#[must_use]
pub fn payload_len(mask: u32, policy: &MaskPolicy) -> usize {
    TIMESTAMP_LEN + Walk::new(mask, policy).map(|slot| slot.width).sum::<usize>()
}

/// A known feature bit met during the walk.
struct Slot {
    definition: &'static FeatureDefinition,
    offset: usize,
    /// Bytes this bit takes in the payload.
    width: usize,
    bound: bool,
}

/// Iterates the known feature bits of a mask in payload order.
struct Walk<'p> {
    mask: u32,
    policy: &'p MaskPolicy,
    bit: u32,
    offset: usize,
}

impl<'p> Walk<'p> {
    fn new(mask: u32, policy: &'p MaskPolicy) -> Self {
        Self {
            mask,
            policy,
            bit: FIRST_FEATURE_BIT,
            offset: TIMESTAMP_LEN,
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        while self.bit.leading_zeros() < MASK_FEATURE_BITS as u32 {
            let bit = self.bit;
            self.bit >>= 1;
            if self.mask & bit == 0 {
                continue;
            }
            let Some(definition) = feature::lookup(bit) else {
                debug!("mask bit {bit:#010x} has no feature definition");
                continue;
            };

            let bound = self.policy.deny & bit == 0;
            let width = if bound || self.policy.denied_width == DeniedWidth::Reserve {
                definition.width()
            } else {
                0
            };
            if !bound {
                debug!("mask bit {bit:#010x} ({}) is denied", definition.name);
            }

            let slot = Slot {
                definition,
                offset: self.offset,
                width,
                bound,
            };
            self.offset += width;
            return Some(slot);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureKind, MASK_ACCELEROMETER, MASK_BATTERY, MASK_GYROSCOPE};

    #[test]
    fn test_single_accelerometer() {
        let bindings = parse(0x0080_0000);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].definition.mask, MASK_ACCELEROMETER);
        assert_eq!(bindings[0].definition.kind, FeatureKind::Int16x3);
        assert_eq!(bindings[0].offset, 2);
    }

    #[test]
    fn test_accelerometer_and_gyroscope_in_bit_order() {
        let bindings = parse(0x00C0_0000);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].definition.name, "Accelerometer");
        assert_eq!(bindings[0].offset, 2);
        assert_eq!(bindings[1].definition.mask, MASK_GYROSCOPE);
        assert_eq!(bindings[1].offset, 8);
    }

    #[test]
    fn test_denied_bit_is_skipped_without_width() {
        // ADPCM sits between mic level (0x0400_0000) and DoA (0x1000_0000).
        let bindings = parse(0x1C00_0000);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].definition.name, "Direction of arrival");
        assert_eq!(bindings[0].offset, 2);
        assert_eq!(bindings[1].definition.name, "Mic Level");
        assert_eq!(bindings[1].offset, 4);
        assert!(bindings.iter().all(|b| b.definition.mask != MASK_AUDIO_ADPCM));
    }

    #[test]
    fn test_denied_bit_reserves_width_when_configured() {
        let policy = MaskPolicy {
            denied_width: DeniedWidth::Reserve,
            ..DEFAULT_MASK_POLICY
        };
        let bindings = parse_with_policy(0x1C00_0000, &policy);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].definition.name, "Mic Level");
        assert_eq!(bindings[1].offset, 6);
        assert_eq!(payload_len(0x1C00_0000, &policy), 10);
    }

    #[test]
    fn test_payload_len_ends_after_last_binding() {
        let reserve = MaskPolicy {
            denied_width: DeniedWidth::Reserve,
            ..DEFAULT_MASK_POLICY
        };
        for policy in [DEFAULT_MASK_POLICY, reserve] {
            for mask in [0x00C0_0000, 0x001C_0000, 0x1C00_0000, 0x2E1C_0000] {
                let last = *parse_with_policy(mask, &policy).last().unwrap();
                assert_eq!(
                    payload_len(mask, &policy),
                    last.offset + last.definition.width(),
                    "mask {mask:#010x}"
                );
            }
        }
    }

    #[test]
    fn test_only_denied_bit_yields_nothing() {
        assert!(parse(MASK_AUDIO_ADPCM).is_empty());
        assert_eq!(payload_len(MASK_AUDIO_ADPCM, &DEFAULT_MASK_POLICY), 2);
    }

    #[test]
    fn test_low_bits_and_unknown_bits_ignored() {
        assert!(parse(0x0000_FFFF).is_empty());
        assert!(parse(0x8000_0000).is_empty());
    }

    #[test]
    fn test_offsets_are_monotonic() {
        let bindings = parse(0x7FFF_0000);
        assert_eq!(bindings.len(), 14);

        let mut expected = TIMESTAMP_LEN;
        for binding in &bindings {
            assert_eq!(binding.offset, expected);
            expected += binding.definition.width();
        }
        assert_eq!(expected, payload_len(0x7FFF_0000, &DEFAULT_MASK_POLICY));
    }

    #[test]
    fn test_environmental_mask() {
        // Pressure, humidity, temperature, battery.
        let bindings = parse(0x001C_0000 | MASK_BATTERY);
        let offsets: [usize; 4] = core::array::from_fn(|i| bindings[i].offset);
        assert_eq!(offsets, [2, 6, 8, 10]);
        assert_eq!(payload_len(0x001E_0000, &DEFAULT_MASK_POLICY), 17);
    }
}
