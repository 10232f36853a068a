//! Wire formats of the BlueST sensor protocol.
//!
//! This crate holds everything a host needs to understand a BlueST node
//! without touching a Bluetooth stack:
//!
//! - **Checksum**: [`crc32()`] - the node's word-oriented CRC-32 used to
//!   validate firmware images
//! - **Values**: [`codec`] - bounds-checked little-endian integer readers
//! - **Features**: [`REGISTRY`] and [`lookup()`] - one immutable
//!   [`FeatureDefinition`] per capability bit, decoding into a [`Reading`]
//! - **Masks**: [`parse_mask()`] - bind the features named by a
//!   characteristic's mask to payload offsets
//! - **GATT**: [`uuids`] - feature and debug service identifiers
//! - **Debug terminal**: [`terminal`] - text commands and version parsing
//! - **Firmware**: [`UpgradeCommand`] - upgrade handshake framing
//! - **Advertising**: [`Advertisement`] - manufacturer data parsing
//!
//! # Notification Layout
//!
//! ```text
//! | timestamp (2) | feature A | feature B | ...
//! ```
//!
//! Features appear in mask-bit-descending order, each with the fixed width of
//! its [`FeatureKind`]. All integers are little-endian.
//!
//! # Examples
//!
//! ## Decoding a Notification
//!
//! ```
//! use bluest_proto::{parse_mask, Reading};
//!
//! // Temperature (0x0004_0000): 25.0 C as 250 tenths.
//! let bindings = parse_mask(0x0004_0000);
//! let payload = [0x00, 0x00, 0xFA, 0x00];
//!
//! let binding = &bindings[0];
//! let reading = binding.definition.decode(&payload, binding.offset).unwrap();
//! assert_eq!(reading, Reading::Scalar(77.0));
//! ```
//!
//! ## Announcing a Firmware Image
//!
//! ```
//! use bluest_proto::UpgradeCommand;
//!
//! let image = [0xA5u8; 40];
//! let frame = UpgradeCommand::for_image(&image).unwrap().to_bytes();
//! assert!(frame.starts_with(b"upgradeFw"));
//! ```
//!
//! # Features
//!
//! - **`std`**: Enable standard library support (for host testing)
//! - **`defmt`**: Enable defmt formatting (for embedded logging)
//!
//! # No-std Support
//!
//! This crate is `#![no_std]` by default and uses no heap allocations.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod advertising;
pub mod codec;
pub mod crc;
pub mod feature;
pub mod firmware;
pub mod mask;
pub mod terminal;
pub mod uuids;

// Re-export types at crate root for convenience
pub use advertising::{Advertisement, MacAddress};
pub use codec::CodecError;
pub use crc::{aligned_prefix, crc32, Crc32Digest, CrcError};
pub use feature::{
    lookup, BatteryReading, BatteryStatus, FeatureCommand, FeatureDefinition, FeatureKind,
    Reading, Transform, REGISTRY,
};
pub use firmware::{UpgradeCommand, MAX_CHUNK_LEN, UPGRADE_TAG};
pub use mask::{
    parse as parse_mask, parse_with_policy, payload_len, Binding, Bindings, DeniedWidth,
    MaskPolicy, DEFAULT_MASK_POLICY, TIMESTAMP_LEN,
};
pub use terminal::{FirmwareVersion, ResponseAccumulator, TerminalError};
