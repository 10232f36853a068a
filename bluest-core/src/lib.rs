//! Platform-agnostic BlueST node driver.
//!
//! This crate turns a GATT connection to a BlueST sensor node into typed
//! sensor values, firmware version reports and firmware upgrades. It knows
//! nothing about the BLE stack underneath: the transport is a
//! [`DeviceLink`], timing comes from an
//! [`embedded_hal_async::delay::DelayNs`], and results leave through an
//! [`EventSink`].
//!
//! # Overview
//!
//! - [`link`]: Transport trait ([`DeviceLink`]) and characteristic handles
//! - [`channel`]: Features multiplexed onto one characteristic ([`SensorChannel`])
//! - [`registry`]: Every channel of one node ([`ChannelRegistry`])
//! - [`transfer`]: Firmware upload state machine ([`FirmwareTransfer`])
//! - [`event`]: What the driver reports ([`Event`], [`EventSink`])
//! - [`node`]: Ties it all together ([`BlueStNode`])
//!
//! # Upgrade flow
//!
//! ```text
//! host                              node
//!  | -- "upgradeFw" len crc ------>  |   (write with response)
//!  | <----------------- crc echo --  |
//!  | -- 16-byte chunk ------------>  |   (write without response, paced)
//!  |            ...                  |
//!  | <---------------------- 0x01 -  |   then the node reboots
//! ```
//!
//! See [`BlueStNode::upgrade`].
//!
//! # Example
//!
//! ```rust
//! use bluest_core::{CharacteristicId, SensorChannel};
//! use bluest_proto::feature::MASK_TEMPERATURE;
//! use bluest_proto::{Reading, DEFAULT_MASK_POLICY};
//!
//! // Pressure, humidity and temperature share one characteristic.
//! let mut channel =
//!     SensorChannel::from_mask(CharacteristicId(0x0e), 0x001C_0000, &DEFAULT_MASK_POLICY);
//! channel.enable(MASK_TEMPERATURE).unwrap();
//!
//! // timestamp | pressure | humidity | temperature (25.0 C)
//! let payload = [0, 0, 0, 0, 0, 0, 0, 0, 0xFA, 0x00];
//! channel.decode(&payload, |feature| {
//!     assert_eq!(feature.last_value(), Some(&Reading::Scalar(77.0)));
//! });
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

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod channel;
pub mod event;
pub mod link;
pub mod node;
pub mod registry;
pub mod transfer;

// Re-export main types at crate root
pub use channel::{ChannelError, FeatureInstance, SensorChannel, SubscriptionChange};
pub use event::{status_text, Event, EventSink, NullSink, StatusText};
pub use link::{
    CharacteristicId, Characteristics, DeviceLink, DiscoveredCharacteristic, LinkError,
    Notification, Properties, WriteMode,
};
pub use node::{BlueStNode, NodeConfig, NodeError, TerminalConfig, DEFAULT_NODE_CONFIG};
pub use registry::{ChannelRegistry, FeatureRef};
pub use transfer::{
    CancelToken, FirmwareTransfer, Progress, TransferConfig, TransferError, TransferState,
};
