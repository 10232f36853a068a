//! Host side of the BlueST sensor protocol.
//!
//! This crate wires [`bluest_core`] to the host: a [`SimulatedNode`] that
//! plays the part of a SensiBLE board over an in-process link, and the
//! helpers the `simba-host` binary uses to present what the node reports.

pub mod report;
pub mod sim;

// Test builds need the executor's timer-queue symbols that embassy-time links against.
#[cfg(test)]
use embassy_executor as _;

// Re-export core types for convenience
pub use bluest_core::{
    BlueStNode, CancelToken, Event, EventSink, FeatureRef, NodeConfig, NodeError, TransferError,
};
pub use bluest_proto::{FirmwareVersion, Reading, UpgradeCommand};

pub use report::{describe, parse_hex, parse_mask_arg};
pub use sim::{SimConfig, SimulatedNode, DEFAULT_SIM_CONFIG};
