//! Device link trait and the types that cross it.
//!
//! The link is the Bluetooth transport as seen from the protocol: it lists
//! characteristics, toggles notifications, writes, and delivers notifications.
//! Connection management, pairing and scanning stay on the other side.

use core::future::Future;
use core::ops::{BitOr, BitOrAssign};

use heapless::Vec;
use uuid::Uuid;

/// Most characteristics a node is expected to expose.
pub const MAX_CHARACTERISTICS: usize = 24;

/// Largest notification payload (ATT MTU 247 minus the 3-byte header).
pub const MAX_NOTIFICATION_LEN: usize = 244;

/// Stable handle assigned by the transport at discovery time.
///
/// Channels and features are keyed by this handle, never by UUID: two
/// characteristics with the same UUID in different services are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicId(pub u16);

/// GATT characteristic properties.
///
/// # Example
///
/// ```
/// use bluest_core::Properties;
///
/// let props = Properties::READ | Properties::NOTIFY;
/// assert!(props.contains(Properties::NOTIFY));
/// assert!(!props.contains(Properties::WRITE));
/// ```
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Properties(pub u8);

impl Properties {
    pub const READ: Self = Self(1 << 1);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(1 << 2);
    pub const WRITE: Self = Self(1 << 3);
    pub const NOTIFY: Self = Self(1 << 4);

    pub const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Properties) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for Properties {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Properties {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One characteristic reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub id: CharacteristicId,
    /// UUID of the owning service.
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: Properties,
}

/// Everything discovery found on the node.
pub type Characteristics = Vec<DiscoveredCharacteristic, MAX_CHARACTERISTICS>;

/// Whether a write waits for the peer's confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// A notification placed in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Notification {
    pub characteristic: CharacteristicId,
    /// Number of payload bytes written to the buffer.
    pub len: usize,
}

/// Error type for link operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// The peer is not connected.
    Disconnected,
    /// A write was rejected or not confirmed.
    Write,
    /// Enabling or disabling notifications failed.
    Notify,
    /// Service or characteristic discovery failed.
    Discovery,
    /// A required characteristic was not discovered.
    MissingCharacteristic,
}

impl core::fmt::Display for LinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            LinkError::Disconnected => "device disconnected",
            LinkError::Write => "write failed",
            LinkError::Notify => "notification setup failed",
            LinkError::Discovery => "discovery failed",
            LinkError::MissingCharacteristic => "required characteristic not found",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LinkError {}

/// Async trait for the Bluetooth transport of one connected node.
///
/// # Cancellation
///
/// [`receive`](DeviceLink::receive) is raced against timers, so dropping its
/// future before completion must not lose a notification.
///
/// # `no_std` Compatibility
///
/// The trait needs neither `std` nor a heap, so firmware transports can
/// implement it as well as host ones.
pub trait DeviceLink {
    /// List every characteristic of every service.
    fn discover(&mut self) -> impl Future<Output = Result<Characteristics, LinkError>>;

    /// Enable or disable notifications on a characteristic.
    fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> impl Future<Output = Result<(), LinkError>>;

    /// Write `data` to a characteristic.
    fn write(
        &mut self,
        characteristic: CharacteristicId,
        data: &[u8],
        mode: WriteMode,
    ) -> impl Future<Output = Result<(), LinkError>>;

    /// Wait for the next notification and copy its payload into `buf`.
    ///
    /// Payloads longer than `buf` are truncated.
    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<Notification, LinkError>>;

    /// Drop and re-establish the connection, e.g. after the node rebooted.
    fn reconnect(&mut self) -> impl Future<Output = Result<(), LinkError>>;

    /// Check if the node is currently connected.
    fn is_connected(&self) -> bool;
}
