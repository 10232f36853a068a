//! Typed events emitted by the node driver.
//!
//! Presentation layers subscribe through an [`EventSink`]; the driver never
//! touches UI state directly.

use bluest_proto::terminal::FirmwareVersion;
use bluest_proto::Reading;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Sender;
use heapless::String;
use log::warn;

use crate::registry::FeatureRef;
use crate::transfer::{Progress, TransferError};

/// Capacity of a [`StatusText`].
pub const MAX_STATUS_LEN: usize = 128;

/// Free-form text from the node, truncated to [`MAX_STATUS_LEN`].
pub type StatusText = String<MAX_STATUS_LEN>;

/// Something the presentation layer may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A feature was bound during discovery.
    FeatureDiscovered {
        feature: FeatureRef,
        name: &'static str,
        unit: &'static str,
    },
    /// An enabled feature decoded a new value.
    ValueUpdated { feature: FeatureRef, value: Reading },
    /// Every few chunks of an upload.
    TransferProgress(Progress),
    /// The node accepted the whole image.
    TransferCompleted,
    TransferFailed(TransferError),
    VersionReported(FirmwareVersion),
    /// Text from the debug terminal or error stream that is not a reply to a
    /// pending request.
    StatusMessage(StatusText),
}

/// Decode Latin-1 bytes into a status line, dropping the trailing line break
/// and truncating what does not fit.
#[must_use]
pub fn status_text(data: &[u8]) -> StatusText {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    let data = &data[..end.min(MAX_STATUS_LEN)];

    let mut text = StatusText::new();
    // Latin-1 above 0x7F takes two UTF-8 bytes; keep what fits.
    for &byte in data {
        if text.push(char::from(byte)).is_err() {
            break;
        }
    }
    text
}

/// Trait for consumers of node events.
pub trait EventSink {
    /// Deliver one event. Must not block.
    fn emit(&mut self, event: Event);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: Event) {}
}

impl<T: EventSink + ?Sized> EventSink for &mut T {
    fn emit(&mut self, event: Event) {
        (**self).emit(event);
    }
}

/// Collect events in memory, e.g. for host tools and tests.
#[cfg(any(test, feature = "std"))]
impl EventSink for std::vec::Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// Forward events into an embassy channel, dropping them when it is full.
impl<M: RawMutex, const N: usize> EventSink for Sender<'_, M, Event, N> {
    fn emit(&mut self, event: Event) {
        if self.try_send(event).is_err() {
            warn!("event channel full, dropping event");
        }
    }
}
