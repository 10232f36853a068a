//! Arena of the sensor channels discovered on one node.

use heapless::Vec;

use crate::channel::{ChannelError, FeatureInstance, SensorChannel};
use crate::link::CharacteristicId;

/// Most feature characteristics tracked per node.
pub const MAX_CHANNELS: usize = 8;

/// Identifies one feature on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FeatureRef {
    pub channel: CharacteristicId,
    /// The feature's mask bit.
    pub mask: u32,
}

/// Channels keyed by characteristic handle.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Vec<SensorChannel, MAX_CHANNELS>,
}

impl ChannelRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Add a channel, replacing any channel on the same handle.
    pub fn insert(&mut self, channel: SensorChannel) -> Result<(), ChannelError> {
        if let Some(existing) = self.get_mut(channel.id()) {
            *existing = channel;
            return Ok(());
        }
        self.channels.push(channel).map_err(|_| ChannelError::Full)
    }

    #[must_use]
    pub fn get(&self, id: CharacteristicId) -> Option<&SensorChannel> {
        self.channels.iter().find(|c| c.id() == id)
    }

    pub fn get_mut(&mut self, id: CharacteristicId) -> Option<&mut SensorChannel> {
        self.channels.iter_mut().find(|c| c.id() == id)
    }

    /// Look up a bound feature.
    #[must_use]
    pub fn feature(&self, feature: FeatureRef) -> Option<&FeatureInstance> {
        self.get(feature.channel)?.feature(feature.mask)
    }

    /// First feature with `mask` on any channel.
    #[must_use]
    pub fn find(&self, mask: u32) -> Option<FeatureRef> {
        self.channels.iter().find_map(|c| {
            c.feature(mask).map(|_| FeatureRef {
                channel: c.id(),
                mask,
            })
        })
    }

    /// Every bound feature, channel by channel.
    pub fn features(&self) -> impl Iterator<Item = (FeatureRef, &FeatureInstance)> {
        self.channels.iter().flat_map(|c| {
            c.features().iter().map(move |f| {
                (
                    FeatureRef {
                        channel: c.id(),
                        mask: f.definition().mask,
                    },
                    f,
                )
            })
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorChannel> {
        self.channels.iter()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every channel, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
