//! Sensor channels: the features multiplexed onto one characteristic.

use bluest_proto::mask::{self, Binding, MaskPolicy, MASK_FEATURE_BITS, TIMESTAMP_LEN};
use bluest_proto::{FeatureDefinition, Reading};
use heapless::Vec;
use log::{debug, warn};

use crate::link::CharacteristicId;

/// Error type for channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError {
    /// No feature with that mask bit on this channel.
    UnknownFeature,
    /// No such channel.
    UnknownChannel,
    /// Channel or registry capacity exhausted.
    Full,
    /// A binding would start before the end of the previous one.
    Overlap,
}

impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ChannelError::UnknownFeature => "feature not bound to this channel",
            ChannelError::UnknownChannel => "unknown channel",
            ChannelError::Full => "channel capacity exhausted",
            ChannelError::Overlap => "feature offset overlaps previous feature",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ChannelError {}

/// What the transport has to do after a feature was enabled or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscriptionChange {
    /// Notifications stay as they are.
    Unchanged,
    /// The first feature was enabled; turn notifications on.
    Subscribe,
    /// The last feature was disabled; turn notifications off.
    Unsubscribe,
}

/// A feature definition bound to an offset on a live channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureInstance {
    binding: Binding,
    last_value: Option<Reading>,
    enabled: bool,
}

impl FeatureInstance {
    #[inline]
    #[must_use]
    pub fn definition(&self) -> &'static FeatureDefinition {
        self.binding.definition
    }

    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.binding.offset
    }

    /// Value from the most recent successful decode.
    #[inline]
    #[must_use]
    pub fn last_value(&self) -> Option<&Reading> {
        self.last_value.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn end(&self) -> usize {
        self.binding.offset + self.binding.definition.width()
    }
}

/// The ordered features bound to one characteristic.
///
/// Offsets increase strictly with binding order and start at
/// [`TIMESTAMP_LEN`].
#[derive(Debug, Clone)]
pub struct SensorChannel {
    id: CharacteristicId,
    mask: u32,
    features: Vec<FeatureInstance, MASK_FEATURE_BITS>,
}

impl SensorChannel {
    /// Create a channel with no features bound.
    #[must_use]
    pub fn new(id: CharacteristicId, mask: u32) -> Self {
        Self {
            id,
            mask,
            features: Vec::new(),
        }
    }

    /// Create a channel and bind every feature `mask` names under `policy`.
    ///
    /// # Example
    ///
    /// ```
    /// use bluest_core::{CharacteristicId, SensorChannel};
    /// use bluest_proto::DEFAULT_MASK_POLICY;
    ///
    /// let channel = SensorChannel::from_mask(CharacteristicId(7), 0x00C0_0000, &DEFAULT_MASK_POLICY);
    /// assert_eq!(channel.features().len(), 2);
    /// assert_eq!(channel.expected_len(), 14);
    /// ```
    #[must_use]
    pub fn from_mask(id: CharacteristicId, mask: u32, policy: &MaskPolicy) -> Self {
        let mut channel = Self::new(id, mask);
        for binding in mask::parse_with_policy(mask, policy) {
            // Parser output is ordered, unique per bit and within capacity.
            let _ = channel.bind(binding.definition, binding.offset);
        }
        channel
    }

    /// Append a feature at `offset`.
    pub fn bind(
        &mut self,
        definition: &'static FeatureDefinition,
        offset: usize,
    ) -> Result<(), ChannelError> {
        let start = self.features.last().map_or(TIMESTAMP_LEN, FeatureInstance::end);
        if offset < start {
            return Err(ChannelError::Overlap);
        }
        self.features
            .push(FeatureInstance {
                binding: Binding { definition, offset },
                last_value: None,
                enabled: false,
            })
            .map_err(|_| ChannelError::Full)
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> CharacteristicId {
        self.id
    }

    /// Capability mask taken from the characteristic UUID.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline]
    #[must_use]
    pub fn features(&self) -> &[FeatureInstance] {
        &self.features
    }

    /// Feature occupying `mask_bit`, if bound here.
    #[must_use]
    pub fn feature(&self, mask_bit: u32) -> Option<&FeatureInstance> {
        self.features.iter().find(|f| f.definition().mask == mask_bit)
    }

    /// Payload length covering every bound feature.
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.features.last().map_or(TIMESTAMP_LEN, FeatureInstance::end)
    }

    /// Whether any feature is enabled, i.e. notifications should be on.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.features.iter().any(|f| f.enabled)
    }

    /// Start decoding `mask_bit`.
    pub fn enable(&mut self, mask_bit: u32) -> Result<SubscriptionChange, ChannelError> {
        let was_subscribed = self.is_subscribed();
        self.feature_mut(mask_bit)?.enabled = true;
        Ok(if was_subscribed {
            SubscriptionChange::Unchanged
        } else {
            SubscriptionChange::Subscribe
        })
    }

    /// Stop decoding `mask_bit`.
    pub fn disable(&mut self, mask_bit: u32) -> Result<SubscriptionChange, ChannelError> {
        let was_subscribed = self.is_subscribed();
        self.feature_mut(mask_bit)?.enabled = false;
        Ok(if was_subscribed && !self.is_subscribed() {
            SubscriptionChange::Unsubscribe
        } else {
            SubscriptionChange::Unchanged
        })
    }

    /// Decode `payload` into every enabled feature.
    ///
    /// `on_value` is called for each feature that decoded. Features whose
    /// bytes lie past the end of `payload` keep their previous value. Returns
    /// the number of features updated.
    pub fn decode(
        &mut self,
        payload: &[u8],
        mut on_value: impl FnMut(&FeatureInstance),
    ) -> usize {
        if payload.len() < self.expected_len() {
            debug!(
                "channel {:?}: payload {} bytes, expected {}",
                self.id,
                payload.len(),
                self.expected_len()
            );
        }

        let mut updated = 0;
        for feature in self.features.iter_mut().filter(|f| f.enabled) {
            match feature.definition().decode(payload, feature.offset()) {
                Ok(value) => {
                    feature.last_value = Some(value);
                    updated += 1;
                    on_value(feature);
                }
                Err(e) => warn!("{}: {}", feature.definition().name, e),
            }
        }
        updated
    }

    fn feature_mut(&mut self, mask_bit: u32) -> Result<&mut FeatureInstance, ChannelError> {
        self.features
            .iter_mut()
            .find(|f| f.definition().mask == mask_bit)
            .ok_or(ChannelError::UnknownFeature)
    }
}

impl PartialEq for SensorChannel {
    /// Channels are the same iff they sit on the same characteristic handle.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
