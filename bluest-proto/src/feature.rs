//! BlueST feature catalogue and value decoding.
//!
//! Each bit in the high half of a characteristic's capability mask names one
//! feature. [`REGISTRY`] holds the immutable definition for every known bit;
//! [`FeatureDefinition::decode`] turns the bytes at a feature's offset into a
//! [`Reading`].
//!
//! Decoding is driven by two closed enums: [`FeatureKind`] fixes the wire
//! width and integer type, [`Transform`] says how the raw integers become a
//! physical value.

use core::fmt::{self, Write as _};

use crate::codec::{self, CodecError};

/// Wire encoding of a feature value.
///
/// The width is part of the payload layout contract and is never inferred
/// from the notification length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FeatureKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    /// Three signed 16-bit values (X, Y, Z).
    Int16x3,
    /// Three 16-bit values followed by one unsigned byte.
    Int16x3PlusUInt8,
}

impl FeatureKind {
    /// Number of payload bytes the feature occupies.
    #[inline]
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            FeatureKind::Int8 | FeatureKind::UInt8 => 1,
            FeatureKind::Int16 | FeatureKind::UInt16 => 2,
            FeatureKind::Int32 | FeatureKind::UInt32 => 4,
            FeatureKind::Int16x3 => 6,
            FeatureKind::Int16x3PlusUInt8 => 7,
        }
    }
}

/// How raw integers are turned into a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transform {
    /// `raw * scale`.
    Linear,
    /// `raw * scale` in °C, reported in °F.
    CelsiusToFahrenheit,
    /// Three axes, each `raw * scale`.
    Axes,
    /// Percentage, voltage, current and charger status.
    Battery,
}

/// Write-back behaviour attached to a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FeatureCommand {
    /// Flip the remote switch.
    ToggleSwitch,
}

/// Header of the switch command payload; the fifth byte is the new state.
pub const SWITCH_COMMAND_PREFIX: [u8; 4] = [0x20, 0x00, 0x00, 0x00];

impl FeatureCommand {
    /// Build the payload to write, given the feature's last decoded value.
    ///
    /// A switch counts as "on" when its displayed value starts with `1`.
    #[must_use]
    pub fn payload(self, last: Option<&Reading>) -> [u8; 5] {
        match self {
            FeatureCommand::ToggleSwitch => {
                let on = last.is_some_and(Reading::displays_as_on);
                let [a, b, c, d] = SWITCH_COMMAND_PREFIX;
                [a, b, c, d, u8::from(!on)]
            }
        }
    }
}

/// Immutable template for one feature-mask bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureDefinition {
    /// The single mask bit this feature occupies.
    pub mask: u32,
    pub name: &'static str,
    pub unit: &'static str,
    pub kind: FeatureKind,
    pub scale: f32,
    pub transform: Transform,
    pub command: Option<FeatureCommand>,
}

impl FeatureDefinition {
    const fn linear(mask: u32, name: &'static str, unit: &'static str, kind: FeatureKind) -> Self {
        Self {
            mask,
            name,
            unit,
            kind,
            scale: 1.0,
            transform: Transform::Linear,
            command: None,
        }
    }

    const fn scaled(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    const fn transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    const fn command(mut self, command: FeatureCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Payload width of this feature.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> usize {
        self.kind.width()
    }

    /// Decode this feature's value from `payload` at `offset`.
    ///
    /// Fails without reading when the feature would overrun the payload.
    pub fn decode(&self, payload: &[u8], offset: usize) -> Result<Reading, CodecError> {
        match self.transform {
            Transform::Linear => {
                let raw = self.read_scalar(payload, offset)?;
                Ok(Reading::Scalar(raw * self.scale))
            }
            Transform::CelsiusToFahrenheit => {
                let raw = self.read_scalar(payload, offset)?;
                Ok(Reading::Scalar(celsius_to_fahrenheit(raw * self.scale)))
            }
            Transform::Axes => {
                let [x, y, z] = codec::read_i16x3(payload, offset)?;
                Ok(Reading::Axes {
                    x: f32::from(x) * self.scale,
                    y: f32::from(y) * self.scale,
                    z: f32::from(z) * self.scale,
                })
            }
            Transform::Battery => decode_battery(payload, offset).map(Reading::Battery),
        }
    }

    /// Read a single integer and widen it; composite kinds yield their first word.
    fn read_scalar(&self, payload: &[u8], offset: usize) -> Result<f32, CodecError> {
        // Composite kinds still have to fit entirely.
        if payload.len() < offset.saturating_add(self.width()) {
            return Err(CodecError::OutOfBounds {
                offset,
                width: self.width(),
                len: payload.len(),
            });
        }

        Ok(match self.kind {
            FeatureKind::Int8 => f32::from(codec::read_i8(payload, offset)?),
            FeatureKind::UInt8 => f32::from(codec::read_u8(payload, offset)?),
            FeatureKind::Int16 | FeatureKind::Int16x3 | FeatureKind::Int16x3PlusUInt8 => {
                f32::from(codec::read_i16(payload, offset)?)
            }
            FeatureKind::UInt16 => f32::from(codec::read_u16(payload, offset)?),
            FeatureKind::Int32 => codec::read_i32(payload, offset)? as f32,
            FeatureKind::UInt32 => codec::read_u32(payload, offset)? as f32,
        })
    }
}

/// Convert degrees Celsius to degrees Fahrenheit.
#[inline]
#[must_use]
pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 1.8 + 32.0
}

/// Charger state reported in the last byte of a battery sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatteryStatus {
    Low,
    Discharging,
    Plugged,
    Charging,
    Unknown(u8),
}

impl From<u8> for BatteryStatus {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => BatteryStatus::Low,
            0x01 => BatteryStatus::Discharging,
            0x02 => BatteryStatus::Plugged,
            0x03 => BatteryStatus::Charging,
            other => BatteryStatus::Unknown(other),
        }
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatteryStatus::Low => "Low",
            BatteryStatus::Discharging => "Discharging",
            BatteryStatus::Plugged => "Plugged",
            BatteryStatus::Charging => "Charging",
            BatteryStatus::Unknown(_) => "-",
        })
    }
}

/// Decoded battery sample.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryReading {
    /// Charge level in percent.
    pub percentage: f32,
    /// Cell voltage in volts.
    pub voltage: f32,
    /// Current in milliamps, negative while discharging.
    pub current: f32,
    pub status: BatteryStatus,
}

/// Decode the composite battery layout starting at `offset`.
///
/// | Offset | Type | Scale | Field |
/// |--------|------|-------|-------|
/// | +0 | u16 | 0.1 | percentage |
/// | +2 | i16 | 0.001 | voltage |
/// | +4 | i16 | 0.1 | current |
/// | +6 | u8 | - | status |
pub fn decode_battery(payload: &[u8], offset: usize) -> Result<BatteryReading, CodecError> {
    let ([percentage, voltage, current], status) = codec::read_i16x3_u8(payload, offset)?;
    Ok(BatteryReading {
        percentage: f32::from(percentage as u16) * 0.1,
        voltage: f32::from(voltage) * 0.001,
        current: f32::from(current) * 0.1,
        status: BatteryStatus::from(status),
    })
}

/// A decoded feature value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reading {
    Scalar(f32),
    Axes { x: f32, y: f32, z: f32 },
    Battery(BatteryReading),
}

impl Reading {
    /// Whether the displayed form of this value starts with `1`.
    #[must_use]
    pub fn displays_as_on(&self) -> bool {
        let mut text = heapless::String::<48>::new();
        // A value too long for the buffer keeps its leading characters.
        let _ = write!(text, "{self}");
        text.starts_with('1')
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Scalar(value) => write!(f, "{value}"),
            Reading::Axes { x, y, z } => write!(f, "X: {x}\nY: {y}\nZ: {z}"),
            Reading::Battery(battery) => write!(
                f,
                "{}%\n{} V\n{} mA\n{}",
                battery.percentage, battery.voltage, battery.current, battery.status
            ),
        }
    }
}

/// Mask bit of the accelerometer feature.
pub const MASK_ACCELEROMETER: u32 = 0x0080_0000;
/// Mask bit of the gyroscope feature.
pub const MASK_GYROSCOPE: u32 = 0x0040_0000;
/// Mask bit of the switch feature.
pub const MASK_SWITCH: u32 = 0x2000_0000;
/// Mask bit of the ADPCM audio stream.
pub const MASK_AUDIO_ADPCM: u32 = 0x0800_0000;
/// Mask bit of the battery feature.
pub const MASK_BATTERY: u32 = 0x0002_0000;
/// Mask bit of the primary temperature feature.
pub const MASK_TEMPERATURE: u32 = 0x0004_0000;

/// Every known feature, in mask-bit-descending order.
pub static REGISTRY: [FeatureDefinition; 15] = {
    use FeatureKind::*;
    [
        FeatureDefinition::linear(0x4000_0000, "Adpcm sync", "-", UInt32),
        FeatureDefinition::linear(MASK_SWITCH, "Switch", "-", UInt8)
            .command(FeatureCommand::ToggleSwitch),
        FeatureDefinition::linear(0x1000_0000, "Direction of arrival", "-", Int16),
        FeatureDefinition::linear(MASK_AUDIO_ADPCM, "Audio ADPCM", "-", Int16),
        FeatureDefinition::linear(0x0400_0000, "Mic Level", "db", UInt32),
        FeatureDefinition::linear(0x0200_0000, "Proximity", "mm", UInt16),
        FeatureDefinition::linear(0x0100_0000, "Luminosity", "lux", UInt16),
        FeatureDefinition::linear(MASK_ACCELEROMETER, "Accelerometer", "mg", Int16x3)
            .transform(Transform::Axes),
        FeatureDefinition::linear(MASK_GYROSCOPE, "Gyroscope", "dps", Int16x3)
            .transform(Transform::Axes)
            .scaled(0.1),
        FeatureDefinition::linear(0x0020_0000, "Magnetometer", "mGa", Int16x3)
            .transform(Transform::Axes),
        FeatureDefinition::linear(0x0010_0000, "Pressure", "mBar", UInt32).scaled(0.01),
        FeatureDefinition::linear(0x0008_0000, "Humidity", "%", Int16).scaled(0.1),
        FeatureDefinition::linear(MASK_TEMPERATURE, "Temperature", "F", Int16)
            .scaled(0.1)
            .transform(Transform::CelsiusToFahrenheit),
        FeatureDefinition::linear(MASK_BATTERY, "Battery", "-", Int16x3PlusUInt8)
            .transform(Transform::Battery),
        FeatureDefinition::linear(0x0001_0000, "Temperature 2", "F", Int16)
            .scaled(0.1)
            .transform(Transform::CelsiusToFahrenheit),
    ]
};

/// Look up the definition for a single mask bit.
#[must_use]
pub fn lookup(mask_bit: u32) -> Option<&'static FeatureDefinition> {
    REGISTRY.iter().find(|def| def.mask == mask_bit)
}
