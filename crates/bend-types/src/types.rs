//! Core types for ADS sensor data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

/// An addressable endpoint on the peripheral: a (service, characteristic) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EndpointKey {
    /// Service that owns the characteristic.
    pub service: Uuid,
    /// Characteristic identifier within the service.
    pub characteristic: Uuid,
}

impl EndpointKey {
    /// The angle characteristic: configuration writes and the sample stream.
    pub const ANGLE: Self = Self::new(crate::uuid::ANGLE_SERVICE, crate::uuid::ANGLE);

    /// Battery level percentage.
    pub const BATTERY_LEVEL: Self =
        Self::new(crate::uuid::BATTERY_SERVICE, crate::uuid::BATTERY_LEVEL);

    /// Create a key from a service and characteristic UUID.
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Key for a Device Information service characteristic.
    #[must_use]
    pub const fn device_info(characteristic: Uuid) -> Self {
        Self::new(crate::uuid::DEVICE_INFO_SERVICE, characteristic)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// GATT property flags of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Every property set. Handy for mocks.
    pub const ALL: Self = Self {
        read: true,
        write: true,
        write_without_response: true,
        notify: true,
        indicate: true,
    };

    /// Whether the peripheral can push value changes for this characteristic.
    #[must_use]
    pub fn supports_notifications(&self) -> bool {
        self.notify || self.indicate
    }

    /// Whether the characteristic accepts writes of either kind.
    #[must_use]
    pub fn supports_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A resolved characteristic on the currently connected link.
///
/// Only ever valid for the connection it was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicInfo {
    pub key: EndpointKey,
    pub properties: CharacteristicProperties,
}

impl CharacteristicInfo {
    #[must_use]
    pub fn new(key: EndpointKey, properties: CharacteristicProperties) -> Self {
        Self { key, properties }
    }
}

/// Identity of one physical peripheral.
///
/// The transport maps `id` back to its platform object. A session owns at
/// most one handle at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceHandle {
    /// Platform identifier (MAC address on Linux/Windows, UUID on macOS).
    pub id: String,
    /// Advertised local name, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Name if advertised, otherwise the identifier.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Criteria a peripheral must satisfy to be selected.
///
/// A device matches when its advertised name starts with `name_prefix`.
/// If the advertisement lists services, `service` must be among them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelectionFilter {
    pub name_prefix: String,
    pub service: Uuid,
}

impl Default for SelectionFilter {
    fn default() -> Self {
        Self {
            name_prefix: crate::uuid::DEVICE_NAME_PREFIX.to_string(),
            service: crate::uuid::ANGLE_SERVICE,
        }
    }
}

impl SelectionFilter {
    /// Check an advertisement against the filter.
    #[must_use]
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        let name_ok = name.is_some_and(|n| n.starts_with(&self.name_prefix));
        name_ok && (services.is_empty() || services.contains(&self.service))
    }
}

/// One decoded notification from the angle characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    /// Wall-clock time the notification was received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: time::OffsetDateTime,
    /// Bend angle in degrees. `None` when the payload could not be decoded.
    pub angle: Option<f32>,
    /// Stretch in millimetres. `None` when the payload could not be decoded.
    pub stretch: Option<f32>,
    /// Position in the subscription's stream, starting at zero.
    pub sequence: u64,
}

impl Sample {
    /// Build a sample from a raw notification payload.
    ///
    /// Malformed payloads yield a value-less sample rather than an error.
    #[must_use]
    pub fn from_payload(payload: &[u8], sequence: u64, timestamp: time::OffsetDateTime) -> Self {
        let decoded = crate::codec::decode_angle_payload(payload);
        Self {
            timestamp,
            angle: decoded.angle,
            stretch: decoded.stretch,
            sequence,
        }
    }

    /// True when the sample carries no measurement.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.angle.is_none() && self.stretch.is_none()
    }
}

/// Mean of one tumbling window.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AggregatedPoint {
    /// Start of the window (timestamp of its first sample).
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: time::OffsetDateTime,
    /// Mean angle over the window.
    pub value: f64,
    /// Mean stretch over the samples that carried one.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub secondary: Option<f64>,
    /// Number of samples folded into the point.
    pub count: usize,
}

/// Sample rates accepted by the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u32", into = "u32"))]
pub enum SampleRate {
    Hz1,
    #[default]
    Hz10,
    Hz20,
    Hz50,
    Hz100,
    Hz200,
    Hz333,
    Hz500,
}

impl SampleRate {
    /// Every supported rate, slowest first.
    pub const ALL: [SampleRate; 8] = [
        SampleRate::Hz1,
        SampleRate::Hz10,
        SampleRate::Hz20,
        SampleRate::Hz50,
        SampleRate::Hz100,
        SampleRate::Hz200,
        SampleRate::Hz333,
        SampleRate::Hz500,
    ];

    /// Base of the firmware's rate divisor.
    pub const DIVISOR_BASE: u32 = 16384;

    #[must_use]
    pub const fn hz(self) -> u32 {
        match self {
            SampleRate::Hz1 => 1,
            SampleRate::Hz10 => 10,
            SampleRate::Hz20 => 20,
            SampleRate::Hz50 => 50,
            SampleRate::Hz100 => 100,
            SampleRate::Hz200 => 200,
            SampleRate::Hz333 => 333,
            SampleRate::Hz500 => 500,
        }
    }

    /// `floor(16384 / hz)`, the value the firmware expects.
    #[must_use]
    pub const fn divisor(self) -> u16 {
        // 16384 / 1 is the largest result and still fits in u16.
        (Self::DIVISOR_BASE / self.hz()) as u16
    }

    /// The two-byte little-endian configuration command for this rate.
    ///
    /// ```
    /// use bend_types::SampleRate;
    ///
    /// assert_eq!(SampleRate::Hz10.command_bytes(), [0x66, 0x06]);
    /// assert_eq!(SampleRate::Hz1.command_bytes(), [0x00, 0x40]);
    /// ```
    #[must_use]
    pub const fn command_bytes(self) -> [u8; 2] {
        self.divisor().to_le_bytes()
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = ParseError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        SampleRate::ALL
            .into_iter()
            .find(|rate| rate.hz() == hz)
            .ok_or(ParseError::UnsupportedSampleRate(hz))
    }
}

impl From<SampleRate> for u32 {
    fn from(rate: SampleRate) -> Self {
        rate.hz()
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

/// Contents of the Device Information service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Advertised name.
    pub name: String,
    /// Sensor type (model number string).
    pub sensor_type: String,
    /// Firmware version.
    pub firmware: String,
    /// Hardware revision.
    pub hardware: String,
    /// Software revision.
    pub software: String,
    /// Manufacturer name.
    pub manufacturer: String,
}
