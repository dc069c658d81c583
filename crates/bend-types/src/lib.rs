//! Platform-agnostic types for ADS bend/stretch sensors.
//!
//! This crate holds everything that does not touch a radio: identifiers,
//! decoded samples, aggregated points, and the byte layouts of the angle
//! characteristic. bend-core builds the BLE session on top of it.
//!
//! # Example
//!
//! ```
//! use bend_types::{SampleRate, Sample};
//!
//! let rate = SampleRate::try_from(100).unwrap();
//! assert_eq!(rate.divisor(), 163);
//!
//! let sample = Sample::from_payload(&[0, 0, 0x80, 0x3F, 0, 0, 0, 0x40], 0, time::OffsetDateTime::UNIX_EPOCH);
//! assert_eq!(sample.angle, Some(1.0));
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod uuid;

pub use codec::{AnglePayload, decode_angle_payload, stretch_command};
pub use error::{ParseError, ParseResult};
pub use types::{
    AggregatedPoint, CharacteristicInfo, CharacteristicProperties, DeviceHandle, DeviceInfo,
    EndpointKey, Sample, SampleRate, SelectionFilter,
};
pub use uuid as uuids;
