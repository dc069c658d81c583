//! Wire encoding for the angle characteristic.
//!
//! Notifications are 8 bytes: `[angle: f32 LE][stretch: f32 LE]`. Each value
//! is rounded to four decimal places on decode. Commands written to the same
//! characteristic are two bytes long.

use bytes::Buf;

use crate::error::{ParseError, ParseResult};

/// Length of an angle notification payload.
pub const ANGLE_PAYLOAD_LEN: usize = 8;

/// Marker byte that distinguishes the stretch toggle from a rate command.
pub const STRETCH_COMMAND_MARKER: u8 = 0x80;

/// Decoded angle notification.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnglePayload {
    pub angle: Option<f32>,
    pub stretch: Option<f32>,
}

/// Strictly decode an angle notification.
///
/// Extra trailing bytes are ignored. Non-finite floats decode to `None`.
///
/// # Errors
///
/// Returns [`ParseError::InsufficientBytes`] if `data` holds fewer than
/// [`ANGLE_PAYLOAD_LEN`] bytes.
pub fn try_decode_angle_payload(data: &[u8]) -> ParseResult<AnglePayload> {
    if data.len() < ANGLE_PAYLOAD_LEN {
        return Err(ParseError::InsufficientBytes {
            expected: ANGLE_PAYLOAD_LEN,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let angle = buf.get_f32_le();
    let stretch = buf.get_f32_le();

    Ok(AnglePayload {
        angle: round4(angle),
        stretch: round4(stretch),
    })
}

/// Decode an angle notification, never failing.
///
/// A single malformed notification from a noisy radio should not abort a
/// stream, so decode errors produce an empty payload.
///
/// ```
/// use bend_types::codec::decode_angle_payload;
///
/// let payload = decode_angle_payload(&[0x00, 0x00, 0x80, 0x3F, 0x00, 0x00, 0x00, 0x40]);
/// assert_eq!(payload.angle, Some(1.0));
/// assert_eq!(payload.stretch, Some(2.0));
/// assert_eq!(decode_angle_payload(&[0x01, 0x02]).angle, None);
/// ```
#[must_use]
pub fn decode_angle_payload(data: &[u8]) -> AnglePayload {
    try_decode_angle_payload(data).unwrap_or_default()
}

/// Round to four decimal places.
fn round4(value: f32) -> Option<f32> {
    if !value.is_finite() {
        return None;
    }
    let scaled = (f64::from(value) * 10_000.0).round() / 10_000.0;
    Some(scaled as f32)
}

/// Command enabling or disabling the stretch channel.
#[must_use]
pub const fn stretch_command(enable: bool) -> [u8; 2] {
    [enable as u8, STRETCH_COMMAND_MARKER]
}

/// Decode the one-byte Battery Level characteristic.
///
/// # Errors
///
/// Returns [`ParseError::InsufficientBytes`] on an empty buffer and
/// [`ParseError::InvalidValue`] for values above 100.
pub fn decode_battery_level(data: &[u8]) -> ParseResult<u8> {
    let level = *data.first().ok_or(ParseError::InsufficientBytes {
        expected: 1,
        actual: 0,
    })?;
    if level > 100 {
        return Err(ParseError::InvalidValue(format!(
            "battery level {level} is above 100%"
        )));
    }
    Ok(level)
}

/// Decode a GATT string characteristic, dropping trailing NULs.
#[must_use]
pub fn decode_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
