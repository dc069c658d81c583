//! Bluetooth UUIDs for ADS bend/stretch sensors.
//!
//! The sensor exposes everything through 16-bit SIG-assigned identifiers
//! expanded onto the Bluetooth base UUID.

use uuid::{Uuid, uuid};

/// Advertised name prefix of every ADS sensor.
pub const DEVICE_NAME_PREFIX: &str = "ads_";

// --- Sensor services ---

/// Angle service. Carries both the configuration commands and the
/// angle/stretch notification stream.
pub const ANGLE_SERVICE: Uuid = uuid!("00001820-0000-1000-8000-00805f9b34fb");

/// Bend service advertised by two-axis firmware.
pub const BEND_SERVICE: Uuid = uuid!("00001823-0000-1000-8000-00805f9b34fb");

/// Angle service used by the flex-module firmware.
pub const FM_ANGLE_SERVICE: Uuid = uuid!("00001900-0000-1000-8000-00805f9b34fb");

/// Generic attribute service used by the flex-module firmware.
pub const FM_SERVICE: Uuid = uuid!("00001801-0000-1000-8000-00805f9b34fb");

// --- Sensor characteristics ---

/// Angle characteristic: receives configuration writes and notifies
/// `[angle: f32 LE, stretch: f32 LE]` payloads.
pub const ANGLE: Uuid = uuid!("00002a70-0000-1000-8000-00805f9b34fb");

// --- Standard BLE services ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- GAP characteristics ---

/// Device name.
pub const GAP_DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");

/// Appearance.
pub const GAP_APPEARANCE: Uuid = uuid!("00002a01-0000-1000-8000-00805f9b34fb");

/// Peripheral privacy flag.
pub const GAP_PRIVACY: Uuid = uuid!("00002a02-0000-1000-8000-00805f9b34fb");

/// Peripheral preferred connection parameters.
pub const GAP_PREFERRED_CONNECTION_PARAMS: Uuid =
    uuid!("00002a04-0000-1000-8000-00805f9b34fb");

// --- Device Information characteristics ---

/// Model number string, reported by the sensor as its sensor type.
pub const SENSOR_TYPE: Uuid = uuid!("00002a24-0000-1000-8000-00805f9b34fb");

/// Firmware revision string.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");

/// Hardware revision string.
pub const HARDWARE_REVISION: Uuid = uuid!("00002a27-0000-1000-8000-00805f9b34fb");

/// Software revision string.
pub const SOFTWARE_REVISION: Uuid = uuid!("00002a28-0000-1000-8000-00805f9b34fb");

/// Manufacturer name string.
pub const MANUFACTURER_NAME: Uuid = uuid!("00002a29-0000-1000-8000-00805f9b34fb");

// --- Battery characteristics ---

/// Battery level, one byte percent.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_uuids_share_bluetooth_base() {
        let all = [
            ANGLE_SERVICE,
            BEND_SERVICE,
            FM_ANGLE_SERVICE,
            FM_SERVICE,
            ANGLE,
            GAP_SERVICE,
            DEVICE_INFO_SERVICE,
            BATTERY_SERVICE,
            GAP_DEVICE_NAME,
            GAP_APPEARANCE,
            GAP_PRIVACY,
            GAP_PREFERRED_CONNECTION_PARAMS,
            SENSOR_TYPE,
            FIRMWARE_REVISION,
            HARDWARE_REVISION,
            SOFTWARE_REVISION,
            MANUFACTURER_NAME,
            BATTERY_LEVEL,
        ];

        for id in all {
            assert!(
                id.to_string().ends_with("-0000-1000-8000-00805f9b34fb"),
                "{id} is not on the base UUID"
            );
        }
    }

    #[test]
    fn test_angle_identifiers() {
        assert_eq!(
            ANGLE_SERVICE.to_string(),
            "00001820-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(ANGLE.to_string(), "00002a70-0000-1000-8000-00805f9b34fb");
        assert_ne!(ANGLE_SERVICE, ANGLE);
    }
}
