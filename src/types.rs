use serde::{Deserialize, Serialize};

/// Reading reported when the temperature sensor is disconnected. Passed
/// through to the backend unmodified; the server decides how to render it.
pub const TEMP_SENSOR_ABSENT: f32 = -127.0;

/// One sampled snapshot of the tank. Owned by whichever component currently
/// holds it and never mutated after capture; the queue serializes its own
/// copy with `buffered` set.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Measurement {
    pub device_id: String,
    pub firmware_version: String,
    /// Device uptime at capture, in milliseconds. The server assigns
    /// wall-clock time on receipt.
    pub timestamp: u64,
    pub level_cm: f32,
    pub volume_l: f32,
    pub temperature_c: f32,
    pub battery_v: f32,
    pub rssi: i32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub buffered: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}
