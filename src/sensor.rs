use rand::Rng;

use crate::config::TankSettings;
use crate::types::TEMP_SENSOR_ABSENT;

const TANK_DIAMETER_CM: f32 = 90.0;

#[derive(Debug, Clone)]
pub struct TankReading {
    pub level_cm: f32,
    pub volume_l: f32,
    pub temperature_c: f32,
    pub battery_v: f32,
    pub rssi: i32,
}

/// Simulated ultrasonic level sensor plus its companions. Holds state
/// between reads so consecutive values drift instead of jumping.
pub struct TankSensor {
    level_cm: f32,
    battery_v: f32,
}

impl TankSensor {
    pub fn new() -> Self {
        TankSensor {
            level_cm: 80.0,
            battery_v: 4.1,
        }
    }

    pub fn read(&mut self, settings: &TankSettings) -> TankReading {
        let mut rng = rand::thread_rng();

        // Distance to the water surface drifts a little each reading.
        let lo = settings.level_full_cm.min(settings.level_empty_cm);
        let hi = settings.level_full_cm.max(settings.level_empty_cm);
        self.level_cm = (self.level_cm + rng.gen_range(-1.5..=1.5)).clamp(lo, hi);

        // Occasional dropout from the temperature sensor.
        let temperature_c = if rng.gen_bool(0.02) {
            TEMP_SENSOR_ABSENT
        } else {
            22.0 + rng.gen_range(-3.0..=3.0)
        };

        // Battery sags slowly toward cutoff.
        self.battery_v = (self.battery_v - rng.gen_range(0.0..=0.002)).max(3.0);

        TankReading {
            level_cm: self.level_cm,
            volume_l: volume_from_level(self.level_cm, settings),
            temperature_c,
            battery_v: self.battery_v,
            rssi: rng.gen_range(-85..=-55),
        }
    }
}

impl Default for TankSensor {
    fn default() -> Self {
        Self::new()
    }
}

/// The water column is the gap between the empty-tank distance and the
/// measured distance to the surface.
fn volume_from_level(level_cm: f32, settings: &TankSettings) -> f32 {
    let water_cm = (settings.level_empty_cm - level_cm).max(0.0);
    let radius_cm = TANK_DIAMETER_CM / 2.0;
    std::f32::consts::PI * radius_cm * radius_cm * water_cm / 1000.0
}
