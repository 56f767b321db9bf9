//! Device configuration: boot-time identity from the environment, plus
//! runtime tank settings the backend can adjust remotely.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_MEASUREMENT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_OTA_CHECK_INTERVAL_MS: u64 = 3_600_000;
const DEFAULT_STORAGE_CAPACITY_BYTES: u64 = 1_048_576;
const DEFAULT_SLOT_CAPACITY_BYTES: u64 = 1_048_576;

/// Shortest interval the backend is allowed to push. Anything below this is
/// treated as a bad value, not a faster schedule.
const MIN_INTERVAL_MS: u64 = 1_000;

const SETTINGS_FILE: &str = "config.json";

/// Settings the backend may override through a measurement response or the
/// config endpoint. Aliases accept the older unsuffixed key spellings still
/// present in saved files from earlier firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TankSettings {
    #[serde(alias = "measurement_interval")]
    pub measurement_interval_ms: u64,
    #[serde(alias = "report_interval")]
    pub report_interval_ms: u64,
    #[serde(alias = "tank_full_threshold")]
    pub tank_full_threshold_l: f32,
    #[serde(alias = "tank_low_threshold")]
    pub tank_low_threshold_l: f32,
    #[serde(alias = "battery_low_threshold")]
    pub battery_low_threshold_v: f32,
    pub level_empty_cm: f32,
    pub level_full_cm: f32,
}

impl Default for TankSettings {
    fn default() -> Self {
        TankSettings {
            measurement_interval_ms: DEFAULT_MEASUREMENT_INTERVAL_MS,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            tank_full_threshold_l: 900.0,
            tank_low_threshold_l: 100.0,
            battery_low_threshold_v: 3.3,
            level_empty_cm: 140.0,
            level_full_cm: 20.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub auth_token: Option<String>,
    pub backend_url: String,
    pub data_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub storage_capacity_bytes: u64,
    pub slot_capacity_bytes: u64,
    pub ota_check_interval_ms: u64,
    pub settings: TankSettings,
}

impl DeviceConfig {
    pub fn from_env() -> Result<Self> {
        let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let auth_token = env::var("DEVICE_TOKEN").ok();
        let backend_url = env::var("BACKEND_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
        let firmware_dir =
            PathBuf::from(env::var("FIRMWARE_DIR").unwrap_or_else(|_| "./firmware".to_string()));

        let storage_capacity_bytes =
            get_env_var_u64("STORAGE_CAPACITY_BYTES", DEFAULT_STORAGE_CAPACITY_BYTES);
        let slot_capacity_bytes = get_env_var_u64("SLOT_CAPACITY_BYTES", DEFAULT_SLOT_CAPACITY_BYTES);
        let ota_check_interval_ms =
            get_env_var_u64("OTA_CHECK_INTERVAL_MS", DEFAULT_OTA_CHECK_INTERVAL_MS);

        let settings = TankSettings {
            measurement_interval_ms: get_env_var_u64(
                "MEASUREMENT_INTERVAL_MS",
                DEFAULT_MEASUREMENT_INTERVAL_MS,
            ),
            report_interval_ms: get_env_var_u64("REPORT_INTERVAL_MS", DEFAULT_REPORT_INTERVAL_MS),
            ..TankSettings::default()
        };

        Ok(DeviceConfig {
            device_id,
            auth_token,
            backend_url,
            data_dir,
            firmware_dir,
            storage_capacity_bytes,
            slot_capacity_bytes,
            ota_check_interval_ms,
            settings,
        })
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Overlays settings persisted by a previous run, if any. Environment
    /// values only seed the defaults; a saved file wins.
    pub fn load_saved(&mut self) {
        let path = self.settings_path();
        if !path.exists() {
            return;
        }
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<TankSettings>(&contents) {
                Ok(saved) => {
                    self.settings = saved;
                    info!("loaded saved settings");
                }
                Err(e) => warn!(error = %e, "saved settings unreadable, using defaults"),
            },
            Err(e) => warn!(error = %e, "could not read saved settings"),
        }
    }

    /// Applies a partial settings object pushed by the backend. Unknown keys
    /// are ignored; recognized values take effect immediately and are
    /// persisted. Returns false only when the value is not an object at all.
    pub fn apply_update(&mut self, update: &Value) -> bool {
        if !update.is_object() {
            warn!("config update is not a json object, ignoring");
            return false;
        }

        let mut applied = 0;

        if let Some(ms) = read_u64(update, "measurement_interval_ms", "measurement_interval") {
            if ms >= MIN_INTERVAL_MS {
                self.settings.measurement_interval_ms = ms;
                applied += 1;
            } else {
                warn!(value = ms, "measurement interval too short, ignoring");
            }
        }
        if let Some(ms) = read_u64(update, "report_interval_ms", "report_interval") {
            if ms >= MIN_INTERVAL_MS {
                self.settings.report_interval_ms = ms;
                applied += 1;
            } else {
                warn!(value = ms, "report interval too short, ignoring");
            }
        }
        if let Some(v) = read_f32(update, "tank_full_threshold_l", "tank_full_threshold") {
            self.settings.tank_full_threshold_l = v;
            applied += 1;
        }
        if let Some(v) = read_f32(update, "tank_low_threshold_l", "tank_low_threshold") {
            self.settings.tank_low_threshold_l = v;
            applied += 1;
        }
        if let Some(v) = read_f32(update, "battery_low_threshold_v", "battery_low_threshold") {
            self.settings.battery_low_threshold_v = v;
            applied += 1;
        }
        if let Some(v) = update.get("level_empty_cm").and_then(Value::as_f64) {
            self.settings.level_empty_cm = v as f32;
            applied += 1;
        }
        if let Some(v) = update.get("level_full_cm").and_then(Value::as_f64) {
            self.settings.level_full_cm = v as f32;
            applied += 1;
        }

        if applied > 0 {
            info!(applied, "settings updated from backend");
            if let Err(e) = self.save_settings() {
                warn!(error = %e, "could not persist settings");
            }
        }
        true
    }

    fn save_settings(&self) -> Result<()> {
        let path = self.settings_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.settings)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_u64(update: &Value, key: &str, alias: &str) -> Option<u64> {
    update
        .get(key)
        .or_else(|| update.get(alias))
        .and_then(Value::as_u64)
}

fn read_f32(update: &Value, key: &str, alias: &str) -> Option<f32> {
    update
        .get(key)
        .or_else(|| update.get(alias))
        .and_then(Value::as_f64)
        .map(|v| v as f32)
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
