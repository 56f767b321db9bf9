//! Update check against the backend, plus the persisted record of which
//! firmware slot is active.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::{FetchError, UpdateError};
use crate::firmware::FirmwareStore;

const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything needed to decide on and run one install attempt. Lives for a
/// single check-install cycle, never persisted.
#[derive(Debug, Clone)]
pub struct UpdateDescriptor {
    pub url: String,
    pub version: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Check response. Aliases accept both the device-side and backend-side
/// field spellings.
#[derive(Debug, Deserialize)]
struct UpdateCheckResponse {
    #[serde(default)]
    update_available: bool,
    #[serde(default, alias = "download_url")]
    url: Option<String>,
    #[serde(default, alias = "latest_version")]
    version: Option<String>,
    #[serde(default, alias = "size")]
    file_size: Option<u64>,
    #[serde(default)]
    checksum: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OtaState {
    pub current_version: String,
    pub active_slot: String,
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
}

impl Default for OtaState {
    fn default() -> Self {
        OtaState {
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            active_slot: "A".to_string(),
            installed_at: None,
        }
    }
}

impl OtaState {
    /// Loads the persisted state, falling back to defaults for a first boot
    /// or an unreadable file.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str(&contents) {
                    Ok(state) => return state,
                    Err(e) => warn!(error = %e, "ota state unreadable, starting fresh"),
                },
                Err(e) => warn!(error = %e, "could not read ota state"),
            }
        }
        OtaState::default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn inactive_slot(&self) -> &'static str {
        if self.active_slot == "B" {
            "A"
        } else {
            "B"
        }
    }
}

/// Asks the backend whether newer firmware exists for this device. The
/// backend makes the decision; the device only validates the shape of the
/// answer. A malformed or incomplete answer is treated as "no update", not
/// as an error, so a broken backend cannot speed up the retry schedule.
pub async fn check_for_update(
    config: &DeviceConfig,
    current_version: &str,
) -> Result<Option<UpdateDescriptor>, FetchError> {
    let url = format!(
        "{}/api/v1/devices/{}/ota/latest",
        config.backend_url, config.device_id
    );

    // One-shot client with pooling off: the check connection must be fully
    // released before any image transfer opens.
    let client = reqwest::Client::builder()
        .timeout(CHECK_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()
        .map_err(FetchError::Transport)?;

    info!("checking for firmware update");
    let mut request = client.get(&url).query(&[
        ("device", config.device_id.as_str()),
        ("version", current_version),
    ]);
    if let Some(token) = &config.auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(FetchError::Transport)?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(FetchError::Status(status));
    }

    let body: UpdateCheckResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "unparseable update check response, ignoring");
            return Ok(None);
        }
    };

    if !body.update_available {
        info!("firmware up to date");
        return Ok(None);
    }

    match (body.url, body.version) {
        (Some(url), Some(version)) => {
            info!(version = %version, "update available");
            Ok(Some(UpdateDescriptor {
                url,
                version,
                size: body.file_size,
                sha256: body.checksum,
            }))
        }
        _ => {
            warn!("update flagged but url or version missing, ignoring");
            Ok(None)
        }
    }
}

#[derive(Debug)]
pub enum UpdateOutcome {
    UpToDate,
    Installed { version: String },
}

/// One full update cycle: check, then install into the inactive slot. The
/// check client is gone before the download begins. After `Installed` the
/// caller is expected to restart the process so the new image takes over.
pub async fn run_update_cycle(
    config: &DeviceConfig,
    store: &mut FirmwareStore,
) -> Result<UpdateOutcome, UpdateError> {
    let current = store.state().current_version.clone();
    let Some(update) = check_for_update(config, &current).await? else {
        return Ok(UpdateOutcome::UpToDate);
    };

    let Some(size) = update.size else {
        warn!(version = %update.version, "update descriptor has no file size, skipping install");
        return Ok(UpdateOutcome::UpToDate);
    };

    store.install(&update, size).await?;
    Ok(UpdateOutcome::Installed {
        version: update.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TankSettings;
    use mockito::Matcher;
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(url: &str, dir: &Path) -> DeviceConfig {
        DeviceConfig {
            device_id: "tank-test".to_string(),
            auth_token: Some("test-token".to_string()),
            backend_url: url.to_string(),
            data_dir: dir.to_path_buf(),
            firmware_dir: dir.join("firmware"),
            storage_capacity_bytes: 1_048_576,
            slot_capacity_bytes: 1_048_576,
            ota_check_interval_ms: 3_600_000,
            settings: TankSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_check_no_update_available() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let mock = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("device".into(), "tank-test".into()),
                Matcher::UrlEncoded("version".into(), "0.4.2".into()),
            ]))
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_body(json!({ "update_available": false }).to_string())
            .create_async()
            .await;

        let result = check_for_update(&config, "0.4.2").await.unwrap();
        assert!(result.is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_accepts_backend_field_names() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let mock = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "update_available": true,
                    "current_version": "0.4.2",
                    "latest_version": "0.5.0",
                    "download_url": "http://example.invalid/fw.bin",
                    "file_size": 512,
                    "checksum": "abc123"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let update = check_for_update(&config, "0.4.2").await.unwrap().unwrap();
        assert_eq!(update.version, "0.5.0");
        assert_eq!(update.url, "http://example.invalid/fw.bin");
        assert_eq!(update.size, Some(512));
        assert_eq!(update.sha256.as_deref(), Some("abc123"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_accepts_device_field_names() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let mock = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "update_available": true,
                    "url": "http://example.invalid/fw.bin",
                    "version": "0.5.0"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let update = check_for_update(&config, "0.4.2").await.unwrap().unwrap();
        assert_eq!(update.version, "0.5.0");
        assert_eq!(update.size, None);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_flagged_but_incomplete_yields_none() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let mock = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({ "update_available": true, "version": "0.5.0" }).to_string(),
            )
            .create_async()
            .await;

        assert!(check_for_update(&config, "0.4.2").await.unwrap().is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_unparseable_body_yields_none() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let mock = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>gateway error</html>")
            .create_async()
            .await;

        assert!(check_for_update(&config, "0.4.2").await.unwrap().is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_error_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let mock = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let result = check_for_update(&config, "0.4.2").await;
        assert!(matches!(
            result,
            Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE))
        ));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_transport_failure() {
        let dir = TempDir::new().unwrap();
        let config = test_config("http://127.0.0.1:1", dir.path());

        let result = check_for_update(&config, "0.4.2").await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }

    #[test]
    fn test_ota_state_defaults_and_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ota_state.json");

        let state = OtaState::load(&path);
        assert_eq!(state.current_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(state.active_slot, "A");
        assert_eq!(state.inactive_slot(), "B");
        assert!(state.installed_at.is_none());

        let flipped = OtaState {
            current_version: "0.5.0".to_string(),
            active_slot: "B".to_string(),
            installed_at: Some(Utc::now()),
        };
        flipped.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reloaded = OtaState::load(&path);
        assert_eq!(reloaded.current_version, "0.5.0");
        assert_eq!(reloaded.active_slot, "B");
        assert_eq!(reloaded.inactive_slot(), "A");
        assert!(reloaded.installed_at.is_some());
    }

    #[test]
    fn test_ota_state_unreadable_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ota_state.json");
        fs::write(&path, "{{{{").unwrap();

        let state = OtaState::load(&path);
        assert_eq!(state.active_slot, "A");
    }

    #[tokio::test]
    async fn test_run_update_cycle_installs_and_flips_slot() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let image = b"new firmware image bytes".to_vec();
        let mut hasher = Sha256::new();
        hasher.update(&image);
        let checksum = format!("{:x}", hasher.finalize());

        let check = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "update_available": true,
                    "latest_version": "0.5.0",
                    "download_url": format!("{}/firmware/0.5.0.bin", server.url()),
                    "file_size": image.len(),
                    "checksum": checksum
                })
                .to_string(),
            )
            .create_async()
            .await;
        let download = server
            .mock("GET", "/firmware/0.5.0.bin")
            .with_status(200)
            .with_body(image.clone())
            .create_async()
            .await;

        let mut store = FirmwareStore::open(config.firmware_dir.clone(), 65_536, None).unwrap();
        let outcome = run_update_cycle(&config, &mut store).await.unwrap();

        match outcome {
            UpdateOutcome::Installed { version } => assert_eq!(version, "0.5.0"),
            other => panic!("expected Installed, got {other:?}"),
        }
        assert_eq!(store.state().current_version, "0.5.0");
        assert_eq!(store.state().active_slot, "B");

        check.assert_async().await;
        download.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_update_cycle_skips_sizeless_descriptor() {
        let mut server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&server.url(), dir.path());

        let check = server
            .mock("GET", "/api/v1/devices/tank-test/ota/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "update_available": true,
                    "url": format!("{}/firmware/0.5.0.bin", server.url()),
                    "version": "0.5.0"
                })
                .to_string(),
            )
            .create_async()
            .await;
        let download = server
            .mock("GET", "/firmware/0.5.0.bin")
            .expect(0)
            .create_async()
            .await;

        let mut store = FirmwareStore::open(config.firmware_dir.clone(), 65_536, None).unwrap();
        let outcome = run_update_cycle(&config, &mut store).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::UpToDate));

        check.assert_async().await;
        download.assert_async().await;
    }
}
