//! Staged firmware install. The image streams into a staging file, gets
//! verified against size and checksum, then lands in the inactive slot so a
//! failed transfer never touches the running image.

use chrono::Utc;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::error::InstallError;
use crate::ota::{OtaState, UpdateDescriptor};

/// One flash sector kept free beyond the image itself.
pub const SLOT_RESERVE_BYTES: u64 = 4096;

const STATE_FILE: &str = "ota_state.json";
const STAGING_FILE: &str = "staging.bin";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_DEADLINE: Duration = Duration::from_secs(300);

/// Progress notifications from an install attempt.
#[derive(Debug, Clone)]
pub enum InstallEvent {
    Started { version: String, expected: u64 },
    Progress { written: u64, expected: u64 },
    Completed { version: String },
    Failed { version: String, reason: String },
}

pub struct FirmwareStore {
    dir: PathBuf,
    slot_capacity: u64,
    state: OtaState,
    state_path: PathBuf,
    events: Option<UnboundedSender<InstallEvent>>,
    installing: bool,
}

impl FirmwareStore {
    pub fn open(
        dir: PathBuf,
        slot_capacity: u64,
        events: Option<UnboundedSender<InstallEvent>>,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let state_path = dir.join(STATE_FILE);
        let state = OtaState::load(&state_path);
        Ok(FirmwareStore {
            dir,
            slot_capacity,
            state,
            state_path,
            events,
            installing: false,
        })
    }

    pub fn state(&self) -> &OtaState {
        &self.state
    }

    fn emit(&self, event: InstallEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Downloads and commits one update. Space is checked before any byte
    /// moves; a failure at any later point removes the staging file and
    /// leaves the active slot and version record as they were.
    pub async fn install(
        &mut self,
        update: &UpdateDescriptor,
        expected: u64,
    ) -> Result<(), InstallError> {
        if self.installing {
            return Err(InstallError::Busy);
        }
        self.installing = true;
        let result = self.install_inner(update, expected).await;
        self.installing = false;

        match &result {
            Ok(()) => self.emit(InstallEvent::Completed {
                version: update.version.clone(),
            }),
            Err(e) => self.emit(InstallEvent::Failed {
                version: update.version.clone(),
                reason: e.to_string(),
            }),
        }
        result
    }

    async fn install_inner(
        &mut self,
        update: &UpdateDescriptor,
        expected: u64,
    ) -> Result<(), InstallError> {
        let available = self.slot_capacity.saturating_sub(SLOT_RESERVE_BYTES);
        if expected > available {
            return Err(InstallError::InsufficientSpace {
                needed: expected,
                available,
            });
        }

        self.emit(InstallEvent::Started {
            version: update.version.clone(),
            expected,
        });
        info!(version = %update.version, bytes = expected, "installing firmware update");

        let staging = self.dir.join(STAGING_FILE);
        let digest = match self.stream_image(&update.url, expected, &staging).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };

        if let Some(expected_sum) = &update.sha256 {
            if !digest.eq_ignore_ascii_case(expected_sum) {
                let _ = fs::remove_file(&staging);
                return Err(InstallError::ChecksumMismatch {
                    expected: expected_sum.clone(),
                    actual: digest,
                });
            }
        }

        if let Err(e) = self.commit(update, &staging) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(())
    }

    /// Streams the image into `staging`, hashing as it goes. Enforces the
    /// declared size in both directions; the whole transfer is bounded by
    /// `INSTALL_DEADLINE` so a stalled connection cannot hold the node.
    async fn stream_image(
        &self,
        url: &str,
        expected: u64,
        staging: &Path,
    ) -> Result<String, InstallError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(INSTALL_DEADLINE)
            .build()
            .map_err(|e| InstallError::Transport(e.to_string()))?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| InstallError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::Transport(format!(
                "image request failed with status {status}"
            )));
        }

        let mut file = File::create(staging).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| InstallError::Transport(e.to_string()))?;
            let len = chunk.len() as u64;
            if written + len > expected {
                return Err(InstallError::IncompleteTransfer {
                    written: written + len,
                    expected,
                });
            }
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += len;
            self.emit(InstallEvent::Progress { written, expected });
        }

        if written != expected {
            return Err(InstallError::IncompleteTransfer { written, expected });
        }
        file.sync_all()
            .await
            .map_err(|e| InstallError::FinalizeFailed(e.to_string()))?;
        drop(file);

        let on_disk = fs::metadata(staging)?.len();
        if on_disk != expected {
            return Err(InstallError::IncompleteTransfer {
                written: on_disk,
                expected,
            });
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Moves the verified image into the inactive slot and persists the new
    /// version record. The in-memory state only changes once the record is
    /// safely on disk.
    fn commit(&mut self, update: &UpdateDescriptor, staging: &Path) -> Result<(), InstallError> {
        let target_slot = self.state.inactive_slot();
        let target = self
            .dir
            .join(format!("slot_{}.bin", target_slot.to_lowercase()));
        fs::rename(staging, &target).map_err(|e| InstallError::FinalizeFailed(e.to_string()))?;

        let mut next = self.state.clone();
        next.current_version = update.version.clone();
        next.active_slot = target_slot.to_string();
        next.installed_at = Some(Utc::now());
        next.save(&self.state_path)
            .map_err(|e| InstallError::FinalizeFailed(e.to_string()))?;
        self.state = next;

        info!(version = %update.version, slot = %self.state.active_slot, "firmware committed");
        Ok(())
    }
}
