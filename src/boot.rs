//! Crash-loop detection. A persisted restart record counts boots that land
//! inside a short window; three in a row means the node should come up in
//! recovery instead of running the image again.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::Storage;

const RECORD_SLOT: &str = "restart_detect.json";
const RAPID_WINDOW_MS: u64 = 5000;
const RECOVERY_THRESHOLD: u32 = 3;

#[derive(Serialize, Deserialize, Debug, Default)]
struct RestartRecord {
    restart_count: u32,
    last_restart_time: u64,
}

fn load_record(storage: &Storage) -> Option<RestartRecord> {
    if !storage.exists(RECORD_SLOT) {
        return None;
    }
    match storage.read(RECORD_SLOT) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "restart record unreadable, treating as first boot");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "could not read restart record");
            None
        }
    }
}

fn save_record(storage: &Storage, record: &RestartRecord) {
    match serde_json::to_vec(record) {
        Ok(data) => {
            if let Err(e) = storage.write(RECORD_SLOT, &data) {
                warn!(error = %e, "could not persist restart record");
            }
        }
        Err(e) => warn!(error = %e, "could not encode restart record"),
    }
}

/// Called once at startup with the current uptime clock reading. Returns
/// true when this boot is the third rapid one in a row, in which case the
/// counter is cleared so recovery itself gets a fresh start.
pub fn should_enter_recovery(storage: &Storage, now_ms: u64) -> bool {
    if !storage.is_mounted() {
        return false;
    }

    let count = match load_record(storage) {
        None => 1,
        Some(record) => match now_ms.checked_sub(record.last_restart_time) {
            Some(elapsed) if elapsed > RAPID_WINDOW_MS => 1,
            // Counter wrapped or clock reset means the previous boot was recent.
            _ => record.restart_count.saturating_add(1),
        },
    };

    let trigger = count >= RECOVERY_THRESHOLD;
    save_record(
        storage,
        &RestartRecord {
            restart_count: if trigger { 0 } else { count },
            last_restart_time: now_ms,
        },
    );

    if trigger {
        warn!(restarts = count, "rapid restart loop detected, entering recovery");
    }
    trigger
}

/// Marks the current boot as healthy, so the next restart starts a fresh
/// count.
pub fn reset_counter(storage: &Storage, now_ms: u64) {
    if !storage.is_mounted() {
        return;
    }
    save_record(
        storage,
        &RestartRecord {
            restart_count: 0,
            last_restart_time: now_ms,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn mounted_storage(dir: &TempDir) -> Storage {
        Storage::mount(dir.path().join("data"), 1_048_576)
    }

    fn stored_record(storage: &Storage) -> RestartRecord {
        serde_json::from_str(&storage.read(RECORD_SLOT).unwrap()).unwrap()
    }

    #[test]
    fn test_third_rapid_boot_triggers_recovery() {
        let dir = TempDir::new().unwrap();
        let storage = mounted_storage(&dir);

        assert!(!should_enter_recovery(&storage, 100));
        assert!(!should_enter_recovery(&storage, 150));
        // A reading behind the stored one still counts as a rapid boot.
        assert!(should_enter_recovery(&storage, 120));

        let record = stored_record(&storage);
        assert_eq!(record.restart_count, 0);
        assert_eq!(record.last_restart_time, 120);
    }

    #[test]
    fn test_slow_boots_never_accumulate() {
        let dir = TempDir::new().unwrap();
        let storage = mounted_storage(&dir);

        assert!(!should_enter_recovery(&storage, 100));
        assert!(!should_enter_recovery(&storage, 10_000));
        assert!(!should_enter_recovery(&storage, 20_000));

        assert_eq!(stored_record(&storage).restart_count, 1);
    }

    #[test]
    fn test_boot_after_recovery_starts_a_fresh_count() {
        let dir = TempDir::new().unwrap();
        let storage = mounted_storage(&dir);

        assert!(!should_enter_recovery(&storage, 100));
        assert!(!should_enter_recovery(&storage, 200));
        assert!(should_enter_recovery(&storage, 300));

        assert!(!should_enter_recovery(&storage, 10_300));
        assert_eq!(stored_record(&storage).restart_count, 1);
    }

    #[test]
    fn test_reset_counter_postpones_recovery() {
        let dir = TempDir::new().unwrap();
        let storage = mounted_storage(&dir);

        assert!(!should_enter_recovery(&storage, 100));
        assert!(!should_enter_recovery(&storage, 150));
        reset_counter(&storage, 160);

        assert!(!should_enter_recovery(&storage, 200));
        assert!(!should_enter_recovery(&storage, 210));
        assert!(should_enter_recovery(&storage, 220));
    }

    #[test]
    fn test_corrupt_record_counts_as_first_boot() {
        let dir = TempDir::new().unwrap();
        let storage = mounted_storage(&dir);
        storage.write(RECORD_SLOT, b"not json").unwrap();

        assert!(!should_enter_recovery(&storage, 100));
        assert_eq!(stored_record(&storage).restart_count, 1);
    }

    #[test]
    fn test_unmounted_storage_never_triggers() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "plain file").unwrap();
        let storage = Storage::mount(blocker.join("data"), 1_048_576);
        assert!(!storage.is_mounted());

        assert!(!should_enter_recovery(&storage, 100));
        assert!(!should_enter_recovery(&storage, 110));
        assert!(!should_enter_recovery(&storage, 120));
    }
}
