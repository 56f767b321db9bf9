//! Bounded on-disk measurement queue. When delivery fails, readings land
//! here; when the cap is reached the oldest entry is dropped so the newest
//! data survives a long outage.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{QueueError, StorageError};
use crate::report::Reporter;
use crate::storage::Storage;
use crate::types::Measurement;

const QUEUE_DIR: &str = "buffer";
pub const DEFAULT_CAPACITY: usize = 100;

// small delay between sends
const SEND_SPACING: Duration = Duration::from_millis(100);

pub struct QueueEntry {
    pub slot: String,
    pub payload: String,
}

pub struct MeasurementQueue {
    storage: Arc<Storage>,
    capacity: usize,
    count: usize,
}

impl MeasurementQueue {
    pub fn open(storage: Arc<Storage>) -> Self {
        Self::with_capacity(storage, DEFAULT_CAPACITY)
    }

    /// Opens the queue, seeding the entry count from whatever survived the
    /// previous run.
    pub fn with_capacity(storage: Arc<Storage>, capacity: usize) -> Self {
        let count = storage.list(QUEUE_DIR).map(|names| names.len()).unwrap_or(0);
        MeasurementQueue {
            storage,
            capacity,
            count,
        }
    }

    /// Stores a copy of the measurement with the `buffered` flag set. Never
    /// touches the network; on a full queue the oldest entry is evicted
    /// first so the count stays at the cap. If eviction cannot free a slot
    /// the new entry is rejected rather than written past capacity.
    pub fn enqueue(&mut self, measurement: &Measurement) -> Result<(), QueueError> {
        if !self.storage.is_mounted() {
            return Err(QueueError::StorageUnavailable);
        }

        let slot = slot_name(measurement.timestamp);
        let replacing = self.storage.exists(&slot);
        if !replacing && self.count >= self.capacity {
            self.drop_oldest()?;
        }

        let mut stored = measurement.clone();
        stored.buffered = true;
        let payload =
            serde_json::to_string(&stored).map_err(|e| QueueError::WriteFailed(e.to_string()))?;

        match self.storage.write(&slot, payload.as_bytes()) {
            Ok(()) => {
                if !replacing {
                    self.count += 1;
                }
                info!(slot = %slot, queued = self.count, "measurement buffered");
                Ok(())
            }
            Err(StorageError::Unavailable) => Err(QueueError::StorageUnavailable),
            Err(e) => Err(QueueError::WriteFailed(e.to_string())),
        }
    }

    fn drop_oldest(&mut self) -> Result<(), QueueError> {
        let names = match self.storage.list(QUEUE_DIR) {
            Ok(names) => names,
            Err(StorageError::Unavailable) => return Err(QueueError::StorageUnavailable),
            Err(e) => return Err(QueueError::WriteFailed(e.to_string())),
        };

        let Some(oldest) = names.first() else {
            // Entries vanished behind us; trust the directory.
            warn!(tracked = self.count, "queue counter out of sync, resetting");
            self.count = 0;
            return Ok(());
        };

        let slot = format!("{QUEUE_DIR}/{oldest}");
        warn!(slot = %slot, "queue full, dropping oldest");
        match self.storage.delete(&slot) {
            Ok(()) => {
                self.count -= 1;
                Ok(())
            }
            Err(StorageError::Unavailable) => Err(QueueError::StorageUnavailable),
            Err(e) => Err(QueueError::WriteFailed(e.to_string())),
        }
    }

    pub fn peek_oldest(&self) -> Result<Option<QueueEntry>, QueueError> {
        let names = match self.storage.list(QUEUE_DIR) {
            Ok(names) => names,
            Err(StorageError::Unavailable) => return Err(QueueError::StorageUnavailable),
            Err(e) => return Err(QueueError::ReadFailed(e.to_string())),
        };
        let Some(name) = names.into_iter().next() else {
            return Ok(None);
        };

        let slot = format!("{QUEUE_DIR}/{name}");
        match self.storage.read(&slot) {
            Ok(payload) => Ok(Some(QueueEntry { slot, payload })),
            Err(StorageError::Unavailable) => Err(QueueError::StorageUnavailable),
            Err(e) => Err(QueueError::ReadFailed(e.to_string())),
        }
    }

    pub fn remove(&mut self, slot: &str) -> Result<(), QueueError> {
        match self.storage.delete(slot) {
            Ok(()) => {
                self.count = self.count.saturating_sub(1);
                Ok(())
            }
            Err(StorageError::Unavailable) => Err(QueueError::StorageUnavailable),
            Err(e) => Err(QueueError::WriteFailed(e.to_string())),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear_all(&mut self) {
        if let Ok(names) = self.storage.list(QUEUE_DIR) {
            for name in names {
                let _ = self.storage.delete(&format!("{QUEUE_DIR}/{name}"));
            }
        }
        self.count = 0;
        info!("queue cleared");
    }

    /// Drains the queue oldest-first through the reporter, stopping at the
    /// first entry that does not go through. Returns how many entries were
    /// delivered and removed.
    pub async fn flush(&mut self, reporter: &Reporter) -> usize {
        let mut sent = 0;
        loop {
            let entry = match self.peek_oldest() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "cannot read queue head, stopping flush");
                    break;
                }
            };

            match reporter.send_queued(&entry.payload).await {
                Ok(true) => {
                    if self.remove(&entry.slot).is_err() {
                        warn!(slot = %entry.slot, "delivered entry stuck in queue, stopping flush");
                        break;
                    }
                    sent += 1;
                    tokio::time::sleep(SEND_SPACING).await;
                }
                Ok(false) => {
                    info!(slot = %entry.slot, "backend refused buffered measurement, stopping flush");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "flush transport failure, will retry next cycle");
                    break;
                }
            }
        }

        if sent > 0 {
            info!(sent, remaining = self.count, "flushed buffered measurements");
        }
        sent
    }
}

fn slot_name(timestamp: u64) -> String {
    // Zero-padded so name order is capture order.
    format!("{QUEUE_DIR}/{timestamp:013}.json")
}
