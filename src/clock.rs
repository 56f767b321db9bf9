//! Boot-relative monotonic clock, the hardware tick counter analog

use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref BOOT_TIME: Instant = Instant::now();
}

/// Milliseconds since this boot. Restarts from zero every time the process
/// does, so values are only comparable within one run.
pub fn uptime_ms() -> u64 {
    BOOT_TIME.elapsed().as_millis() as u64
}

/// Pins the anchor at startup so readings count from process start rather
/// than first use.
pub fn init() {
    lazy_static::initialize(&BOOT_TIME);
}
