//! Resilience layer for an off-grid water tank monitor: measurements are
//! delivered live when the backend is reachable and buffered on local
//! storage when it is not, configuration can be pushed from the backend,
//! firmware updates install into an inactive slot, and rapid restart loops
//! are detected at boot.

pub mod boot;
pub mod clock;
pub mod config;
pub mod error;
pub mod firmware;
pub mod ota;
pub mod queue;
pub mod report;
pub mod sensor;
pub mod storage;
pub mod types;
