use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing_subscriber::EnvFilter;

use tanknode::boot;
use tanknode::clock;
use tanknode::config::DeviceConfig;
use tanknode::firmware::{FirmwareStore, InstallEvent};
use tanknode::ota::{self, UpdateOutcome};
use tanknode::queue::MeasurementQueue;
use tanknode::report::Reporter;
use tanknode::sensor::TankSensor;
use tanknode::storage::Storage;
use tanknode::types::Measurement;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    clock::init();

    let mut config = DeviceConfig::from_env()?;
    config.load_saved();
    log::info!(
        "Tank node {} starting, reporting to {}",
        config.device_id,
        config.backend_url
    );

    let storage = Arc::new(Storage::mount(
        &config.data_dir,
        config.storage_capacity_bytes,
    ));
    match storage.info() {
        Ok(stats) => log::info!(
            "Data partition ready: {} of {} bytes used",
            stats.used_bytes,
            stats.total_bytes
        ),
        Err(_) => log::warn!("Storage unavailable, measurements will not be buffered."),
    }

    if boot::should_enter_recovery(&storage, clock::uptime_ms()) {
        log::warn!("Handing control back to the supervisor for recovery.");
        return Ok(());
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                InstallEvent::Started { version, expected } => {
                    log::info!("Firmware {} download started: {} bytes", version, expected)
                }
                InstallEvent::Progress { written, expected } => {
                    log::debug!("Firmware transfer progress: {} of {} bytes", written, expected)
                }
                InstallEvent::Completed { version } => {
                    log::info!("Firmware {} install complete.", version)
                }
                InstallEvent::Failed { version, reason } => {
                    log::warn!("Firmware {} install failed: {}", version, reason)
                }
            }
        }
    });

    let mut firmware = FirmwareStore::open(
        config.firmware_dir.clone(),
        config.slot_capacity_bytes,
        Some(event_tx),
    )?;
    log::info!(
        "Running firmware {} from slot {}",
        firmware.state().current_version,
        firmware.state().active_slot
    );

    let reporter = Reporter::new(&config)?;
    let mut queue = MeasurementQueue::open(Arc::clone(&storage));
    if queue.count() > 0 {
        log::info!(
            "Carrying {} buffered measurements from a previous run.",
            queue.count()
        );
    }
    let mut sensor = TankSensor::new();

    let mut measure_ms = config.settings.measurement_interval_ms;
    let mut flush_ms = config.settings.report_interval_ms;
    let mut measure_tick = time::interval(Duration::from_millis(measure_ms));
    let mut flush_tick = time::interval(Duration::from_millis(flush_ms));
    let mut update_tick = time::interval(Duration::from_millis(config.ota_check_interval_ms));

    let mut delivered: u64 = 0;
    let mut buffered: u64 = 0;
    let mut dropped: u64 = 0;
    let mut link_confirmed = false;

    loop {
        tokio::select! {
            _ = measure_tick.tick() => {
                let reading = sensor.read(&config.settings);
                let measurement = Measurement {
                    device_id: config.device_id.clone(),
                    firmware_version: firmware.state().current_version.clone(),
                    timestamp: clock::uptime_ms(),
                    level_cm: reading.level_cm,
                    volume_l: reading.volume_l,
                    temperature_c: reading.temperature_c,
                    battery_v: reading.battery_v,
                    rssi: reading.rssi,
                    buffered: false,
                };

                match reporter.send_live(&measurement, &mut config).await {
                    Ok(outcome) => {
                        delivered += 1;
                        log::debug!("Measurement delivered: {:?}", outcome.measurement_id);
                        if !link_confirmed {
                            link_confirmed = true;
                            boot::reset_counter(&storage, clock::uptime_ms());
                            if let Err(e) = reporter.fetch_config(&mut config).await {
                                log::warn!("Startup config fetch failed: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to deliver measurement: {}. Buffering locally.", e);
                        match queue.enqueue(&measurement) {
                            Ok(()) => buffered += 1,
                            Err(qe) => {
                                dropped += 1;
                                log::error!("Measurement lost: {}", qe);
                            }
                        }
                    }
                }

                // A config push may have changed the schedule.
                if config.settings.measurement_interval_ms != measure_ms {
                    measure_ms = config.settings.measurement_interval_ms;
                    log::info!("Measurement interval changed to {} ms", measure_ms);
                    measure_tick = time::interval_at(
                        time::Instant::now() + Duration::from_millis(measure_ms),
                        Duration::from_millis(measure_ms),
                    );
                }
                if config.settings.report_interval_ms != flush_ms {
                    flush_ms = config.settings.report_interval_ms;
                    log::info!("Flush interval changed to {} ms", flush_ms);
                    flush_tick = time::interval_at(
                        time::Instant::now() + Duration::from_millis(flush_ms),
                        Duration::from_millis(flush_ms),
                    );
                }
            }
            _ = flush_tick.tick() => {
                if queue.count() > 0 {
                    log::info!("Flushing {} buffered measurements...", queue.count());
                    let sent = queue.flush(&reporter).await;
                    delivered += sent as u64;
                }
            }
            _ = update_tick.tick() => {
                match ota::run_update_cycle(&config, &mut firmware).await {
                    Ok(UpdateOutcome::Installed { version }) => {
                        log::info!("Update {} installed, exiting so the new image takes over.", version);
                        return Ok(());
                    }
                    Ok(UpdateOutcome::UpToDate) => {}
                    Err(e) => log::warn!("Update cycle failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!(
                    "Shutting down: {} delivered, {} buffered, {} dropped, {} pending",
                    delivered,
                    buffered,
                    dropped,
                    queue.count()
                );
                break;
            }
        }
    }

    Ok(())
}
