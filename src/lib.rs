//! # periphd
//!
//! Daemon core for telemetry and cooling control of dynamically attached
//! peripherals.
//!
//! ## Features
//!
//! - **Async Architecture**: Built on Tokio; every device gets small,
//!   cancellable tasks instead of threads
//! - **Lazy Telemetry**: Sensors are only read while someone watches them;
//!   a shared refcounted scheduler drives all polling
//! - **Batched Queries**: Devices that read many sensors per transaction are
//!   queried once per tick, with coalesced membership changes
//! - **Cooling Modes**: Automatic, fixed power, host-evaluated curves over
//!   any sensor, and firmware-evaluated curves, hot-swappable per cooler
//! - **Serialized Writes**: One writer task per device batches queued
//!   changes and flushes them in a single transaction
//! - **Persistence**: Device capabilities and configured modes survive
//!   restarts through a pluggable config store
//!
//! ## Architecture
//!
//! Hardware lives behind the driver traits in [`driver`]; devices are
//! announced on a [`DeviceEventBus`](driver::DeviceEventBus) and consumed by
//! two services:
//! - [`SensorService`](sensor_service::SensorService) - sensor lifecycle and
//!   the watch API
//! - [`CoolingService`](cooling_service::CoolingService) - cooler lifecycle
//!   and the mode-setting API
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use periphd::config_store::JsonFileConfigStore;
//! use periphd::cooling_service::CoolingService;
//! use periphd::driver::DeviceEventBus;
//! use periphd::scheduler::PollingScheduler;
//! use periphd::sensor_service::SensorService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = DeviceEventBus::new();
//!     let store = Arc::new(JsonFileConfigStore::new("/var/lib/periphd"));
//!     let scheduler = Arc::new(PollingScheduler::new(Duration::from_secs(1)));
//!     let sensors = SensorService::new(scheduler.clone(), store.clone(), &bus);
//!     let cooling = CoolingService::new(sensors.clone(), store, &bus);
//!     // Platform discovery publishes DeviceEvents on `bus`...
//!     cooling.shutdown().await;
//!     sensors.shutdown().await;
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod channel;
pub mod config_store;
pub mod cooler;
pub(crate) mod cooler_state;
pub(crate) mod cooling_change;
pub mod cooling_service;
pub mod curve;
pub mod driver;
pub(crate) mod grouped_query;
pub mod scheduler;
pub mod sensor;
pub mod sensor_service;
pub mod sensor_state;
