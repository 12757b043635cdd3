//! Sensor device lifecycle and the public watch API.
//!
//! The service consumes device notifications from the [`DeviceEventBus`],
//! maintains one [`SensorState`](crate::sensor_state::SensorState) per
//! announced sensor, persists device capabilities, and exposes watches over
//! individual sensors and over the device population itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{Broadcaster, Subscription};
use crate::channel::WatchEnd;
use crate::config_store::{self, ConfigRead, ConfigStore};
use crate::driver::{DeviceEvent, DeviceEventBus, DeviceEventKind, SensorDriver};
use crate::grouped_query::GroupedQueryState;
use crate::scheduler::PollingScheduler;
use crate::sensor::{SensorDataPoint, SensorInfo, SensorKind};
use crate::sensor_state::{SensorSource, SensorState, SensorWatch};

const SENSOR_INFO_SCOPE: &str = "sensors";
const DEVICE_FEED_CAPACITY: usize = 16;

/// Public description of one sensor device.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDeviceInfo {
    pub device_id: Uuid,
    pub sensors: Vec<SensorInfo>,
    pub online: bool,
}

struct SensorDeviceState {
    info: SensorDeviceInfo,
    sensors: HashMap<Uuid, Arc<SensorState>>,
    grouped: Option<Arc<GroupedQueryState>>,
}

impl SensorDeviceState {
    async fn shutdown(&self, end: WatchEnd) {
        for state in self.sensors.values() {
            state.shutdown(end).await;
        }
        if let Some(grouped) = &self.grouped {
            grouped.shutdown().await;
        }
    }
}

/// Telemetry half of the daemon core.
pub struct SensorService {
    scheduler: Arc<PollingScheduler>,
    store: Arc<dyn ConfigStore>,
    devices: DashMap<Uuid, Arc<SensorDeviceState>>,
    device_broadcaster: Arc<Broadcaster<SensorDeviceInfo>>,
    /// Bumped on every arrival so `wait_for_sensor` can re-check.
    availability: watch::Sender<u64>,
    /// Serializes arrival/removal handling.
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SensorService {
    pub fn new(
        scheduler: Arc<PollingScheduler>,
        store: Arc<dyn ConfigStore>,
        bus: &DeviceEventBus,
    ) -> Arc<Self> {
        let (availability, _) = watch::channel(0u64);
        let service = Arc::new(Self {
            scheduler,
            store,
            devices: DashMap::new(),
            device_broadcaster: Arc::new(Broadcaster::new()),
            availability,
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            event_task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::process_events(service.clone(), bus.subscribe()));
        *service.event_task.lock().unwrap() = Some(task);
        service
    }

    async fn process_events(self: Arc<Self>, mut events: broadcast::Receiver<DeviceEvent>) {
        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("sensor service missed {missed} device events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn handle_event(&self, event: DeviceEvent) {
        match event.kind {
            DeviceEventKind::Enumeration | DeviceEventKind::Addition => {
                if let Some(driver) = event.features.sensors {
                    self.handle_arrival(event.device_id, driver).await;
                }
            }
            DeviceEventKind::Removal => self.handle_removal(event.device_id).await,
            // Capability updates on a live device are outside this core.
            DeviceEventKind::Update => {}
        }
    }

    async fn handle_arrival(&self, device_id: Uuid, driver: Arc<dyn SensorDriver>) {
        let _guard = self.lifecycle.lock().await;

        let sensors = driver.sensors();
        let mut seen = HashSet::new();
        if !sensors.iter().all(|s| seen.insert(s.sensor_id)) {
            // A device announcing the same sensor twice cannot be addressed
            // reliably; refuse it wholesale.
            error!("device {device_id} announces duplicate sensor ids, ignoring device");
            return;
        }

        // A re-arrival without an observed removal replaces the old state.
        if let Some((_, previous)) = self.devices.remove(&device_id) {
            previous.shutdown(WatchEnd::DeviceDisconnected).await;
        }

        let grouped_feature = driver.grouped_query();
        let grouped = grouped_feature
            .clone()
            .map(|feature| Arc::new(GroupedQueryState::new(feature, self.scheduler.clone())));

        let mut states = HashMap::with_capacity(sensors.len());
        for info in &sensors {
            let sensor_id = info.sensor_id;
            let state = SensorState::new(device_id, info.clone(), |parts| match info.kind {
                SensorKind::Internal => SensorSource::Internal,
                SensorKind::Polled => SensorSource::Polled {
                    driver: driver.clone(),
                    scheduler: self.scheduler.clone(),
                },
                SensorKind::GroupedPolled => match (&grouped, &grouped_feature) {
                    (Some(state), Some(feature)) => SensorSource::Grouped {
                        state: state.clone(),
                        slot: parts.grouped_slot(feature.clone()),
                    },
                    // Announced as grouped but the device has no batched
                    // query feature; poll it individually instead.
                    _ => {
                        warn!("device {device_id} has no grouped query, polling sensor {sensor_id}");
                        SensorSource::Polled {
                            driver: driver.clone(),
                            scheduler: self.scheduler.clone(),
                        }
                    }
                },
                SensorKind::Streamed => SensorSource::Streamed {
                    driver: driver.clone(),
                },
            });
            states.insert(sensor_id, state);
        }

        self.persist_sensor_info(device_id, &sensors).await;

        let device_info = SensorDeviceInfo {
            device_id,
            sensors,
            online: true,
        };
        self.devices.insert(
            device_id,
            Arc::new(SensorDeviceState {
                info: device_info.clone(),
                sensors: states,
                grouped,
            }),
        );
        info!(
            "sensor device {device_id} online with {} sensors",
            device_info.sensors.len()
        );
        self.availability
            .send_modify(|generation| *generation = generation.wrapping_add(1));
        self.device_broadcaster.push(device_info);
    }

    async fn handle_removal(&self, device_id: Uuid) {
        let _guard = self.lifecycle.lock().await;
        let Some((_, device)) = self.devices.remove(&device_id) else {
            return;
        };
        device.shutdown(WatchEnd::DeviceDisconnected).await;
        info!("sensor device {device_id} offline");
        let mut info = device.info.clone();
        info.online = false;
        self.device_broadcaster.push(info);
    }

    /// Persists the announced sensor set, skipping the write when nothing
    /// changed since the previous session. Best effort.
    async fn persist_sensor_info(&self, device_id: Uuid, sensors: &[SensorInfo]) {
        let store = self.store.as_ref();
        match config_store::read_value::<Vec<SensorInfo>>(store, SENSOR_INFO_SCOPE, device_id).await
        {
            Ok(ConfigRead::Found(previous)) if previous == sensors => return,
            Ok(_) => {}
            Err(err) => warn!("reading persisted sensors of {device_id} failed: {err:#}"),
        }
        if let Err(err) =
            config_store::write_value(store, SENSOR_INFO_SCOPE, device_id, &sensors.to_vec()).await
        {
            warn!("persisting sensors of {device_id} failed: {err:#}");
        }
    }

    /// Sensor sets persisted for devices the platform no longer knows.
    /// Called by the embedder after initial enumeration settles.
    pub async fn prune_persisted_except(&self, keep: &[Uuid]) -> Result<()> {
        for key in self.store.keys(SENSOR_INFO_SCOPE).await? {
            if !keep.contains(&key) {
                self.store.delete(SENSOR_INFO_SCOPE, key).await?;
            }
        }
        Ok(())
    }

    /// Opens a watch on one sensor.
    pub fn watch_values(&self, device_id: Uuid, sensor_id: Uuid) -> Result<SensorWatch> {
        let device = self
            .devices
            .get(&device_id)
            .ok_or_else(|| anyhow!("unknown device {device_id}"))?;
        let state = device
            .sensors
            .get(&sensor_id)
            .ok_or_else(|| anyhow!("unknown sensor {sensor_id} on device {device_id}"))?;
        state.watch()
    }

    pub fn sensor_info(&self, device_id: Uuid, sensor_id: Uuid) -> Option<SensorInfo> {
        let device = self.devices.get(&device_id)?;
        device.sensors.get(&sensor_id).map(|s| s.info().clone())
    }

    /// Most recent value produced while the sensor was watched, if any.
    pub fn last_known_value(&self, device_id: Uuid, sensor_id: Uuid) -> Option<SensorDataPoint> {
        let device = self.devices.get(&device_id)?;
        device.sensors.get(&sensor_id)?.last_known_value()
    }

    fn sensor_available(&self, device_id: Uuid, sensor_id: Uuid) -> bool {
        self.devices
            .get(&device_id)
            .and_then(|device| device.sensors.get(&sensor_id).map(|s| s.is_watchable()))
            .unwrap_or(false)
    }

    /// Waits until `sensor_id` on `device_id` is present and watchable.
    ///
    /// Returns `false` when `cancel` fires or the service shuts down first.
    /// Used by cooling curves bound to sensors on not-yet-attached devices.
    pub async fn wait_for_sensor(
        &self,
        device_id: Uuid,
        sensor_id: Uuid,
        cancel: &CancellationToken,
    ) -> bool {
        let mut availability = self.availability.subscribe();
        loop {
            if self.sensor_available(device_id, sensor_id) {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                changed = availability.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Snapshot of the current device population plus a live feed of later
    /// arrivals and removals. The feed is registered before the snapshot is
    /// taken, so no transition is lost in between.
    pub fn watch_devices(&self) -> (Vec<SensorDeviceInfo>, Subscription<SensorDeviceInfo>) {
        let subscription =
            Subscription::register(self.device_broadcaster.clone(), DEVICE_FEED_CAPACITY);
        let snapshot = self
            .devices
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        (snapshot, subscription)
    }

    /// Stops event processing and ends every live watch. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.event_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let devices: Vec<_> = self
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.devices.clear();
        for device in devices {
            device.shutdown(WatchEnd::Closed).await;
        }
        self.device_broadcaster.close_all(WatchEnd::Closed);
        info!("sensor service shut down");
    }
}
