//! Cooling device lifecycle, persisted configuration, and the public
//! mode-setting API.
//!
//! The service consumes device notifications from the [`DeviceEventBus`],
//! keeps one [`CoolerState`] per announced cooler, and funnels all hardware
//! writes of a device through its single [`LiveDeviceState`] task. Configured
//! modes are persisted and re-applied when a device returns, whether it comes
//! back within the same session or after a restart.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{Broadcaster, Subscription};
use crate::channel::WatchEnd;
use crate::config_store::{self, ConfigRead, ConfigStore};
use crate::cooler::{CoolerInfo, CoolingMode};
use crate::cooler_state::{CoolerState, SoftwareCurveConfig};
use crate::cooling_change::{ChangePool, LiveDeviceState};
use crate::curve::PowerCurve;
use crate::driver::{CoolingController, DeviceEvent, DeviceEventBus, DeviceEventKind};
use crate::sensor_service::SensorService;

const COOLER_INFO_SCOPE: &str = "cooling-info";
const COOLING_MODE_SCOPE: &str = "cooling-mode";
const DEVICE_FEED_CAPACITY: usize = 16;

/// Public description of one cooling device.
#[derive(Debug, Clone, PartialEq)]
pub struct CoolingDeviceInfo {
    pub device_id: Uuid,
    pub coolers: Vec<CoolerInfo>,
    pub online: bool,
}

struct CoolingDevice {
    info: CoolingDeviceInfo,
    coolers: HashMap<Uuid, Arc<CoolerState>>,
    /// Writer task; `None` while the device is offline.
    live: Option<LiveDeviceState>,
}

/// Actuation half of the daemon core.
pub struct CoolingService {
    sensor_service: Arc<SensorService>,
    store: Arc<dyn ConfigStore>,
    pool: Arc<ChangePool>,
    devices: DashMap<Uuid, CoolingDevice>,
    device_broadcaster: Arc<Broadcaster<CoolingDeviceInfo>>,
    /// Serializes arrival/removal handling.
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoolingService {
    pub fn new(
        sensor_service: Arc<SensorService>,
        store: Arc<dyn ConfigStore>,
        bus: &DeviceEventBus,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            sensor_service,
            store,
            pool: ChangePool::new(),
            devices: DashMap::new(),
            device_broadcaster: Arc::new(Broadcaster::new()),
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
                    warn!("cooling service missed {missed} device events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn handle_event(&self, event: DeviceEvent) {
        match event.kind {
            DeviceEventKind::Enumeration | DeviceEventKind::Addition => {
                if let Some(controller) = event.features.cooling {
                    self.handle_arrival(event.device_id, controller).await;
                }
            }
            DeviceEventKind::Removal => self.handle_removal(event.device_id).await,
            // Capability updates on a live device are outside this core.
            DeviceEventKind::Update => {}
        }
    }

    async fn handle_arrival(&self, device_id: Uuid, controller: Arc<dyn CoolingController>) {
        let _guard = self.lifecycle.lock().await;

        let coolers = controller.coolers();
        let mut seen = HashSet::new();
        if !coolers.iter().all(|c| seen.insert(c.cooler_id)) {
            error!("device {device_id} announces duplicate cooler ids, ignoring device");
            return;
        }

        let previous = self.devices.remove(&device_id).map(|(_, device)| device);
        if let Some(previous) = &previous {
            if let Some(live) = &previous.live {
                // Re-arrival without an observed removal.
                for cooler in previous.coolers.values() {
                    cooler.set_offline().await;
                }
                live.shutdown().await;
            }
        }

        // An unchanged cooler set keeps its in-session states, and with them
        // the modes configured while the device was away.
        let states = match previous {
            Some(previous)
                if previous.coolers.len() == coolers.len()
                    && coolers
                        .iter()
                        .all(|c| previous.coolers.contains_key(&c.cooler_id)) =>
            {
                previous.coolers
            }
            _ => {
                let mut states = HashMap::with_capacity(coolers.len());
                for cooler_info in &coolers {
                    states.insert(
                        cooler_info.cooler_id,
                        Arc::new(CoolerState::new(
                            device_id,
                            cooler_info.clone(),
                            self.sensor_service.clone(),
                            self.pool.clone(),
                        )),
                    );
                }
                self.restore_persisted_modes(device_id, &states).await;
                states
            }
        };

        self.persist_cooler_info(device_id, &coolers).await;

        let live = LiveDeviceState::new(controller, self.pool.clone());
        for cooler in states.values() {
            cooler.set_online(live.sender()).await;
        }

        let device_info = CoolingDeviceInfo {
            device_id,
            coolers,
            online: true,
        };
        self.devices.insert(
            device_id,
            CoolingDevice {
                info: device_info.clone(),
                coolers: states,
                live: Some(live),
            },
        );
        info!(
            "cooling device {device_id} online with {} coolers",
            device_info.coolers.len()
        );
        self.device_broadcaster.push(device_info);
    }

    async fn handle_removal(&self, device_id: Uuid) {
        let _guard = self.lifecycle.lock().await;
        let Some((_, mut device)) = self.devices.remove(&device_id) else {
            return;
        };
        for cooler in device.coolers.values() {
            cooler.set_offline().await;
        }
        if let Some(live) = device.live.take() {
            live.shutdown().await;
        }
        device.info.online = false;
        info!("cooling device {device_id} offline");
        self.device_broadcaster.push(device.info.clone());
        // The entry stays, so configured modes survive a reconnect within
        // the session even if they were never persisted.
        self.devices.insert(device_id, device);
    }

    async fn restore_persisted_modes(
        &self,
        device_id: Uuid,
        states: &HashMap<Uuid, Arc<CoolerState>>,
    ) {
        let store = self.store.as_ref();
        let modes = match config_store::read_value::<HashMap<Uuid, CoolingMode>>(
            store,
            COOLING_MODE_SCOPE,
            device_id,
        )
        .await
        {
            Ok(ConfigRead::Found(modes)) => modes,
            Ok(ConfigRead::NotFound | ConfigRead::Malformed) => return,
            Err(err) => {
                warn!("reading persisted modes of {device_id} failed: {err:#}");
                return;
            }
        };
        for (cooler_id, mode) in modes {
            let Some(cooler) = states.get(&cooler_id) else {
                continue;
            };
            if let Err(err) = cooler.apply_mode(mode).await {
                warn!("restoring mode of cooler {cooler_id} on {device_id} failed: {err:#}");
            }
        }
    }

    async fn persist_cooler_info(&self, device_id: Uuid, coolers: &[CoolerInfo]) {
        let store = self.store.as_ref();
        match config_store::read_value::<Vec<CoolerInfo>>(store, COOLER_INFO_SCOPE, device_id).await
        {
            Ok(ConfigRead::Found(previous)) if previous == coolers => return,
            Ok(_) => {}
            Err(err) => warn!("reading persisted coolers of {device_id} failed: {err:#}"),
        }
        if let Err(err) =
            config_store::write_value(store, COOLER_INFO_SCOPE, device_id, &coolers.to_vec()).await
        {
            warn!("persisting coolers of {device_id} failed: {err:#}");
        }
    }

    /// Writes the modes currently in force on `device_id`. Best effort; a
    /// failed write never fails the mode change that triggered it.
    async fn persist_modes(&self, device_id: Uuid) {
        let coolers: Vec<_> = {
            let Some(device) = self.devices.get(&device_id) else {
                return;
            };
            device
                .coolers
                .iter()
                .map(|(id, state)| (*id, state.clone()))
                .collect()
        };
        let mut modes = HashMap::new();
        for (cooler_id, state) in coolers {
            if let Some(mode) = state.current_mode().await {
                modes.insert(cooler_id, mode);
            }
        }
        if let Err(err) =
            config_store::write_value(self.store.as_ref(), COOLING_MODE_SCOPE, device_id, &modes)
                .await
        {
            warn!("persisting modes of {device_id} failed: {err:#}");
        }
    }

    fn cooler(&self, device_id: Uuid, cooler_id: Uuid) -> Result<Arc<CoolerState>> {
        let device = self
            .devices
            .get(&device_id)
            .ok_or_else(|| anyhow!("unknown cooling device {device_id}"))?;
        device
            .coolers
            .get(&cooler_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown cooler {cooler_id} on device {device_id}"))
    }

    /// Hands the cooler back to the device's own firmware.
    pub async fn set_automatic(&self, device_id: Uuid, cooler_id: Uuid) -> Result<()> {
        self.cooler(device_id, cooler_id)?.set_automatic().await?;
        self.persist_modes(device_id).await;
        Ok(())
    }

    /// Pins the cooler to a fixed power, in percent.
    pub async fn set_manual_power(
        &self,
        device_id: Uuid,
        cooler_id: Uuid,
        power: u8,
    ) -> Result<()> {
        self.cooler(device_id, cooler_id)?
            .set_manual_power(power)
            .await?;
        self.persist_modes(device_id).await;
        Ok(())
    }

    /// Drives the cooler from an arbitrary sensor through a host-evaluated
    /// curve. `fallback_power` applies while the sensor is unavailable.
    pub async fn set_software_curve(
        &self,
        device_id: Uuid,
        cooler_id: Uuid,
        sensor_device_id: Uuid,
        sensor_id: Uuid,
        fallback_power: u8,
        curve: PowerCurve,
    ) -> Result<()> {
        self.cooler(device_id, cooler_id)?
            .set_software_curve(SoftwareCurveConfig {
                sensor_device_id,
                sensor_id,
                fallback_power,
                curve,
            })
            .await?;
        self.persist_modes(device_id).await;
        Ok(())
    }

    /// Hands a curve to the device for firmware-side evaluation.
    pub async fn set_hardware_curve(
        &self,
        device_id: Uuid,
        cooler_id: Uuid,
        sensor_id: Uuid,
        curve: PowerCurve,
    ) -> Result<()> {
        self.cooler(device_id, cooler_id)?
            .set_hardware_curve(sensor_id, curve)
            .await?;
        self.persist_modes(device_id).await;
        Ok(())
    }

    /// Mode currently in force for one cooler, if any was configured.
    pub async fn cooling_mode(&self, device_id: Uuid, cooler_id: Uuid) -> Option<CoolingMode> {
        let cooler = self.cooler(device_id, cooler_id).ok()?;
        cooler.current_mode().await
    }

    /// Snapshot of the current device population plus a live feed of later
    /// transitions. The feed is registered before the snapshot is taken.
    pub fn watch_devices(&self) -> (Vec<CoolingDeviceInfo>, Subscription<CoolingDeviceInfo>) {
        let subscription =
            Subscription::register(self.device_broadcaster.clone(), DEVICE_FEED_CAPACITY);
        let snapshot = self
            .devices
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        (snapshot, subscription)
    }

    /// Stops event processing, curve tasks, and every device writer.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.event_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let device_ids: Vec<_> = self.devices.iter().map(|entry| *entry.key()).collect();
        for device_id in device_ids {
            let Some((_, mut device)) = self.devices.remove(&device_id) else {
                continue;
            };
            for cooler in device.coolers.values() {
                cooler.set_offline().await;
            }
            if let Some(live) = device.live.take() {
                live.shutdown().await;
            }
        }
        self.device_broadcaster.close_all(WatchEnd::Closed);
        info!("cooling service shut down");
    }
}
