//! Driver-facing traits and the device event bus.
//!
//! Hardware access lives behind these traits; the services in this crate only
//! ever talk to `Arc<dyn SensorDriver>` / `Arc<dyn CoolingController>` handles
//! delivered through [`DeviceEvent`]s on the [`DeviceEventBus`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cooler::CoolerInfo;
use crate::curve::PowerCurve;
use crate::sensor::{SensorDataPoint, SensorInfo, SensorValue};

/// Why a device notification was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// The device was already attached when the watcher subscribed.
    Enumeration,
    /// The device was attached just now.
    Addition,
    /// The device went away. Feature handles delivered earlier are dead.
    Removal,
    /// The device's announced features changed in place.
    Update,
}

/// Feature handles a device exposes. Absent features are `None`.
#[derive(Clone, Default)]
pub struct DeviceFeatures {
    pub sensors: Option<Arc<dyn SensorDriver>>,
    pub cooling: Option<Arc<dyn CoolingController>>,
}

/// A device arrival/removal/update notification.
#[derive(Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device_id: Uuid,
    pub features: DeviceFeatures,
}

/// Broadcast bus carrying [`DeviceEvent`]s from the discovery layer to the
/// sensor and cooling services.
pub struct DeviceEventBus {
    sender: broadcast::Sender<DeviceEvent>,
}

impl DeviceEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Publishes an event to all subscribers. Events published while no
    /// service is listening are dropped.
    pub fn publish(&self, event: DeviceEvent) {
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber receiving all events published afterwards.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }
}

impl Clone for DeviceEventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for DeviceEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Sensor access of one device.
#[async_trait]
pub trait SensorDriver: Send + Sync {
    /// Sensors this device announces. Stable for the lifetime of the handle.
    fn sensors(&self) -> Vec<SensorInfo>;

    /// Reads one polled sensor.
    async fn read_sensor(&self, sensor_id: Uuid) -> Result<SensorValue>;

    /// Opens the native value stream of a streamed sensor.
    async fn stream_values(&self, sensor_id: Uuid) -> Result<BoxStream<'static, SensorDataPoint>>;

    /// Batched-read feature, for devices where one transaction reads several
    /// sensors at once.
    fn grouped_query(&self) -> Option<Arc<dyn GroupedQueryFeature>> {
        None
    }
}

/// Per-device batched sensor reads.
///
/// Membership changes and `query_values` are always called from the single
/// per-device query task, never concurrently.
#[async_trait]
pub trait GroupedQueryFeature: Send + Sync {
    fn add_sensor(&self, sensor_id: Uuid);

    fn remove_sensor(&self, sensor_id: Uuid);

    /// Executes one batched read covering every added sensor.
    async fn query_values(&self) -> Result<()>;

    /// Value captured for `sensor_id` by the most recent `query_values`.
    fn last_value(&self, sensor_id: Uuid) -> Option<SensorValue>;
}

/// Cooling access of one device.
///
/// Set calls stage a change; nothing reaches the hardware until
/// `apply_changes`. The per-device writer loop batches staged changes and
/// flushes them in one transaction.
#[async_trait]
pub trait CoolingController: Send + Sync {
    /// Coolers this device announces. Stable for the lifetime of the handle.
    fn coolers(&self) -> Vec<CoolerInfo>;

    async fn set_automatic(&self, cooler_id: Uuid) -> Result<()>;

    async fn set_manual_power(&self, cooler_id: Uuid, power: u8) -> Result<()>;

    async fn set_hardware_curve(
        &self,
        cooler_id: Uuid,
        sensor_id: Uuid,
        curve: &PowerCurve,
    ) -> Result<()>;

    /// Flushes all staged changes to the hardware.
    async fn apply_changes(&self) -> Result<()>;
}
