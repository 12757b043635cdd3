//! Per-sensor watch state.
//!
//! Every announced sensor gets one [`SensorState`]. The state owns a small
//! run task that stays parked until the first watcher arrives, acquires
//! whatever the sensor's source needs (a scheduler lease, a seat in the
//! device's batched query, the driver's native stream) while watchers exist,
//! and releases it again when the last watcher leaves.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{bail, Result};
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::channel::{self, Receiver, Sender, WatchEnd};
use crate::driver::{GroupedQueryFeature, SensorDriver};
use crate::grouped_query::{GroupedQueryState, GroupedSlot, PendingOperation};
use crate::scheduler::{PollingScheduler, TickWait};
use crate::sensor::{SensorDataPoint, SensorInfo};

/// Queue depth of one watcher; a slow watcher loses oldest points first.
const WATCH_QUEUE_CAPACITY: usize = 10;

/// How a sensor's values are obtained while someone is watching.
pub(crate) enum SensorSource {
    /// Driver-internal value; not watchable.
    Internal,
    /// One `read_sensor` per scheduler tick.
    Polled {
        driver: Arc<dyn SensorDriver>,
        scheduler: Arc<PollingScheduler>,
    },
    /// Seat in the device's batched query.
    Grouped {
        state: Arc<GroupedQueryState>,
        slot: Arc<GroupedSlotState>,
    },
    /// Driver-native value stream.
    Streamed { driver: Arc<dyn SensorDriver> },
}

/// A grouped sensor's seat, shared between the sensor state and the device's
/// query loop. Publishes the batch's freshest value to the sensor's watchers.
pub(crate) struct GroupedSlotState {
    sensor_id: Uuid,
    feature: Arc<dyn GroupedQueryFeature>,
    pending: Mutex<PendingOperation>,
    broadcaster: Arc<Broadcaster<SensorDataPoint>>,
    last_value: Arc<Mutex<Option<SensorDataPoint>>>,
}

impl GroupedSlot for GroupedSlotState {
    fn sensor_id(&self) -> Uuid {
        self.sensor_id
    }

    fn pending_operation(&self) -> PendingOperation {
        *self.pending.lock().unwrap()
    }

    fn set_pending_operation(&self, op: PendingOperation) {
        *self.pending.lock().unwrap() = op;
    }

    fn refresh_data_point(&self, timestamp: SystemTime) {
        let Some(value) = self.feature.last_value(self.sensor_id) else {
            return;
        };
        let point = SensorDataPoint { timestamp, value };
        *self.last_value.lock().unwrap() = Some(point);
        self.broadcaster.push(point);
    }
}

pub(crate) struct SensorState {
    info: SensorInfo,
    device_id: Uuid,
    source: SensorSource,
    broadcaster: Arc<Broadcaster<SensorDataPoint>>,
    last_value: Arc<Mutex<Option<SensorDataPoint>>>,
    watch_signal: Notify,
    watch_token: Mutex<Option<CancellationToken>>,
    lifetime: CancellationToken,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl SensorState {
    pub(crate) fn new(device_id: Uuid, info: SensorInfo, source_of: impl FnOnce(&SensorStateParts) -> SensorSource) -> Arc<Self> {
        let broadcaster = Arc::new(Broadcaster::new());
        let last_value = Arc::new(Mutex::new(None));
        let parts = SensorStateParts {
            sensor_id: info.sensor_id,
            broadcaster: broadcaster.clone(),
            last_value: last_value.clone(),
        };
        let source = source_of(&parts);
        let state = Arc::new(Self {
            info,
            device_id,
            source,
            broadcaster,
            last_value,
            watch_signal: Notify::new(),
            watch_token: Mutex::new(None),
            lifetime: CancellationToken::new(),
            run_task: Mutex::new(None),
        });
        if state.is_watchable() {
            let task = tokio::spawn(Self::run(state.clone()));
            *state.run_task.lock().unwrap() = Some(task);
        }
        state
    }

    pub(crate) fn info(&self) -> &SensorInfo {
        &self.info
    }

    pub(crate) fn is_watchable(&self) -> bool {
        !matches!(self.source, SensorSource::Internal)
    }

    pub(crate) fn last_known_value(&self) -> Option<SensorDataPoint> {
        *self.last_value.lock().unwrap()
    }

    /// Opens a watch on this sensor. Fails synchronously for internal
    /// sensors, which have no host-observable value production.
    pub(crate) fn watch(self: &Arc<Self>) -> Result<SensorWatch> {
        if !self.is_watchable() {
            bail!(
                "sensor {} of device {} is internal and cannot be watched",
                self.info.sensor_id,
                self.device_id
            );
        }
        let (sink, receiver) = channel::channel(WATCH_QUEUE_CAPACITY);
        if self.broadcaster.register(sink.clone()) {
            let token = self.lifetime.child_token();
            *self.watch_token.lock().unwrap() = Some(token);
            self.watch_signal.notify_one();
        }
        Ok(SensorWatch {
            state: self.clone(),
            sink,
            receiver,
        })
    }

    fn stop_watching(&self) {
        if let Some(token) = self.watch_token.lock().unwrap().take() {
            token.cancel();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.lifetime.cancelled() => return,
                () = self.watch_signal.notified() => {}
            }
            let token = self.watch_token.lock().unwrap().clone();
            let Some(token) = token else { continue };
            debug!(
                "sensor {} of device {} now watched",
                self.info.sensor_id, self.device_id
            );
            match &self.source {
                SensorSource::Internal => return,
                SensorSource::Polled { driver, scheduler } => {
                    self.watch_polled(driver, scheduler, &token).await;
                }
                SensorSource::Grouped { state, slot } => {
                    let seat: Arc<dyn GroupedSlot> = slot.clone();
                    state.acquire(seat.clone());
                    token.cancelled().await;
                    state.release(&seat);
                }
                SensorSource::Streamed { driver } => {
                    self.watch_streamed(driver, &token).await;
                }
            }
            debug!(
                "sensor {} of device {} no longer watched",
                self.info.sensor_id, self.device_id
            );
        }
    }

    async fn watch_polled(
        &self,
        driver: &Arc<dyn SensorDriver>,
        scheduler: &Arc<PollingScheduler>,
        token: &CancellationToken,
    ) {
        let lease = scheduler.acquire();
        while lease.wait_for_tick(token).await == TickWait::Ticked {
            match driver.read_sensor(self.info.sensor_id).await {
                Ok(value) => self.publish(SensorDataPoint::now(value)),
                // Transient read failures skip the tick; the watch survives.
                Err(err) => warn!(
                    "reading sensor {} of device {} failed: {err:#}",
                    self.info.sensor_id, self.device_id
                ),
            }
        }
    }

    async fn watch_streamed(&self, driver: &Arc<dyn SensorDriver>, token: &CancellationToken) {
        let mut stream = match driver.stream_values(self.info.sensor_id).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    "opening stream for sensor {} of device {} failed: {err:#}",
                    self.info.sensor_id, self.device_id
                );
                token.cancelled().await;
                return;
            }
        };
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                item = stream.next() => match item {
                    Some(point) => self.publish(point),
                    None => {
                        // Driver ended the stream; nothing more will come
                        // until the watch is reopened.
                        token.cancelled().await;
                        return;
                    }
                },
            }
        }
    }

    fn publish(&self, point: SensorDataPoint) {
        *self.last_value.lock().unwrap() = Some(point);
        self.broadcaster.push(point);
    }

    /// Tears the state down, ending every live watch with `end`. Idempotent.
    pub(crate) async fn shutdown(&self, end: WatchEnd) {
        self.lifetime.cancel();
        let task = self.run_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.broadcaster.close_all(end);
    }
}

/// Pieces of a sensor state its source may need to share, handed to the
/// source constructor before the state itself exists.
pub(crate) struct SensorStateParts {
    pub(crate) sensor_id: Uuid,
    pub(crate) broadcaster: Arc<Broadcaster<SensorDataPoint>>,
    pub(crate) last_value: Arc<Mutex<Option<SensorDataPoint>>>,
}

impl SensorStateParts {
    /// Builds the grouped-source seat for this sensor.
    pub(crate) fn grouped_slot(&self, feature: Arc<dyn GroupedQueryFeature>) -> Arc<GroupedSlotState> {
        Arc::new(GroupedSlotState {
            sensor_id: self.sensor_id,
            feature,
            pending: Mutex::new(PendingOperation::None),
            broadcaster: self.broadcaster.clone(),
            last_value: self.last_value.clone(),
        })
    }
}

/// A live watch on one sensor. Receives timestamped data points until the
/// watch ends; the terminal error tells a device disconnect apart from an
/// ordinary close.
pub struct SensorWatch {
    state: Arc<SensorState>,
    sink: Sender<SensorDataPoint>,
    receiver: Receiver<SensorDataPoint>,
}

impl SensorWatch {
    pub async fn next(&mut self) -> Result<SensorDataPoint, WatchEnd> {
        self.receiver.recv().await
    }

    /// Sensor this watch observes.
    pub fn sensor_info(&self) -> &SensorInfo {
        self.state.info()
    }
}

impl Drop for SensorWatch {
    fn drop(&mut self) {
        if self.state.broadcaster.unregister(&self.sink) {
            self.state.stop_watching();
        }
        self.sink.close(WatchEnd::Closed);
    }
}
