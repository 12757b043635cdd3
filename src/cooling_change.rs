//! Per-device cooling write path.
//!
//! All writes to one device's cooling hardware funnel through a single
//! [`LiveDeviceState`] task: requests are queued as pooled [`CoolerChange`]
//! commands, drained in batches, and flushed with one `apply_changes` per
//! batch. The queue is bounded with drop-oldest overflow, so a stream of
//! rapid curve updates can never wedge a slow device; only the freshest
//! commands reach the hardware.

use std::sync::{Arc, Mutex};

use log::warn;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{self, Receiver, Sender, WatchEnd};
use crate::curve::PowerCurve;
use crate::driver::CoolingController;

/// Depth of one device's change queue.
pub(crate) const CHANGE_QUEUE_CAPACITY: usize = 20;

/// Recycled change boxes kept per device.
const FREE_LIST_CAPACITY: usize = 8;

/// What a queued change asks the driver to do.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChangeKind {
    Automatic,
    Manual { power: u8 },
    HardwareCurve { sensor_id: Uuid, curve: PowerCurve },
}

/// One staged command against one cooler.
#[derive(Debug)]
pub(crate) struct CoolerChange {
    pub(crate) cooler_id: Uuid,
    pub(crate) kind: ChangeKind,
}

impl CoolerChange {
    async fn execute(&self, controller: &dyn CoolingController) -> anyhow::Result<()> {
        match &self.kind {
            ChangeKind::Automatic => controller.set_automatic(self.cooler_id).await,
            ChangeKind::Manual { power } => {
                controller.set_manual_power(self.cooler_id, *power).await
            }
            ChangeKind::HardwareCurve { sensor_id, curve } => {
                controller
                    .set_hardware_curve(self.cooler_id, *sensor_id, curve)
                    .await
            }
        }
    }
}

/// Bounded free list of change boxes, owned by the service instance.
/// Steady-state mode churn allocates nothing.
#[derive(Default)]
pub(crate) struct ChangePool {
    free: Mutex<Vec<Box<CoolerChange>>>,
}

impl ChangePool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn acquire(&self, cooler_id: Uuid, kind: ChangeKind) -> Box<CoolerChange> {
        match self.free.lock().unwrap().pop() {
            Some(mut change) => {
                change.cooler_id = cooler_id;
                change.kind = kind;
                change
            }
            None => Box::new(CoolerChange { cooler_id, kind }),
        }
    }

    fn recycle(&self, change: Box<CoolerChange>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < FREE_LIST_CAPACITY {
            free.push(change);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// Sending half of a device's change queue. Cloned by every producer that
/// writes to the device: user requests and software-curve loops alike.
pub(crate) type ChangeSender = Sender<Box<CoolerChange>>;

/// The single writer task of one attached cooling device.
pub(crate) struct LiveDeviceState {
    sender: ChangeSender,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveDeviceState {
    pub(crate) fn new(controller: Arc<dyn CoolingController>, pool: Arc<ChangePool>) -> Self {
        let (sender, receiver) = channel::channel(CHANGE_QUEUE_CAPACITY);
        let run_task = tokio::spawn(Self::run(controller, pool, receiver));
        Self {
            sender,
            run_task: Mutex::new(Some(run_task)),
        }
    }

    pub(crate) fn sender(&self) -> ChangeSender {
        self.sender.clone()
    }

    async fn run(
        controller: Arc<dyn CoolingController>,
        pool: Arc<ChangePool>,
        mut receiver: Receiver<Box<CoolerChange>>,
    ) {
        loop {
            let first = match receiver.recv().await {
                Ok(change) => change,
                Err(_) => return,
            };
            let mut batch = vec![first];
            while let Some(change) = receiver.try_recv() {
                batch.push(change);
            }
            for change in batch {
                if let Err(err) = change.execute(controller.as_ref()).await {
                    warn!("cooler {} change failed: {err:#}", change.cooler_id);
                }
                pool.recycle(change);
            }
            // One flush per drained batch, whatever its size.
            if let Err(err) = controller.apply_changes().await {
                warn!("applying cooling changes failed: {err:#}");
            }
        }
    }

    /// Closes the queue and waits for in-flight changes to finish.
    pub(crate) async fn shutdown(&self) {
        self.sender.close(WatchEnd::Closed);
        let task = self.run_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
