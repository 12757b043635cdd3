//! Per-device batched sensor polling.
//!
//! Devices that read several sensors in one hardware transaction expose a
//! [`GroupedQueryFeature`](crate::driver::GroupedQueryFeature); this module
//! owns the single query task per such device. Sensors join and leave the
//! batch through [`GroupedQueryState::acquire`] / [`release`], and rapid
//! enable/disable flips are coalesced so the driver never sees a redundant
//! membership change.
//!
//! [`release`]: GroupedQueryState::release

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::{debug, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::driver::GroupedQueryFeature;
use crate::scheduler::{PollingLease, PollingScheduler, TickWait};

/// Requested-but-unapplied membership change for one slot.
///
/// Transitions happen under the state lock; the query task consumes them on
/// its next pass. Opposing requests collapse: a release right after an
/// acquire that the driver never saw leaves no driver call behind at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOperation {
    /// No change requested; the slot is live in the batch.
    None,
    /// Slot joined but the driver has not been told yet.
    EnableDisabled,
    /// Slot is leaving; the driver knows about it and must be told.
    DisableEnabled,
    /// Slot is leaving and the driver never knew about it.
    DisableNotEnabled,
}

/// One sensor's seat in the batch. Implemented by the grouped sensor state,
/// which publishes the freshly queried value to its watchers on refresh.
pub(crate) trait GroupedSlot: Send + Sync {
    fn sensor_id(&self) -> uuid::Uuid;

    fn pending_operation(&self) -> PendingOperation;

    fn set_pending_operation(&self, op: PendingOperation);

    /// Publishes the value captured by the latest batched query, stamped with
    /// the query time.
    fn refresh_data_point(&self, timestamp: SystemTime);
}

struct Inner {
    slots: Vec<Arc<dyn GroupedSlot>>,
    lease: Option<PollingLease>,
    activation: Option<CancellationToken>,
}

struct Shared {
    feature: Arc<dyn GroupedQueryFeature>,
    inner: Mutex<Inner>,
    enable: Notify,
    shutdown: CancellationToken,
}

/// Owner of one device's batched query loop.
pub(crate) struct GroupedQueryState {
    scheduler: Arc<PollingScheduler>,
    shared: Arc<Shared>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupedQueryState {
    pub(crate) fn new(
        feature: Arc<dyn GroupedQueryFeature>,
        scheduler: Arc<PollingScheduler>,
    ) -> Self {
        let shared = Arc::new(Shared {
            feature,
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                lease: None,
                activation: None,
            }),
            enable: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let run_task = tokio::spawn(Self::run(shared.clone()));
        Self {
            scheduler,
            shared,
            run_task: Mutex::new(Some(run_task)),
        }
    }

    /// Adds `slot` to the batch, taking a scheduler lease if this is the
    /// first live slot. An acquire that lands on a slot still pending
    /// removal simply cancels the removal.
    pub(crate) fn acquire(&self, slot: Arc<dyn GroupedSlot>) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner
            .slots
            .iter()
            .any(|s| s.sensor_id() == slot.sensor_id())
        {
            match slot.pending_operation() {
                PendingOperation::DisableEnabled => slot.set_pending_operation(PendingOperation::None),
                PendingOperation::DisableNotEnabled => {
                    slot.set_pending_operation(PendingOperation::EnableDisabled)
                }
                PendingOperation::None | PendingOperation::EnableDisabled => {}
            }
            return;
        }
        slot.set_pending_operation(PendingOperation::EnableDisabled);
        inner.slots.push(slot);
        if inner.lease.is_none() {
            inner.lease = Some(self.scheduler.acquire());
            inner.activation = Some(self.shared.shutdown.child_token());
            self.shared.enable.notify_one();
        }
    }

    /// Marks `slot` for removal from the batch. The driver call, if one is
    /// needed, happens on the query task's next pass.
    pub(crate) fn release(&self, slot: &Arc<dyn GroupedSlot>) {
        let inner = self.shared.inner.lock().unwrap();
        if !inner
            .slots
            .iter()
            .any(|s| s.sensor_id() == slot.sensor_id())
        {
            return;
        }
        match slot.pending_operation() {
            PendingOperation::EnableDisabled => {
                slot.set_pending_operation(PendingOperation::DisableNotEnabled)
            }
            PendingOperation::None => slot.set_pending_operation(PendingOperation::DisableEnabled),
            PendingOperation::DisableEnabled | PendingOperation::DisableNotEnabled => {}
        }
        // Wake a parked tick wait so an emptied batch releases its lease
        // promptly instead of on the next tick.
        if let Some(activation) = &inner.activation {
            activation.cancel();
        }
    }

    async fn run(shared: Arc<Shared>) {
        loop {
            tokio::select! {
                () = shared.shutdown.cancelled() => return,
                () = shared.enable.notified() => {}
            }

            debug!("grouped query loop activated");
            loop {
                // Membership pass: tell the driver about joins and leaves
                // requested since the previous pass, then publish the values
                // captured by the previous query to the surviving slots.
                {
                    let mut inner = shared.inner.lock().unwrap();
                    let mut index = 0;
                    while index < inner.slots.len() {
                        let slot = inner.slots[index].clone();
                        match slot.pending_operation() {
                            PendingOperation::EnableDisabled => {
                                shared.feature.add_sensor(slot.sensor_id());
                                slot.set_pending_operation(PendingOperation::None);
                                index += 1;
                            }
                            PendingOperation::DisableEnabled => {
                                shared.feature.remove_sensor(slot.sensor_id());
                                inner.slots.remove(index);
                            }
                            PendingOperation::DisableNotEnabled => {
                                inner.slots.remove(index);
                            }
                            PendingOperation::None => index += 1,
                        }
                    }
                    if inner.slots.is_empty() {
                        inner.lease = None;
                        inner.activation = None;
                        debug!("grouped query loop parked");
                        break;
                    }
                    let timestamp = SystemTime::now();
                    for slot in &inner.slots {
                        slot.refresh_data_point(timestamp);
                    }
                }

                if let Err(err) = shared.feature.query_values().await {
                    warn!("grouped sensor query failed: {err:#}");
                }

                let (lease_wait, activation) = {
                    let mut inner = shared.inner.lock().unwrap();
                    let Some(activation) = inner.activation.clone() else {
                        break;
                    };
                    if activation.is_cancelled() {
                        // A release fired mid-pass; replace the token and run
                        // another membership pass right away.
                        if shared.shutdown.is_cancelled() {
                            return;
                        }
                        inner.activation = Some(shared.shutdown.child_token());
                        continue;
                    }
                    // The lease stays owned by `inner`; waiting borrows it
                    // through a clone of the shared handle below.
                    (inner.lease.is_some(), activation)
                };
                if !lease_wait {
                    break;
                }
                match Self::wait_for_tick(&shared, &activation).await {
                    TickWait::Ticked => {}
                    TickWait::Cancelled => {
                        if shared.shutdown.is_cancelled() {
                            return;
                        }
                        let mut inner = shared.inner.lock().unwrap();
                        inner.activation = Some(shared.shutdown.child_token());
                    }
                    TickWait::SchedulerDown => {
                        // No tick will ever come again; exit rather than
                        // requerying the driver in a hot loop.
                        debug!("grouped query loop stopping, scheduler is gone");
                        let mut inner = shared.inner.lock().unwrap();
                        inner.lease = None;
                        inner.activation = None;
                        return;
                    }
                }
            }
        }
    }

    async fn wait_for_tick(shared: &Arc<Shared>, activation: &CancellationToken) -> TickWait {
        // Taking the lease out keeps the inner lock out of the await.
        let lease = {
            let mut inner = shared.inner.lock().unwrap();
            inner.lease.take()
        };
        let Some(lease) = lease else {
            return TickWait::Cancelled;
        };
        let outcome = lease.wait_for_tick(activation).await;
        let mut inner = shared.inner.lock().unwrap();
        inner.lease = Some(lease);
        outcome
    }

    /// Stops the query task. Slots left in the batch are dropped without
    /// further driver calls; the device is going away anyway.
    pub(crate) async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.enable.notify_one();
        let task = self.run_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut inner = self.shared.inner.lock().unwrap();
        inner.slots.clear();
        inner.lease = None;
        inner.activation = None;
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.shared.inner.lock().unwrap().slots.len()
    }
}
