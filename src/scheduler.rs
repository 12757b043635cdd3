//! Shared periodic tick source for all polled sensors.
//!
//! One scheduler exists per polling domain. Consumers take a [`PollingLease`]
//! while they need ticks; the underlying timer runs only while at least one
//! lease is outstanding, so an idle daemon costs nothing. Ticks are delivered
//! through a `tokio::sync::watch` generation counter, which gives every lease
//! its own cheap wakeup without per-tick allocation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct SchedulerState {
    leases: usize,
    enabled: bool,
    shut_down: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    enable: Notify,
    tick: watch::Sender<u64>,
    period: Duration,
}

impl Shared {
    fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }
}

/// Refcounted periodic tick source.
pub struct PollingScheduler {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
    /// Creates a scheduler ticking at `period` whenever at least one lease is
    /// outstanding. The timer starts disabled.
    pub fn new(period: Duration) -> Self {
        let (tick, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                leases: 0,
                enabled: false,
                shut_down: false,
            }),
            enable: Notify::new(),
            tick,
            period,
        });
        let shutdown = CancellationToken::new();
        let run_task = tokio::spawn(Self::run(shared.clone(), shutdown.clone()));
        Self {
            shared,
            shutdown,
            run_task: Mutex::new(Some(run_task)),
        }
    }

    async fn run(shared: Arc<Shared>, shutdown: CancellationToken) {
        loop {
            // Idle until the first lease enables the timer.
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                if shared.state.lock().unwrap().enabled {
                    break;
                }
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = shared.enable.notified() => {}
                }
            }

            debug!("polling timer enabled (period {:?})", shared.period);
            let mut ticks = interval_at(Instant::now() + shared.period, shared.period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticks.tick() => {
                        // Sweep: if the last lease went away since the
                        // previous tick, park the timer instead of ticking.
                        let still_enabled = {
                            let mut state = shared.state.lock().unwrap();
                            if state.leases == 0 {
                                state.enabled = false;
                            }
                            state.enabled
                        };
                        if !still_enabled {
                            debug!("polling timer disabled");
                            break;
                        }
                        shared.tick.send_modify(|generation| *generation = generation.wrapping_add(1));
                    }
                }
            }
        }
    }

    /// Acquires a lease, enabling the timer if it was idle.
    pub fn acquire(&self) -> PollingLease {
        let receiver = {
            let mut state = self.shared.state.lock().unwrap();
            state.leases += 1;
            if !state.enabled && !state.shut_down {
                state.enabled = true;
                self.shared.enable.notify_one();
            }
            self.shared.tick.subscribe()
        };
        PollingLease {
            shared: self.shared.clone(),
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Whether the underlying timer is currently enabled.
    pub fn is_ticking(&self) -> bool {
        self.shared.state.lock().unwrap().enabled
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        self.shared.state.lock().unwrap().leases
    }

    /// Stops the timer task and wakes every pending tick wait with `false`.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let task = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shut_down {
                None
            } else {
                state.shut_down = true;
                state.enabled = false;
                self.run_task.lock().unwrap().take()
            }
        };
        self.shutdown.cancel();
        self.shared.enable.notify_one();
        // Wake waiters so they observe the shutdown flag.
        self.shared.tick.send_modify(|generation| *generation = generation.wrapping_add(1));
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("polling scheduler shut down");
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Outcome of a [`PollingLease::wait_for_tick`] wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickWait {
    /// The next tick fired.
    Ticked,
    /// The caller's cancellation token fired first.
    Cancelled,
    /// The scheduler has been shut down; no tick will ever fire again.
    SchedulerDown,
}

/// A consumer's interest in scheduler ticks. Dropping the lease releases the
/// interest; when the last lease is gone the timer parks itself on the next
/// sweep.
pub struct PollingLease {
    shared: Arc<Shared>,
    receiver: tokio::sync::Mutex<watch::Receiver<u64>>,
}

impl PollingLease {
    /// Waits for the next tick.
    ///
    /// A shut-down scheduler is reported as [`TickWait::SchedulerDown`] so
    /// callers can tell it apart from their own cancellation; the wait never
    /// hangs on a disabled scheduler.
    pub async fn wait_for_tick(&self, cancel: &CancellationToken) -> TickWait {
        if self.shared.is_shut_down() {
            return TickWait::SchedulerDown;
        }
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            () = cancel.cancelled() => TickWait::Cancelled,
            changed = receiver.changed() => {
                if changed.is_err() || self.shared.is_shut_down() {
                    TickWait::SchedulerDown
                } else {
                    TickWait::Ticked
                }
            }
        }
    }
}

impl Drop for PollingLease {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            // Disable immediately; the run loop observes this on its next
            // sweep and parks the timer.
            state.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const SHORT: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn timer_enabled_iff_leases_outstanding() {
        let scheduler = PollingScheduler::new(SHORT);
        assert!(!scheduler.is_ticking());

        let a = scheduler.acquire();
        assert!(scheduler.is_ticking());
        let b = scheduler.acquire();
        assert!(scheduler.is_ticking());

        drop(a);
        assert!(scheduler.is_ticking());
        drop(b);
        assert!(!scheduler.is_ticking());

        // A fresh acquire after draining to zero re-enables the timer.
        let c = scheduler.acquire();
        assert!(scheduler.is_ticking());
        drop(c);
        assert!(!scheduler.is_ticking());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn leases_receive_ticks() {
        let scheduler = PollingScheduler::new(SHORT);
        let lease = scheduler.acquire();
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            assert_eq!(lease.wait_for_tick(&cancel).await, TickWait::Ticked);
        }

        drop(lease);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_wait() {
        // A long period guarantees the wait would otherwise park.
        let scheduler = PollingScheduler::new(Duration::from_secs(3600));
        let lease = scheduler.acquire();
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { lease.wait_for_tick(&cancel).await }
        });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), TickWait::Cancelled);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_pending_waits_instead_of_hanging() {
        let scheduler = PollingScheduler::new(Duration::from_secs(3600));
        let lease = scheduler.acquire();
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn(async move { lease.wait_for_tick(&cancel).await });
        tokio::task::yield_now().await;
        scheduler.shutdown().await;
        assert_eq!(waiter.await.unwrap(), TickWait::SchedulerDown);
    }

    #[tokio::test]
    async fn waits_after_shutdown_return_immediately() {
        let scheduler = PollingScheduler::new(SHORT);
        let lease = scheduler.acquire();
        scheduler.shutdown().await;

        // Every wait on a dead scheduler resolves at once, including repeat
        // calls that already consumed the wakeup generation.
        let cancel = CancellationToken::new();
        assert_eq!(lease.wait_for_tick(&cancel).await, TickWait::SchedulerDown);
        assert_eq!(lease.wait_for_tick(&cancel).await, TickWait::SchedulerDown);
    }

    #[tokio::test]
    async fn remaining_leases_keep_ticking_while_others_release() {
        let scheduler = PollingScheduler::new(SHORT);
        let survivor = scheduler.acquire();
        let transient = scheduler.acquire();
        let cancel = CancellationToken::new();

        assert_eq!(survivor.wait_for_tick(&cancel).await, TickWait::Ticked);
        drop(transient);
        // The survivor still gets ticks after the other lease is gone.
        assert_eq!(survivor.wait_for_tick(&cancel).await, TickWait::Ticked);
        assert_eq!(survivor.wait_for_tick(&cancel).await, TickWait::Ticked);

        drop(survivor);
        scheduler.shutdown().await;
    }

    proptest! {
        // Property from the service contract: after any prefix of an
        // acquire/release sequence, the timer is enabled iff the number of
        // outstanding leases is non-zero.
        #[test]
        fn refcount_matches_timer_state(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let scheduler = PollingScheduler::new(Duration::from_secs(3600));
                let mut held = Vec::new();
                for acquire in ops {
                    if acquire {
                        held.push(scheduler.acquire());
                    } else if !held.is_empty() {
                        held.pop();
                    }
                    assert_eq!(scheduler.is_ticking(), !held.is_empty());
                    assert_eq!(scheduler.lease_count(), held.len());
                }
                held.clear();
                assert!(!scheduler.is_ticking());
                scheduler.shutdown().await;
            });
        }
    }
}
