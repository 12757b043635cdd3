//! Lock-light fan-out of values to a dynamic set of watchers.
//!
//! A [`Broadcaster`] is embedded in every sensor state and in each service's
//! device-information feed. Registration and unregistration swap a
//! copy-on-write listener array under a narrow lock; pushes operate on a
//! point-in-time snapshot and never block, because each listener is the
//! sending half of a bounded drop-oldest queue.

use std::sync::{Arc, Mutex};

use crate::channel::{self, Receiver, Sender, WatchEnd};

/// Multi-consumer publish primitive.
///
/// `register` returns `true` when the sink is the first listener and
/// `unregister` returns `true` when it was the last one, which is what owners
/// use to start and stop the underlying watch.
pub struct Broadcaster<T> {
    listeners: Mutex<Arc<[Sender<T>]>>,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Arc::from(Vec::new())),
        }
    }

    /// Registers a sink. Returns `true` if it was the first listener.
    pub fn register(&self, sink: Sender<T>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let mut next: Vec<Sender<T>> = listeners.iter().cloned().collect();
        next.push(sink);
        *listeners = Arc::from(next);
        listeners.len() == 1
    }

    /// Unregisters a sink by channel identity. Returns `true` if it was the
    /// last listener. Unknown sinks are ignored.
    pub fn unregister(&self, sink: &Sender<T>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        if before == 0 {
            return false;
        }
        let next: Vec<Sender<T>> = listeners
            .iter()
            .filter(|s| !s.same_channel(sink))
            .cloned()
            .collect();
        let removed = next.len() < before;
        let now_empty = next.is_empty();
        *listeners = Arc::from(next);
        removed && now_empty
    }

    /// Captures the current listener set so that a producer can check
    /// [`BroadcastSnapshot::is_empty`] before doing the work of computing a
    /// value, and push to a stable set afterwards.
    pub fn snapshot(&self) -> BroadcastSnapshot<T> {
        BroadcastSnapshot(self.listeners.lock().unwrap().clone())
    }

    /// Pushes a value to every currently registered listener. Best effort: a
    /// full sink drops its oldest item, a closed sink is skipped.
    pub fn push(&self, value: T)
    where
        T: Clone,
    {
        self.snapshot().push(value);
    }

    /// Terminates every registered listener with the given reason and clears
    /// the listener set. Used on device removal so that watchers observe a
    /// distinguishable disconnect instead of a silent close.
    pub fn close_all(&self, end: WatchEnd) {
        let listeners = {
            let mut guard = self.listeners.lock().unwrap();
            std::mem::replace(&mut *guard, Arc::from(Vec::new()))
        };
        for sink in listeners.iter() {
            sink.close(end);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

/// Point-in-time view of a broadcaster's listeners.
pub struct BroadcastSnapshot<T>(Arc<[Sender<T>]>);

impl<T> BroadcastSnapshot<T> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&self, value: T)
    where
        T: Clone,
    {
        match self.0.len() {
            0 => {}
            1 => {
                self.0[0].send(value);
            }
            _ => {
                for sink in self.0.iter() {
                    sink.send(value.clone());
                }
            }
        }
    }
}

/// A live subscription to a service-level broadcaster, paired with the
/// initial snapshot contract of the service boundary: the caller first
/// consumes the snapshot it was handed, then reads this feed.
pub struct Subscription<T> {
    broadcaster: Arc<Broadcaster<T>>,
    sink: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Subscription<T> {
    /// Registers a new subscription on `broadcaster`.
    pub fn register(broadcaster: Arc<Broadcaster<T>>, capacity: usize) -> Self {
        let (sink, receiver) = channel::channel(capacity);
        broadcaster.register(sink.clone());
        Self {
            broadcaster,
            sink,
            receiver,
        }
    }

    /// Receives the next broadcast value.
    pub async fn next(&mut self) -> Result<T, WatchEnd> {
        self.receiver.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.broadcaster.unregister(&self.sink);
        self.sink.close(WatchEnd::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn values_reach_only_listeners_registered_at_push_time() {
        let broadcaster = Broadcaster::new();
        let (tx_a, mut rx_a) = channel(8);
        let (tx_b, mut rx_b) = channel(8);

        assert!(broadcaster.register(tx_a));
        broadcaster.push(1u32);

        assert!(!broadcaster.register(tx_b));
        broadcaster.push(2u32);

        assert_eq!(rx_a.recv().await, Ok(1));
        assert_eq!(rx_a.recv().await, Ok(2));
        // B only sees the value pushed after it registered, exactly once.
        assert_eq!(rx_b.try_recv(), Some(2));
        assert_eq!(rx_b.try_recv(), None);
    }

    #[test]
    fn register_and_unregister_report_first_and_last() {
        let broadcaster = Broadcaster::<u32>::new();
        let (tx_a, _rx_a) = channel(2);
        let (tx_b, _rx_b) = channel(2);

        assert!(broadcaster.register(tx_a.clone()));
        assert!(!broadcaster.register(tx_b.clone()));
        assert!(!broadcaster.unregister(&tx_a));
        assert!(broadcaster.unregister(&tx_b));
        // Unknown sink is a no-op.
        assert!(!broadcaster.unregister(&tx_a));
    }

    #[test]
    fn snapshot_reports_empty_before_any_listener() {
        let broadcaster = Broadcaster::<u32>::new();
        assert!(broadcaster.snapshot().is_empty());
        let (tx, _rx) = channel(2);
        broadcaster.register(tx);
        assert!(!broadcaster.snapshot().is_empty());
    }

    #[tokio::test]
    async fn close_all_signals_disconnect_to_every_listener() {
        let broadcaster = Broadcaster::new();
        let (tx_a, mut rx_a) = channel(2);
        let (tx_b, mut rx_b) = channel(2);
        broadcaster.register(tx_a);
        broadcaster.register(tx_b);
        broadcaster.push(5u32);
        broadcaster.close_all(WatchEnd::DeviceDisconnected);

        assert_eq!(rx_a.recv().await, Ok(5));
        assert_eq!(rx_a.recv().await, Err(WatchEnd::DeviceDisconnected));
        assert_eq!(rx_b.recv().await, Ok(5));
        assert_eq!(rx_b.recv().await, Err(WatchEnd::DeviceDisconnected));
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[tokio::test]
    async fn full_listener_never_blocks_the_producer() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = channel(2);
        broadcaster.register(tx);
        for i in 0..100u32 {
            broadcaster.push(i);
        }
        // The two most recent values survive the overflow.
        assert_eq!(rx.recv().await, Ok(98));
        assert_eq!(rx.recv().await, Ok(99));
    }

    #[tokio::test]
    async fn subscription_unregisters_on_drop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let sub = Subscription::register(broadcaster.clone(), 4);
        assert_eq!(broadcaster.listener_count(), 1);
        drop(sub);
        assert_eq!(broadcaster.listener_count(), 0);
        broadcaster.push(1u32); // must not panic with no listeners
    }
}
