//! Bounded delivery queues with drop-oldest overflow.
//!
//! Every watcher of a sensor stream and every per-device cooler change queue
//! is backed by one of these channels: a stuck or slow consumer must never
//! block a producer, and when the queue is full the correct thing to discard
//! is the oldest unconsumed item, not the newest one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Terminal reason observed by a receiver once its queue is closed.
///
/// Consumers such as the software-curve loop need to tell "the device backing
/// this stream disappeared" apart from "the watch was ended on purpose", so
/// closing a channel always carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// The watch was ended by its owner (unregistered or shut down).
    Closed,
    /// The device backing the watched entity disappeared. The entity may come
    /// back, so consumers are free to retry once it does.
    DeviceDisconnected,
}

impl std::fmt::Display for WatchEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEnd::Closed => write!(f, "watch closed"),
            WatchEnd::DeviceDisconnected => write!(f, "device disconnected"),
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    end: Option<WatchEnd>,
    dropped: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
}

/// Creates a bounded multi-producer single-consumer channel with drop-oldest
/// overflow and a terminal close reason.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "channel capacity must be non-zero");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            end: None,
            dropped: 0,
        }),
        notify: Notify::new(),
        capacity,
    });
    (Sender(shared.clone()), Receiver(shared))
}

/// Producer half. Cloneable; sends never block.
pub struct Sender<T>(Arc<Shared<T>>);

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Sender<T> {
    /// Enqueues a value, discarding the oldest queued item if the channel is
    /// full. Returns `false` if the channel is already closed.
    pub fn send(&self, value: T) -> bool {
        let mut state = self.0.state.lock().unwrap();
        if state.end.is_some() {
            return false;
        }
        if state.queue.len() == self.0.capacity {
            state.queue.pop_front();
            state.dropped += 1;
        }
        state.queue.push_back(value);
        drop(state);
        self.0.notify.notify_one();
        true
    }

    /// Closes the channel with the given terminal reason.
    ///
    /// Items already queued are still delivered before the receiver observes
    /// the end. The first close wins; later calls are no-ops.
    pub fn close(&self, end: WatchEnd) {
        let mut state = self.0.state.lock().unwrap();
        if state.end.is_none() {
            state.end = Some(end);
        }
        drop(state);
        self.0.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.0.state.lock().unwrap().end.is_some()
    }

    /// Identity comparison, used to unregister a specific sink from a
    /// broadcaster without requiring `T: PartialEq`.
    pub fn same_channel(&self, other: &Sender<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Consumer half. Single consumer by contract.
pub struct Receiver<T>(Arc<Shared<T>>);

impl<T> Receiver<T> {
    /// Receives the next value, waiting if the queue is empty.
    ///
    /// Once the channel is closed and drained, returns the close reason.
    pub async fn recv(&mut self) -> Result<T, WatchEnd> {
        loop {
            {
                let mut state = self.0.state.lock().unwrap();
                if let Some(value) = state.queue.pop_front() {
                    return Ok(value);
                }
                if let Some(end) = state.end {
                    return Err(end);
                }
            }
            self.0.notify.notified().await;
        }
    }

    /// Receives a value if one is immediately available.
    pub fn try_recv(&mut self) -> Option<T> {
        self.0.state.lock().unwrap().queue.pop_front()
    }

    /// Number of values currently queued.
    pub fn len(&self) -> usize {
        self.0.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of values discarded by drop-oldest overflow so far.
    pub fn dropped(&self) -> u64 {
        self.0.state.lock().unwrap().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut rx) = channel(4);
        assert!(tx.send(1));
        assert!(tx.send(2));
        assert!(tx.send(3));
        assert_eq!(rx.recv().await, Ok(1));
        assert_eq!(rx.recv().await, Ok(2));
        assert_eq!(rx.recv().await, Ok(3));
    }

    #[tokio::test]
    async fn overflow_discards_oldest() {
        let (tx, mut rx) = channel(20);
        for i in 0..25 {
            tx.send(i);
        }
        assert_eq!(rx.len(), 20);
        assert_eq!(rx.dropped(), 5);
        // The 20 most recent values survive.
        for expected in 5..25 {
            assert_eq!(rx.recv().await, Ok(expected));
        }
    }

    #[tokio::test]
    async fn close_reason_observed_after_drain() {
        let (tx, mut rx) = channel(4);
        tx.send(7);
        tx.close(WatchEnd::DeviceDisconnected);
        assert!(!tx.send(8));
        assert_eq!(rx.recv().await, Ok(7));
        assert_eq!(rx.recv().await, Err(WatchEnd::DeviceDisconnected));
        // Terminal state is sticky.
        assert_eq!(rx.recv().await, Err(WatchEnd::DeviceDisconnected));
    }

    #[tokio::test]
    async fn first_close_reason_wins() {
        let (tx, mut rx) = channel::<u32>(1);
        tx.close(WatchEnd::Closed);
        tx.close(WatchEnd::DeviceDisconnected);
        assert_eq!(rx.recv().await, Err(WatchEnd::Closed));
    }

    #[tokio::test]
    async fn recv_wakes_on_send() {
        let (tx, mut rx) = channel::<u32>(4);
        let reader = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.send(42);
        assert_eq!(reader.await.unwrap(), Ok(42));
    }

    #[tokio::test]
    async fn multiple_producers_share_the_queue() {
        let (tx1, mut rx) = channel(8);
        let tx2 = tx1.clone();
        tx1.send("a");
        tx2.send("b");
        assert_eq!(rx.recv().await, Ok("a"));
        assert_eq!(rx.recv().await, Ok("b"));
        assert!(tx1.same_channel(&tx2));
    }

    #[tokio::test]
    async fn try_recv_does_not_wait() {
        let (tx, mut rx) = channel(4);
        assert_eq!(rx.try_recv(), None);
        tx.send(1);
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), None);
    }
}
